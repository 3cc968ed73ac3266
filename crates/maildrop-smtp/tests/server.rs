//! End-to-end tests driving a server over in-memory and TCP streams.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};

use common::{Mailbox, Peer, init_tracing};
use maildrop_smtp::{Config, Mirror, Server};

#[tokio::test]
async fn test_delivery_over_tcp() {
    init_tracing();
    let mailbox = Mailbox::default();
    let server = Arc::new(Server::new(mailbox.clone(), Config::new("mx.example.com")));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move {
        let (stream, remote) = listener.accept().await.unwrap();
        server.serve_connection(stream, Some(remote)).await
    });

    let mut peer = Peer::new(TcpStream::connect(addr).await.unwrap());
    assert_eq!(peer.line().await, "220 mx.example.com ESMTP Service Ready");
    peer.send("EHLO client.example").await;
    assert_eq!(peer.reply().await.len(), 4);
    peer.cmd("MAIL FROM:<alice@example.com>").await;
    peer.cmd("RCPT TO:<bob@example.com>").await;
    assert!(peer.cmd("DATA").await.starts_with("354 "));
    peer.send("Subject: test\r\n\r\nHello Bob\r\n.").await;
    assert_eq!(peer.line().await, "250 2.0.0 OK: queued");
    assert_eq!(peer.cmd("QUIT").await, "221 2.0.0 Goodnight and good luck");
    assert!(peer.is_closed().await);
    accept.await.unwrap().unwrap();

    let deliveries = mailbox.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].from, "alice@example.com");
    assert_eq!(deliveries[0].to, vec!["bob@example.com"]);
    assert_eq!(deliveries[0].body, b"Subject: test\r\n\r\nHello Bob\r\n");
}

#[tokio::test]
async fn test_pipelined_commands() {
    init_tracing();
    let mailbox = Mailbox::default();
    let server = Arc::new(Server::new(mailbox.clone(), Config::new("mx.example.com")));
    let (client, io) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(server.serve_connection(io, None));

    let mut peer = Peer::new(client);
    peer.line().await;
    peer.send(concat!(
        "EHLO client.example\r\n",
        "MAIL FROM:<a@example.com>\r\n",
        "RCPT TO:<b@example.com>\r\n",
        "RCPT TO:<c@example.com>\r\n",
        "DATA"
    ))
    .await;
    assert_eq!(peer.reply().await[0], "250-Hello client.example");
    assert!(peer.line().await.starts_with("250 2.0.0 Roger"));
    assert!(peer.line().await.starts_with("250 2.0.0 I'll make sure <b@"));
    assert!(peer.line().await.starts_with("250 2.0.0 I'll make sure <c@"));
    assert!(peer.line().await.starts_with("354 2.0.0"));

    peer.send(".leading dot\r\n.\r\nQUIT").await;
    assert_eq!(peer.line().await, "250 2.0.0 OK: queued");
    assert_eq!(peer.line().await, "221 2.0.0 Goodnight and good luck");
    task.await.unwrap().unwrap();

    let deliveries = mailbox.deliveries();
    assert_eq!(deliveries[0].to, vec!["b@example.com", "c@example.com"]);
    assert_eq!(deliveries[0].body, b"leading dot\r\n");
}

#[tokio::test]
async fn test_mirror_sees_both_directions() {
    init_tracing();
    let sink = Arc::new(Mutex::new(Vec::<u8>::new()));
    let mirror: Mirror = sink.clone();
    let config = Config::builder("mx.example.com").mirror(mirror).build();
    let server = Arc::new(Server::new(Mailbox::default(), config));
    let (client, io) = tokio::io::duplex(4096);
    let task = tokio::spawn(server.serve_connection(io, None));

    let mut peer = Peer::new(client);
    peer.line().await;
    peer.cmd("NOOP").await;
    peer.cmd("QUIT").await;
    task.await.unwrap().unwrap();

    let transcript = String::from_utf8(sink.lock().unwrap().clone()).unwrap();
    assert_eq!(
        transcript,
        concat!(
            "220 mx.example.com ESMTP Service Ready\r\n",
            "NOOP\r\n",
            "250 2.0.0 I have successfully done nothing\r\n",
            "QUIT\r\n",
            "221 2.0.0 Goodnight and good luck\r\n",
        )
    );
}

#[tokio::test]
async fn test_reject_connection() {
    init_tracing();
    let server = Arc::new(Server::new(Mailbox::default(), Config::new("mx.example.com")));
    let (client, io) = tokio::io::duplex(4096);
    server.reject_connection(io, None).await.unwrap();

    let mut peer = Peer::new(client);
    assert_eq!(peer.line().await, "421 4.4.5 Too busy. Try again later.");
    assert!(peer.is_closed().await);
}

#[tokio::test]
async fn test_client_disconnect_is_clean() {
    init_tracing();
    let server = Arc::new(Server::new(Mailbox::default(), Config::new("mx.example.com")));
    let (client, io) = tokio::io::duplex(4096);
    let task = tokio::spawn(server.serve_connection(io, None));

    let mut peer = Peer::new(client);
    peer.line().await;
    peer.cmd("EHLO client.example").await;
    drop(peer);
    task.await.unwrap().unwrap();
}
