//! STARTTLS upgrade against a real rustls client.

#![allow(clippy::unwrap_used)]

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;

use common::{Mailbox, Peer, init_tracing};
use maildrop_smtp::{Config, Server};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn server_tls() -> Arc<rustls::ServerConfig> {
    let certs = CertificateDer::pem_file_iter(fixture("localhost.pem"))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = PrivateKeyDer::from_pem_file(fixture("localhost.key")).unwrap();
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    Arc::new(config)
}

fn connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    for cert in CertificateDer::pem_file_iter(fixture("ca.pem")).unwrap() {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn tls_server(mailbox: Mailbox) -> Arc<Server<Mailbox>> {
    let config = Config::builder("mx.example.com").tls(server_tls()).build();
    Arc::new(Server::new(mailbox, config))
}

#[tokio::test]
async fn test_starttls_upgrade() {
    init_tracing();
    let mailbox = Mailbox::default();
    let server = tls_server(mailbox.clone());
    let (client, io) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(server.serve_connection(io, None));

    let mut peer = Peer::new(client);
    peer.line().await;
    peer.send("EHLO client.example").await;
    assert_eq!(
        peer.reply().await,
        vec![
            "250-Hello client.example",
            "250-PIPELINING",
            "250-8BITMIME",
            "250-ENHANCEDSTATUSCODES",
            "250 STARTTLS",
        ]
    );
    assert_eq!(
        peer.cmd("AUTH PLAIN AHVzZXIAcGFzcw==").await,
        "538 5.7.11 Encryption required for requested authentication mechanism"
    );
    peer.cmd("MAIL FROM:<a@example.com>").await;
    assert_eq!(peer.cmd("STARTTLS").await, "220 2.0.0 Ready to start TLS");

    let plain = peer.io.into_inner();
    let name = ServerName::try_from("localhost").unwrap();
    let tls = connector().connect(name, plain).await.unwrap();
    let mut peer = Peer::new(tls);

    assert_eq!(
        peer.cmd("MAIL FROM:<a@example.com>").await,
        "502 5.5.1 Please introduce yourself first."
    );
    peer.send("EHLO client.example").await;
    assert_eq!(
        peer.reply().await,
        vec![
            "250-Hello client.example",
            "250-PIPELINING",
            "250-8BITMIME",
            "250-ENHANCEDSTATUSCODES",
            "250 AUTH LOGIN PLAIN",
        ]
    );
    assert_eq!(
        peer.cmd("RCPT TO:<b@example.com>").await,
        "502 5.5.1 Missing MAIL FROM command."
    );
    assert_eq!(peer.cmd("STARTTLS").await, "502 5.5.1 Already running in TLS");
    assert_eq!(
        peer.cmd("AUTH PLAIN AHVzZXIAcGFzcw==").await,
        "235 2.0.0 Authentication succeeded"
    );

    peer.cmd("MAIL FROM:<user@example.com>").await;
    peer.cmd("RCPT TO:<b@example.com>").await;
    peer.cmd("DATA").await;
    peer.send("secret\r\n.").await;
    assert_eq!(peer.line().await, "250 2.0.0 OK: queued");
    assert_eq!(peer.cmd("QUIT").await, "221 2.0.0 Goodnight and good luck");
    task.await.unwrap().unwrap();

    let deliveries = mailbox.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].user.as_deref(), Some("user"));
    assert_eq!(deliveries[0].server_name.as_deref(), Some("localhost"));
    assert_eq!(deliveries[0].body, b"secret\r\n");
}

#[tokio::test]
async fn test_failed_handshake_closes() {
    init_tracing();
    let server = tls_server(Mailbox::default());
    let (client, io) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(server.serve_connection(io, None));

    let mut peer = Peer::new(client);
    peer.line().await;
    peer.send("EHLO client.example").await;
    peer.reply().await;
    assert_eq!(peer.cmd("STARTTLS").await, "220 2.0.0 Ready to start TLS");

    peer.io
        .write_all(b"this is not a TLS client hello\r\n")
        .await
        .unwrap();
    let mut rest = Vec::new();
    peer.io.read_to_end(&mut rest).await.unwrap();
    assert!(rest.ends_with(b"550 5.0.0 Handshake error\r\n"));
    task.await.unwrap().unwrap();
}
