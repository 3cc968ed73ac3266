//! Connection handling: transport, framing, message data and the protocol
//! engine that drives them.

mod conn;
mod data;
mod framed;
mod stream;

pub use conn::Conn;
pub use data::DataReader;
pub use framed::Framed;
pub use stream::{Io, Mirror, Transport};
