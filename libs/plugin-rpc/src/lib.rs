pub mod cert;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod process;

pub use connection::{Connection, StreamReader};
pub use error::TransportError;
pub use frame::{Frame, WireError};
pub use handshake::{
    HandshakeInfo, CLIENT_CERT_KEY, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PROTOCOL_VERSION, PROTOCOL_VERSION_KEY,
};
pub use process::{PluginHost, PluginProcess};
