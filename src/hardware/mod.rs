pub mod connection;
pub mod dispatcher;
pub mod mock;
pub mod protocol;
pub mod transport;

pub use connection::{discover_port, ConnError, ConnectionManager, ConnectionState};
pub use dispatcher::{DispatchError, Dispatcher, Response, SendOptions};
pub use protocol::{Command, LineClass, ParseError, StatusRecord};
pub use transport::{shared_transport, SerialTransport, SharedTransport, Transport, TransportError};
