mod config;
mod connection;
mod slots;
mod state;

pub use config::{ConnectionConfig, ConnectionId};
pub use connection::Connection;
pub use slots::Position;
pub use state::ConnectionState;
