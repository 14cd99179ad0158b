use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ConnectionId, Position};

/// Point-in-time view of a connection's bookkeeping, for logs and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub id: ConnectionId,
    pub depth: usize,
    pub next_position: Position,
    /// Open savepoints by depth.
    pub savepoints: BTreeMap<usize, Position>,
    /// Positions currently buffered, ascending.
    pub buffered: Vec<Position>,
}
