use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle event an operation can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// The operation was stored in a connection's buffer.
    Buffer,
    /// The enclosing outermost transaction committed (or there was none).
    Commit,
    /// The transaction owning the operation rolled back.
    Rollback,
    /// The operation left a connection's buffer.
    Remove,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Buffer, Phase::Commit, Phase::Rollback, Phase::Remove];

    pub(crate) fn slot(self) -> usize {
        match self {
            Phase::Buffer => 0,
            Phase::Commit => 1,
            Phase::Rollback => 2,
            Phase::Remove => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Buffer => "buffer",
            Phase::Commit => "commit",
            Phase::Rollback => "rollback",
            Phase::Remove => "remove",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
