mod operation;
mod phase;

pub use operation::{CallbackResult, Operation};
pub use phase::Phase;
