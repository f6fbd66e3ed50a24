pub mod checkpoint;
pub mod error;
pub mod message;
pub mod notification;
pub mod task;

pub use checkpoint::*;
pub use error::*;
pub use message::*;
pub use notification::*;
pub use task::*;

/// Schema-less keyed state produced by the execution engine. Kept as an
/// ordered JSON map so the sync layer stays agnostic to whatever the
/// engine's graph emits.
pub type StateMap = serde_json::Map<String, serde_json::Value>;
