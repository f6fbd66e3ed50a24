pub mod card;
pub mod events;
pub mod jsonrpc;
pub mod params;
pub mod sse;

pub use card::*;
pub use events::*;
pub use jsonrpc::*;
pub use params::*;
pub use sse::*;
