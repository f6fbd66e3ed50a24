pub mod diff;
pub mod replica;
pub mod session;
pub mod transport;

pub use diff::*;
pub use replica::*;
pub use session::*;
pub use transport::*;
