use weft_core::TaskManager;
use weft_wire::AgentCard;

mod http;

pub use http::{app_router, serve};

/// Shared state handed to every route: the task manager plus the
/// capability card advertised for discovery.
#[derive(Clone)]
pub struct AppState {
    pub manager: TaskManager,
    pub card: AgentCard,
}

impl AppState {
    pub fn new(manager: TaskManager, card: AgentCard) -> Self {
        Self { manager, card }
    }
}
