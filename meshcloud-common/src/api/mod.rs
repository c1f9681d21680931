pub mod command;
pub mod domain;
pub mod events;
pub mod node_api;
pub mod tenant_api;

pub use command::{AckPayload, Command, CommandState, CommandType};
pub use domain::*;
pub use events::OrchestratorEvent;
