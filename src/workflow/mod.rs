pub mod builder;
pub mod manager;
pub mod types;

pub use builder::WorkflowBuilder;
pub use manager::WorkflowManager;
pub use types::*;
