pub mod catalog;
pub mod flow;
pub mod stack;

pub use catalog::FlowType;
pub use flow::{Flow, FlowError, FlowLifecycle};
pub use stack::{FlowStack, FlowStackError};
