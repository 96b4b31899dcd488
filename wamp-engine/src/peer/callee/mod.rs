pub mod call_manager;
pub mod callee;
pub mod executor;
pub mod invocation;
