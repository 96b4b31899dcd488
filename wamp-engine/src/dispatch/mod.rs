pub mod dispatcher;
pub mod flow;
pub mod pub_sub_flow;
pub mod rpc_flow;
pub mod session_flow;
