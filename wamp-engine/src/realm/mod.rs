pub mod actor;
pub mod realm;
