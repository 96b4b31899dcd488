pub mod connection;
pub mod party;
pub mod session;
