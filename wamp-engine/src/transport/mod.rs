pub mod direct;
pub mod transport;
