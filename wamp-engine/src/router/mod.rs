pub mod broker;
pub mod dealer;
pub mod router;
