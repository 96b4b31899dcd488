//! # wamp-engine
//!
//! An asynchronous WAMP protocol engine. Routers and peers exchange already-decoded [`Message`]s
//! over an abstract [`Transport`], and every role (broker, dealer, publisher, subscriber, caller,
//! callee) is an actor registered into a [`Realm`].
//!
//! [`Message`]: crate::message::message::Message
//! [`Transport`]: crate::transport::transport::Transport
//! [`Realm`]: crate::realm::realm::Realm
pub mod core;
pub mod dispatch;
pub mod message;
pub mod peer;
pub mod realm;
pub mod router;
pub mod session;
pub mod stats;
pub mod transport;
