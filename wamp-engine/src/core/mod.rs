pub mod cancel;
pub mod close;
pub mod error;
pub mod features;
pub mod hash;
pub mod id;
pub mod invocation_policy;
pub mod options;
pub mod roles;
pub mod types;
pub mod uri;
