use anyhow::Error;

use crate::core::error::{
    ChannelTransmittableError,
    InteractionError,
};

pub mod callee;
pub mod caller;
pub mod peer;
pub mod publisher;
pub mod subscriber;

/// The error delivered to every request still waiting when its session ends.
pub(crate) fn canceled_error() -> ChannelTransmittableError {
    ChannelTransmittableError::from(Error::new(InteractionError::Canceled))
}
