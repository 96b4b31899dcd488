use anyhow::Error;
use thiserror::Error;

use crate::{
    core::{
        id::Id,
        types::Value,
        uri::Uri,
    },
    message::message::Message,
};

/// A basic error that occurs while processing a WAMP message.
#[derive(Debug, Error)]
pub enum BasicError {
    /// A generic resource was not found.
    ///
    /// WAMP defines standard URIs for not finding specific resource types. This error should only
    /// be used when the standard URI cannot be used.
    #[error("{0}")]
    NotFound(String),
    /// An invalid argument was passed.
    #[error("{0}")]
    InvalidArgument(String),
    /// The operation is not allowed based on process configuration.
    #[error("{0}")]
    NotAllowed(String),
    /// The operation is not allowed based on user permissions.
    #[error("{0}")]
    PermissionDenied(String),
    /// Some internal error occurred.
    #[error("{0}")]
    Internal(String),
}

impl BasicError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotAllowed(_) => "not_allowed",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Internal(_) => "internal",
        }
    }

    /// The error reason URI.
    pub fn uri(&self) -> Uri {
        Uri::from_known(format!("wamp.error.{}", self.uri_component()))
    }
}

/// An interaction error that occurs while processing a WAMP message.
///
/// Interaction errors are reserved for errors that peers must be able to parse easily.
#[derive(Debug, Error)]
pub enum InteractionError {
    /// The incoming message violates the WAMP protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The procedure being called does not exist.
    #[error("no such procedure")]
    NoSuchProcedure,
    /// The procedure being registered already exists.
    #[error("procedure already exists")]
    ProcedureAlreadyExists,
    /// The registration being referenced does not exist.
    #[error("no such registration")]
    NoSuchRegistration,
    /// The subscription being referenced does not exist for the session.
    #[error("not subscribed")]
    NoSuchSubscription,
    /// The realm being referenced does not exist.
    #[error("no such realm")]
    NoSuchRealm,
    /// No local role is compatible with the roles requested by the peer.
    #[error("no such role")]
    NoSuchRole,
    /// A topic or procedure URI was rejected.
    #[error("invalid uri")]
    InvalidUri,
    /// The call was canceled.
    #[error("canceled")]
    Canceled,
    /// The callee cannot accept the invocation right now.
    #[error("unavailable")]
    Unavailable,
}

impl InteractionError {
    /// The error reason URI.
    pub fn uri(&self) -> Uri {
        let uri = match self {
            Self::ProtocolViolation(_) => "wamp.error.protocol_violation",
            Self::NoSuchProcedure => "wamp.error.no_such_procedure",
            Self::ProcedureAlreadyExists => "wamp.error.procedure_already_exists",
            Self::NoSuchRegistration => "wamp.error.no_such_registration",
            Self::NoSuchSubscription => "not.subscribed",
            Self::NoSuchRealm => "wamp.error.no_such_realm",
            Self::NoSuchRole => "wamp.error.no_such_role",
            Self::InvalidUri => "wamp.error.invalid_uri",
            Self::Canceled => "wamp.error.canceled",
            Self::Unavailable => "wamp.error.unavailable",
        };
        Uri::from_known(uri)
    }
}

/// An error produced by a callee while running an invocation, independent of the procedure's own
/// failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvocationError {
    /// The invocation ran past its negotiated timeout and was canceled.
    #[error("invocation timed out")]
    Timeout,
    /// The invocation was canceled before producing a result.
    #[error("invocation canceled")]
    Canceled,
    /// The invocation could not be handed to an executor.
    #[error("no executor available for invocation")]
    NoExecutor,
}

impl InvocationError {
    /// The error reason URI.
    pub fn uri(&self) -> Uri {
        let uri = match self {
            Self::Timeout => "timeout.invocation.error",
            Self::Canceled => "cancelled.invocation.error",
            Self::NoExecutor => "no_executor.invocation.error",
        };
        Uri::from_known(uri)
    }
}

impl Uri {
    /// The error reason URI describing an error.
    ///
    /// Errors outside of the library's error types are reported as internal errors.
    pub fn for_error(error: &Error) -> Uri {
        if let Some(error) = error.downcast_ref::<InteractionError>() {
            error.uri()
        } else if let Some(error) = error.downcast_ref::<InvocationError>() {
            error.uri()
        } else if let Some(error) = error.downcast_ref::<BasicError>() {
            error.uri()
        } else {
            BasicError::Internal(String::default()).uri()
        }
    }
}

/// Creates an [`struct@Error`] from a URI error reason and message.
pub fn error_from_uri_reason_and_message(reason: Uri, message: String) -> Error {
    match reason.as_ref() {
        "wamp.error.not_found" => BasicError::NotFound(message).into(),
        "wamp.error.invalid_argument" => BasicError::InvalidArgument(message).into(),
        "wamp.error.not_allowed" => BasicError::NotAllowed(message).into(),
        "wamp.error.permission_denied" => BasicError::PermissionDenied(message).into(),
        "wamp.error.protocol_violation" => InteractionError::ProtocolViolation(message).into(),
        "wamp.error.no_such_procedure" => InteractionError::NoSuchProcedure.into(),
        "wamp.error.procedure_already_exists" => InteractionError::ProcedureAlreadyExists.into(),
        "wamp.error.no_such_registration" => InteractionError::NoSuchRegistration.into(),
        "not.subscribed" => InteractionError::NoSuchSubscription.into(),
        "wamp.error.no_such_realm" => InteractionError::NoSuchRealm.into(),
        "wamp.error.no_such_role" => InteractionError::NoSuchRole.into(),
        "wamp.error.invalid_uri" => InteractionError::InvalidUri.into(),
        "wamp.error.canceled" => InteractionError::Canceled.into(),
        "wamp.error.unavailable" => InteractionError::Unavailable.into(),
        "timeout.invocation.error" => InvocationError::Timeout.into(),
        "cancelled.invocation.error" => InvocationError::Canceled.into(),
        "no_executor.invocation.error" => InvocationError::NoExecutor.into(),
        _ => BasicError::Internal(message).into(),
    }
}

/// Extracts a URI error reason and message from a WAMP message.
pub fn extract_error_uri_reason_and_message(message: &Message) -> Result<(&Uri, &str), Error> {
    let reason = match message.reason() {
        Some(reason) => reason,
        None => return Err(Error::msg("message does not contain a reason uri")),
    };
    let message = match message.details().and_then(|details| details.get("message")) {
        Some(Value::String(message)) => message.as_str(),
        _ => "unknown error",
    };
    Ok((reason, message))
}

/// Constructs an [`struct@Error`] from a WAMP message.
///
/// Fails if the message does not describe any error.
pub fn error_from_message(message: &Message) -> Result<Error, Error> {
    let (uri, message) = extract_error_uri_reason_and_message(message)?;
    Ok(error_from_uri_reason_and_message(
        uri.clone(),
        message.to_owned(),
    ))
}

/// An error that can be transmitted over channels that require cloning.
#[derive(Debug, Clone)]
pub struct ChannelTransmittableError {
    pub reason: Uri,
    pub message: String,
    pub request_id: Option<Id>,
}

impl ChannelTransmittableError {
    /// Converts the error into a real Error object that can be returned out.
    pub fn into_error(self) -> Error {
        error_from_uri_reason_and_message(self.reason, self.message)
    }
}

impl TryFrom<&Message> for ChannelTransmittableError {
    type Error = Error;
    fn try_from(value: &Message) -> Result<Self, Self::Error> {
        let (reason, message) = extract_error_uri_reason_and_message(value)?;
        Ok(Self {
            reason: reason.to_owned(),
            message: message.to_owned(),
            request_id: value.request_id(),
        })
    }
}

impl From<&Error> for ChannelTransmittableError {
    fn from(value: &Error) -> Self {
        Self {
            reason: Uri::for_error(value),
            message: value.to_string(),
            request_id: None,
        }
    }
}

impl From<Error> for ChannelTransmittableError {
    fn from(value: Error) -> Self {
        Self::from(&value)
    }
}

/// Type alias for a channel-transmittable result.
pub type ChannelTransmittableResult<T> = Result<T, ChannelTransmittableError>;

#[cfg(test)]
mod error_test {
    use anyhow::Error;

    use crate::core::{
        error::{
            BasicError,
            ChannelTransmittableError,
            InteractionError,
            InvocationError,
            error_from_uri_reason_and_message,
        },
        uri::Uri,
    };

    #[test]
    fn maps_errors_to_uris() {
        pretty_assertions::assert_eq!(
            Uri::for_error(&InteractionError::NoSuchSubscription.into()).as_ref(),
            "not.subscribed"
        );
        pretty_assertions::assert_eq!(
            Uri::for_error(&InvocationError::Timeout.into()).as_ref(),
            "timeout.invocation.error"
        );
        pretty_assertions::assert_eq!(
            Uri::for_error(&BasicError::InvalidArgument("bad".to_owned()).into()).as_ref(),
            "wamp.error.invalid_argument"
        );
        pretty_assertions::assert_eq!(
            Uri::for_error(&Error::msg("anything else")).as_ref(),
            "wamp.error.internal"
        );
    }

    #[test]
    fn recovers_typed_errors_from_uris() {
        for error in [
            InvocationError::Timeout,
            InvocationError::Canceled,
            InvocationError::NoExecutor,
        ] {
            let recovered = error_from_uri_reason_and_message(error.uri(), String::default());
            assert_matches::assert_matches!(recovered.downcast_ref::<InvocationError>(), Some(recovered) => {
                pretty_assertions::assert_eq!(recovered, &error);
            });
        }
        assert_matches::assert_matches!(
            error_from_uri_reason_and_message(InteractionError::Unavailable.uri(), String::default())
                .downcast_ref::<InteractionError>(),
            Some(InteractionError::Unavailable)
        );
    }

    #[test]
    fn channel_errors_survive_conversion() {
        let error = ChannelTransmittableError::from(Error::new(BasicError::NotFound(
            "missing".to_owned(),
        )));
        assert_matches::assert_matches!(error.into_error().downcast::<BasicError>(), Ok(BasicError::NotFound(message)) => {
            pretty_assertions::assert_eq!(message, "missing");
        });
    }
}
