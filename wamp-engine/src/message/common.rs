use anyhow::Error;

use crate::{
    core::{
        close::CloseReason,
        id::Id,
        types::{
            Dictionary,
            Integer,
            List,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        AbortMessage,
        ErrorMessage,
        GoodbyeMessage,
        Message,
    },
};

fn details_for_error(error: &Error) -> Dictionary {
    Dictionary::from_iter([("message".to_owned(), Value::String(error.to_string()))])
}

/// An ABORT message describing an error.
pub fn abort_message_for_error(error: &Error) -> Message {
    Message::Abort(AbortMessage {
        details: details_for_error(error),
        reason: Uri::for_error(error),
    })
}

/// A GOODBYE message with the given close reason.
pub fn goodbye_with_close_reason(close_reason: CloseReason) -> Message {
    Message::Goodbye(GoodbyeMessage {
        details: Dictionary::default(),
        reason: close_reason.uri(),
    })
}

/// The GOODBYE message acknowledging a peer's GOODBYE.
pub fn goodbye_and_out() -> Message {
    goodbye_with_close_reason(CloseReason::GoodbyeAndOut)
}

/// An ERROR message answering the given request.
pub fn error_for_request(message: &Message, error: &Error) -> Message {
    error_for(
        message.tag(),
        message.request_id().unwrap_or_default(),
        error,
    )
}

/// An ERROR message answering a request of the given type.
pub fn error_for(request_type: Integer, request: Id, error: &Error) -> Message {
    Message::Error(ErrorMessage {
        request_type,
        request,
        details: details_for_error(error),
        error: Uri::for_error(error),
        arguments: List::default(),
        arguments_keyword: Dictionary::default(),
    })
}

/// An ERROR message answering a request of the given type, carrying the full error chain as its
/// only positional argument.
pub fn error_with_trace_for(request_type: Integer, request: Id, error: &Error) -> Message {
    Message::Error(ErrorMessage {
        request_type,
        request,
        details: details_for_error(error),
        error: Uri::for_error(error),
        arguments: List::from_iter([Value::String(format!("{error:?}"))]),
        arguments_keyword: Dictionary::default(),
    })
}
