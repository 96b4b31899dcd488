use std::time::Duration;

use anyhow::{
    Error,
    Result,
};

use crate::core::{
    error::BasicError,
    hash::HashSet,
    id::Id,
    invocation_policy::InvocationPolicy,
    types::{
        Dictionary,
        Value,
        flag,
    },
    uri::Uri,
};

fn read_ids(options: &Dictionary, key: &str) -> Result<Option<HashSet<Id>>> {
    let list = match options.get(key) {
        Some(Value::List(list)) => list,
        Some(_) => {
            return Err(BasicError::InvalidArgument(format!("{key} must be a list")).into());
        }
        None => return Ok(None),
    };
    list.iter()
        .map(|value| {
            value
                .integer()
                .and_then(|value| Id::try_from(value).ok())
                .ok_or_else(|| {
                    Error::new(BasicError::InvalidArgument(format!(
                        "{key} must contain session ids"
                    )))
                })
        })
        .collect::<Result<HashSet<Id>>>()
        .map(Some)
}

fn write_ids(options: &mut Dictionary, key: &str, ids: &Option<HashSet<Id>>) {
    if let Some(ids) = ids {
        let mut ids = ids.iter().cloned().collect::<Vec<_>>();
        ids.sort();
        options.insert(
            key.to_owned(),
            Value::List(ids.into_iter().map(Value::from).collect()),
        );
    }
}

fn read_timeout(dictionary: &Dictionary) -> Option<Duration> {
    dictionary
        .get("timeout")
        .and_then(|value| value.integer())
        .filter(|timeout| *timeout > 0)
        .map(Duration::from_millis)
}

/// Options for publishing an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// The broker should confirm the publication with PUBLISHED.
    pub acknowledge: bool,
    /// The publisher should not receive its own event.
    pub exclude_me: bool,
    /// Sessions that should not receive the event.
    pub exclude: Option<HashSet<Id>>,
    /// The only sessions that may receive the event.
    pub eligible: Option<HashSet<Id>>,
    /// The publisher's session ID should be disclosed to subscribers.
    pub disclose_me: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            acknowledge: false,
            exclude_me: true,
            exclude: None,
            eligible: None,
            disclose_me: false,
        }
    }
}

impl PublishOptions {
    /// Serializes the options for a PUBLISH message.
    pub fn to_dictionary(&self) -> Dictionary {
        let mut options = Dictionary::default();
        if self.acknowledge {
            options.insert("acknowledge".to_owned(), Value::Bool(true));
        }
        if !self.exclude_me {
            options.insert("exclude_me".to_owned(), Value::Bool(false));
        }
        if self.disclose_me {
            options.insert("disclose_me".to_owned(), Value::Bool(true));
        }
        write_ids(&mut options, "exclude", &self.exclude);
        write_ids(&mut options, "eligible", &self.eligible);
        options
    }

    /// Checks if a session should receive the event.
    pub fn allows(&self, publisher: Option<Id>, session: Id) -> bool {
        if self.exclude_me && publisher == Some(session) {
            return false;
        }
        if self
            .exclude
            .as_ref()
            .is_some_and(|exclude| exclude.contains(&session))
        {
            return false;
        }
        self.eligible
            .as_ref()
            .is_none_or(|eligible| eligible.contains(&session))
    }
}

impl TryFrom<&Dictionary> for PublishOptions {
    type Error = anyhow::Error;
    fn try_from(value: &Dictionary) -> Result<Self, Self::Error> {
        Ok(Self {
            acknowledge: flag(value, "acknowledge"),
            exclude_me: value
                .get("exclude_me")
                .and_then(|value| value.bool())
                .unwrap_or(true),
            exclude: read_ids(value, "exclude")?,
            eligible: read_ids(value, "eligible")?,
            disclose_me: flag(value, "disclose_me"),
        })
    }
}

/// Options for registering a procedure.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcedureOptions {
    /// How a callee should be selected for invocations.
    pub invocation_policy: InvocationPolicy,
    /// The caller's session ID should be disclosed to the callee.
    pub disclose_caller: bool,
}

impl ProcedureOptions {
    /// Serializes the options for a REGISTER message.
    pub fn to_dictionary(&self) -> Dictionary {
        let mut options = Dictionary::default();
        if self.invocation_policy != InvocationPolicy::Single {
            options.insert(
                "invoke".to_owned(),
                Value::from(Into::<&'static str>::into(self.invocation_policy)),
            );
        }
        if self.disclose_caller {
            options.insert("disclose_caller".to_owned(), Value::Bool(true));
        }
        options
    }
}

impl TryFrom<&Dictionary> for ProcedureOptions {
    type Error = anyhow::Error;
    fn try_from(value: &Dictionary) -> Result<Self, Self::Error> {
        let invocation_policy = match value.get("invoke") {
            Some(Value::String(policy)) => InvocationPolicy::try_from(policy.as_str())
                .map_err(|err| BasicError::InvalidArgument(err.to_string()))?,
            Some(_) => {
                return Err(BasicError::InvalidArgument("invoke must be a string".to_owned()).into());
            }
            None => InvocationPolicy::default(),
        };
        Ok(Self {
            invocation_policy,
            disclose_caller: flag(value, "disclose_caller"),
        })
    }
}

/// Options for calling a procedure.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallOptions {
    /// How long the callee may run before the call is canceled.
    pub timeout: Option<Duration>,
    /// The caller accepts progressive results.
    pub receive_progress: bool,
}

impl CallOptions {
    /// Serializes the options for a CALL message.
    pub fn to_dictionary(&self) -> Dictionary {
        let mut options = Dictionary::default();
        if let Some(timeout) = self.timeout {
            options.insert(
                "timeout".to_owned(),
                Value::Integer(timeout.as_millis() as u64),
            );
        }
        if self.receive_progress {
            options.insert("receive_progress".to_owned(), Value::Bool(true));
        }
        options
    }
}

impl From<&Dictionary> for CallOptions {
    fn from(value: &Dictionary) -> Self {
        Self {
            timeout: read_timeout(value),
            receive_progress: flag(value, "receive_progress"),
        }
    }
}

/// Details attached to an INVOCATION by the dealer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvocationDetails {
    /// Timeout the callee should enforce.
    pub timeout: Option<Duration>,
    /// The callee may send progressive results.
    pub receive_progress: bool,
    /// The caller's session, if disclosed.
    pub caller: Option<Id>,
    /// The procedure being invoked.
    pub procedure: Option<Uri>,
}

impl InvocationDetails {
    /// Serializes the details for an INVOCATION message.
    pub fn to_dictionary(&self) -> Dictionary {
        let mut details = Dictionary::default();
        if let Some(timeout) = self.timeout {
            details.insert(
                "timeout".to_owned(),
                Value::Integer(timeout.as_millis() as u64),
            );
        }
        if self.receive_progress {
            details.insert("receive_progress".to_owned(), Value::Bool(true));
        }
        if let Some(caller) = self.caller {
            details.insert("caller".to_owned(), Value::from(caller));
        }
        if let Some(procedure) = &self.procedure {
            details.insert("procedure".to_owned(), Value::from(procedure.to_string()));
        }
        details
    }
}

impl From<&Dictionary> for InvocationDetails {
    fn from(value: &Dictionary) -> Self {
        Self {
            timeout: read_timeout(value),
            receive_progress: flag(value, "receive_progress"),
            caller: value
                .get("caller")
                .and_then(|value| value.integer())
                .and_then(|value| Id::try_from(value).ok()),
            procedure: value
                .get("procedure")
                .and_then(|value| value.string())
                .and_then(|value| Uri::try_from(value).ok()),
        }
    }
}
