use serde::{
    Deserialize,
    Serialize,
};

use crate::core::hash::HashMap;

/// An unsigned integer, as carried by WAMP messages.
pub type Integer = u64;

/// A string-keyed dictionary of values.
pub type Dictionary = HashMap<String, Value>;

/// An ordered list of values.
pub type List = Vec<Value>;

/// A single value carried in a message field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(Integer),
    String(String),
    Bool(bool),
    Dictionary(Dictionary),
    List(List),
}

impl Value {
    /// The value as an integer, if it is one.
    pub fn integer(&self) -> Option<Integer> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// The value as a string, if it is one.
    pub fn string(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// The value as a boolean, if it is one.
    pub fn bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// The value as a dictionary, if it is one.
    pub fn dictionary(&self) -> Option<&Dictionary> {
        match self {
            Self::Dictionary(value) => Some(value),
            _ => None,
        }
    }

    /// The value as a list, if it is one.
    pub fn list(&self) -> Option<&List> {
        match self {
            Self::List(value) => Some(value),
            _ => None,
        }
    }
}

impl From<Integer> for Value {
    fn from(value: Integer) -> Self {
        Self::Integer(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Dictionary> for Value {
    fn from(value: Dictionary) -> Self {
        Self::Dictionary(value)
    }
}

impl From<List> for Value {
    fn from(value: List) -> Self {
        Self::List(value)
    }
}

/// Reads a boolean flag out of an options or details dictionary.
///
/// Missing or mistyped entries read as `false`.
pub fn flag(dictionary: &Dictionary, key: &str) -> bool {
    dictionary
        .get(key)
        .and_then(|value| value.bool())
        .unwrap_or(false)
}

#[cfg(test)]
mod types_test {
    use crate::core::types::{
        Dictionary,
        List,
        Value,
        flag,
    };

    #[test]
    fn reads_flags_leniently() {
        let dictionary = Dictionary::from_iter([
            ("a".to_owned(), Value::Bool(true)),
            ("b".to_owned(), Value::Bool(false)),
            ("c".to_owned(), Value::Integer(1)),
        ]);
        assert!(flag(&dictionary, "a"));
        assert!(!flag(&dictionary, "b"));
        assert!(!flag(&dictionary, "c"));
        assert!(!flag(&dictionary, "d"));
    }

    #[test]
    fn deserializes_untagged_values() {
        pretty_assertions::assert_eq!(
            serde_json::from_str::<Value>(r#"[1, "two", true, {"k": []}]"#).unwrap(),
            Value::List(List::from_iter([
                Value::Integer(1),
                Value::String("two".to_owned()),
                Value::Bool(true),
                Value::Dictionary(Dictionary::from_iter([(
                    "k".to_owned(),
                    Value::List(List::default())
                )])),
            ]))
        );
    }
}
