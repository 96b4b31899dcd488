use std::{
    fmt::Display,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
};

use serde::{
    Deserialize,
    Serialize,
    de::{
        Unexpected,
        Visitor,
    },
};
use thiserror::Error;

use crate::core::types::Value;

/// An integer ID, used for identification of sessions, requests, and resources.
///
/// IDs live in `[1, 2^53]` so that they survive a round trip through any serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Id(u64);

impl Id {
    /// The minimum allowable value of an ID.
    pub const MIN: Id = Id(1);

    /// The maximum allowable value of an ID.
    pub const MAX: Id = Id(1 << 53);

    /// The raw integer value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for Id {
    fn default() -> Self {
        Id::MIN
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Id> for Value {
    fn from(value: Id) -> Self {
        Value::Integer(value.0)
    }
}

/// Error for an ID being out of range.
#[derive(Debug, Error)]
#[error("{value} is out of range for IDs")]
pub struct IdOutOfRange {
    value: u64,
}

impl TryFrom<u64> for Id {
    type Error = IdOutOfRange;
    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value < Self::MIN.0 || value > Self::MAX.0 {
            Err(IdOutOfRange { value })
        } else {
            Ok(Id(value))
        }
    }
}

struct IdVisitor;

impl<'de> Visitor<'de> for IdVisitor {
    type Value = Id;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            "an unsigned integer in the range [{}, {}]",
            Id::MIN,
            Id::MAX
        )
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Id::try_from(v).map_err(|_| E::invalid_value(Unexpected::Unsigned(v), &self))
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_u64(IdVisitor)
    }
}

/// An ID allocator.
pub trait IdAllocator: Send + Sync {
    /// Generates a new ID.
    fn generate_id(&self) -> Id;
}

/// An ID allocator that draws IDs at random.
///
/// Used for global-scoped IDs, such as session IDs.
#[derive(Debug, Default)]
pub struct RandomIdAllocator {}

impl IdAllocator for RandomIdAllocator {
    fn generate_id(&self) -> Id {
        Id((rand::random::<u64>() & (Id::MAX.0 - 1)) + 1)
    }
}

/// An ID allocator that hands out IDs in increasing order, wrapping around at [`Id::MAX`].
///
/// Used for instance-scoped IDs: request IDs on a session, and subscription, publication,
/// registration, and invocation IDs on a router actor.
#[derive(Debug)]
pub struct SequentialIdAllocator {
    next: AtomicU64,
}

impl Default for SequentialIdAllocator {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(Id::MIN.0),
        }
    }
}

impl IdAllocator for SequentialIdAllocator {
    fn generate_id(&self) -> Id {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let next = if current >= Id::MAX.0 {
                Id::MIN.0
            } else {
                current + 1
            };
            match self
                .next
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Id(current),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod id_test {
    use crate::core::id::{
        Id,
        IdAllocator,
        RandomIdAllocator,
        SequentialIdAllocator,
    };

    #[test]
    fn fails_deserialization_out_of_range() {
        assert_matches::assert_matches!(serde_json::from_str::<Id>(r#"0"#), Err(err) => {
            assert!(err.to_string().contains("expected an unsigned integer in the range"));
        });
        assert_matches::assert_matches!(serde_json::from_str::<Id>(r#"9007199254740993"#), Err(err) => {
            assert!(err.to_string().contains("expected an unsigned integer in the range"));
        });
    }

    #[test]
    fn sequential_ids_increase_from_one() {
        let allocator = SequentialIdAllocator::default();
        let ids = (0..4).map(|_| allocator.generate_id()).collect::<Vec<_>>();
        pretty_assertions::assert_eq!(
            ids,
            vec![
                Id::try_from(1).unwrap(),
                Id::try_from(2).unwrap(),
                Id::try_from(3).unwrap(),
                Id::try_from(4).unwrap(),
            ]
        );
    }

    #[test]
    fn random_ids_stay_in_range() {
        let allocator = RandomIdAllocator::default();
        for _ in 0..1000 {
            let id = allocator.generate_id();
            assert!(id >= Id::MIN && id <= Id::MAX);
        }
    }
}
