use std::fmt;
use std::marker::PhantomData;

use crate::error::{RuntimeError, RuntimeResult};

pub trait IdValueType: Sized {
    fn first() -> Self;
    fn next(v: Self) -> RuntimeResult<Self>;
}

macro_rules! impl_integer_id_value_type {
    ($type:ty) => {
        impl IdValueType for $type {
            fn first() -> Self {
                1
            }

            fn next(v: Self) -> RuntimeResult<Self> {
                v.checked_add(1)
                    .ok_or(RuntimeError::InternalError("ID overflow".to_string()))
            }
        }
    };
}

impl_integer_id_value_type!(u64);

pub trait IdType: Sized {
    type Value: IdValueType + From<Self> + Into<Self>;
}

macro_rules! define_id_type {
    ($name:ident, $value_type:ty) => {
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
        pub struct $name($value_type);

        impl IdType for $name {
            type Value = $value_type;
        }

        impl From<$value_type> for $name {
            fn from(id: $value_type) -> Self {
                Self(id)
            }
        }

        impl From<$name> for $value_type {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id_type!(JobId, u64);
define_id_type!(StageId, u64);
define_id_type!(EdgeId, u64);
define_id_type!(TaskGroupId, u64);
define_id_type!(TaskId, u64);

/// An id generator local to one plan construction or one master instance,
/// so that multiple job runs in the same process never share counters.
#[derive(Debug)]
pub struct IdGenerator<T: IdType> {
    next_value: T::Value,
    phantom: PhantomData<T>,
}

impl<T: IdType> IdGenerator<T>
where
    T::Value: Copy,
{
    pub fn new() -> Self {
        Self {
            next_value: T::Value::first(),
            phantom: PhantomData,
        }
    }

    pub fn next(&mut self) -> RuntimeResult<T> {
        let value = self.next_value;
        self.next_value = T::Value::next(value)?;
        Ok(value.into())
    }
}

impl<T: IdType> Default for IdGenerator<T>
where
    T::Value: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

/// The id of a remote executor process, assigned by the external resource
/// layer when the executor container is allocated.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ExecutorId(String);

impl ExecutorId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExecutorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ExecutorId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The id of one unit of intermediate data, derived from the producing
/// stage-boundary edge, the partition index along that edge, and an optional
/// sub-key for pre-split hashed outputs.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PartitionId {
    pub edge: EdgeId,
    pub index: usize,
    pub key: Option<usize>,
}

impl PartitionId {
    pub fn new(edge: EdgeId, index: usize) -> Self {
        Self {
            edge,
            index,
            key: None,
        }
    }

    pub fn with_key(edge: EdgeId, index: usize, key: usize) -> Self {
        Self {
            edge,
            index,
            key: Some(key),
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key {
            Some(key) => write!(f, "p{}-{}-{}", self.edge, self.index, key),
            None => write!(f, "p{}-{}", self.edge, self.index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generator_starts_at_one() {
        let mut generator = IdGenerator::<TaskGroupId>::new();
        assert_eq!(generator.next().unwrap(), TaskGroupId::from(1));
        assert_eq!(generator.next().unwrap(), TaskGroupId::from(2));
    }

    #[test]
    fn test_separate_generators_do_not_share_counters() {
        let mut a = IdGenerator::<StageId>::new();
        let mut b = IdGenerator::<StageId>::new();
        a.next().unwrap();
        a.next().unwrap();
        assert_eq!(b.next().unwrap(), StageId::from(1));
    }

    #[test]
    fn test_partition_id_display() {
        let id = PartitionId::new(EdgeId::from(4), 2);
        assert_eq!(id.to_string(), "p4-2");
        let id = PartitionId::with_key(EdgeId::from(4), 2, 7);
        assert_eq!(id.to_string(), "p4-2-7");
    }
}
