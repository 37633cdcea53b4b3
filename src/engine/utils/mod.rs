use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Debug, Display};
use std::hash::Hash;

use num_traits::{Bounded, One, PrimInt, ToPrimitive, Unsigned, WrappingAdd, Zero};

/// A registry key backed by an unsigned integer id.
pub trait Key: Copy + Eq + Hash + Debug {
    type Id: PrimInt + Unsigned + WrappingAdd + Hash + Debug;
    fn new(id: Self::Id) -> Self;
    fn id(&self) -> Self::Id;
}

/// Macro for generating a new key type as a newtype wrapper.
macro_rules! key_type {
    ($name:ident, $id:ty) => {
        #[derive(serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
        pub struct $name($id);
        impl $crate::engine::utils::Key for $name {
            type Id = $id;
            fn new(id: Self::Id) -> Self {
                Self(id)
            }
            fn id(&self) -> Self::Id {
                self.0
            }
        }
    };
}
pub(crate) use key_type;

/// Issues unique keys from an incrementing counter and tracks which are in
/// use. A freed key is only handed out again after the counter wraps.
#[derive(Debug)]
pub struct KeyGenerator<K: Key> {
    last_id: K::Id,
    used_ids: HashSet<K::Id>,
}

impl<K> KeyGenerator<K>
where
    K: Key,
    K::Id: Bounded + Zero + One + Ord,
{
    pub fn new() -> Self {
        KeyGenerator {
            last_id: K::Id::max_value(),
            used_ids: HashSet::new(),
        }
    }

    pub fn next(&mut self) -> Result<K, KeyOverflowError> {
        if self.used_ids.len() >= K::Id::max_value().to_usize().unwrap_or(usize::MAX) {
            return Err(KeyOverflowError);
        }
        let mut id = self.last_id;
        loop {
            id = id.wrapping_add(&K::Id::one());
            if !self.used_ids.contains(&id) {
                break;
            }
        }
        self.used_ids.insert(id);
        self.last_id = id;
        Ok(K::new(id))
    }

    /// Marks an externally chosen key (from a loaded state) as occupied.
    pub fn reserve(&mut self, key: K) -> Result<(), KeyCollisionError<K>> {
        if self.used_ids.insert(key.id()) {
            self.last_id = self.last_id.max(key.id());
            Ok(())
        } else {
            Err(KeyCollisionError { key })
        }
    }

    pub fn free(&mut self, key: K) -> Result<(), InvalidKeyError<K>> {
        if self.used_ids.remove(&key.id()) {
            Ok(())
        } else {
            Err(InvalidKeyError { key })
        }
    }

    pub fn in_use(&self, key: K) -> bool {
        self.used_ids.contains(&key.id())
    }
}

impl<K> Default for KeyGenerator<K>
where
    K: Key,
    K::Id: Bounded + Zero + One + Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct KeyOverflowError;
impl Display for KeyOverflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "The max number of keys has been exceeded")
    }
}
impl Error for KeyOverflowError {}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidKeyError<K: Key> {
    pub key: K,
}
impl<K: Key> Display for InvalidKeyError<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key not present: {:?}", self.key)
    }
}
impl<K: Key> Error for InvalidKeyError<K> {}

#[derive(Debug, PartialEq, Eq)]
pub struct KeyCollisionError<K: Key> {
    pub key: K,
}
impl<K: Key> Display for KeyCollisionError<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key already present: {:?}", self.key)
    }
}
impl<K: Key> Error for KeyCollisionError<K> {}
