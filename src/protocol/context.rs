//! Per-handshake key/value store shared by the phases of one pipeline.
//!
//! Keys are typed: a [`ContextKey<T>`] names a slot and fixes the type stored in it,
//! so reads never need a downcast at the call site.
//!
//! ```rust
//! use handshake_pipeline::protocol::context::{ContextKey, InitContext};
//!
//! const USERNAME: ContextKey<String> = ContextKey::new("username");
//!
//! let mut context = InitContext::new();
//! context.insert(USERNAME, "ada".to_string());
//! assert_eq!(context.get(USERNAME).unwrap(), "ada");
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use crate::error::{constants, ProtocolError, Result};

/// Name of a context slot holding a `T`
pub struct ContextKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ContextKey<T> {}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextKey({})", self.name)
    }
}

/// Values decoded during one handshake run
#[derive(Default)]
pub struct InitContext {
    values: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl InitContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`, returning whatever the slot held before
    pub fn insert<T: Any + Send + Sync>(&mut self, key: ContextKey<T>, value: T) -> Option<T> {
        self.values
            .insert(key.name, Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Borrow the value under `key`.
    ///
    /// A missing key is a phase-ordering bug and fails with
    /// [`ProtocolError::ContextKeyMissing`].
    pub fn get<T: Any>(&self, key: ContextKey<T>) -> Result<&T> {
        let value = self
            .values
            .get(key.name)
            .ok_or(ProtocolError::ContextKeyMissing(key.name))?;
        value.downcast_ref::<T>().ok_or_else(|| type_mismatch(key.name))
    }

    pub fn get_mut<T: Any>(&mut self, key: ContextKey<T>) -> Result<&mut T> {
        let value = self
            .values
            .get_mut(key.name)
            .ok_or(ProtocolError::ContextKeyMissing(key.name))?;
        value.downcast_mut::<T>().ok_or_else(|| type_mismatch(key.name))
    }

    /// Like [`InitContext::get`] but treats absence as a normal outcome
    pub fn try_get<T: Any>(&self, key: ContextKey<T>) -> Option<&T> {
        self.values.get(key.name)?.downcast_ref::<T>()
    }

    pub fn contains<T>(&self, key: ContextKey<T>) -> bool {
        self.values.contains_key(key.name)
    }

    /// Move the value out of the context
    pub fn remove<T: Any>(&mut self, key: ContextKey<T>) -> Result<T> {
        let value = self
            .values
            .remove(key.name)
            .ok_or(ProtocolError::ContextKeyMissing(key.name))?;
        value
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| type_mismatch(key.name))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl fmt::Debug for InitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("InitContext").field("keys", &keys).finish()
    }
}

fn type_mismatch(name: &'static str) -> ProtocolError {
    ProtocolError::InitializationError(format!("{} ({name})", constants::ERR_CONTEXT_TYPE))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const COUNT: ContextKey<u32> = ContextKey::new("count");
    const COUNT_AS_TEXT: ContextKey<String> = ContextKey::new("count");

    #[test]
    fn test_missing_key_fails_fast() {
        let context = InitContext::new();
        assert!(matches!(
            context.get(COUNT),
            Err(ProtocolError::ContextKeyMissing("count"))
        ));
        assert!(context.try_get(COUNT).is_none());
    }

    #[test]
    fn test_insert_replaces_and_returns_previous() {
        let mut context = InitContext::new();
        assert_eq!(context.insert(COUNT, 1), None);
        assert_eq!(context.insert(COUNT, 2), Some(1));
        *context.get_mut(COUNT).unwrap() += 1;
        assert_eq!(context.remove(COUNT).unwrap(), 3);
        assert!(context.is_empty());
    }

    #[test]
    fn test_type_mismatch_is_an_initialization_error() {
        let mut context = InitContext::new();
        context.insert(COUNT, 7);
        assert!(matches!(
            context.get(COUNT_AS_TEXT),
            Err(ProtocolError::InitializationError(_))
        ));
    }
}
