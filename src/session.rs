use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::SessionError;

/// The three session scopes visible from any invocation. For a top-level
/// invocation `Own` and `TopLevel` alias the same bag; for its direct
/// children `Parent` and `TopLevel` alias the same bag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Own,
    Parent,
    TopLevel,
}

type Slot = Arc<dyn Any + Send + Sync>;

/// Concurrency-safe keyed object store bound to one invocation's lifetime.
/// `get_or_put` is atomic: the factory runs under the bag's lock, at most
/// once per (namespace, key), and every caller observes the same object.
#[derive(Default)]
pub struct SessionBag {
    slots: Mutex<HashMap<(String, String), Slot>>,
}

impl SessionBag {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get_or_put<T, F>(
        &self,
        namespace: &str,
        key: &str,
        factory: F,
    ) -> Result<Arc<T>, SessionError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let mut slots = self.slots.lock().expect("session bag lock poisoned");
        let slot = slots
            .entry((namespace.to_string(), key.to_string()))
            .or_insert_with(|| Arc::new(factory()) as Slot)
            .clone();
        drop(slots);
        Arc::downcast::<T>(slot).map_err(|_| SessionError::TypeMismatch {
            namespace: namespace.to_string(),
            key: key.to_string(),
        })
    }

    pub fn get<T>(&self, namespace: &str, key: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let slots = self.slots.lock().expect("session bag lock poisoned");
        let slot = slots.get(&(namespace.to_string(), key.to_string()))?.clone();
        drop(slots);
        Arc::downcast::<T>(slot).ok()
    }
}
