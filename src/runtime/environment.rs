use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::runtime::value::Value;

/// A lexical scope: a mutable name table plus an optional parent. Cloning an
/// `Environment` clones the handle, not the scope, so closures and tasks
/// share the same bindings.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<Scope>,
}

struct Scope {
    vars: Mutex<HashMap<String, Value>>,
    parent: Option<Environment>,
}

impl Environment {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Scope {
                vars: Mutex::new(HashMap::new()),
                parent: None,
            }),
        }
    }

    pub fn new_enclosed(parent: &Environment) -> Self {
        Self {
            inner: Arc::new(Scope {
                vars: Mutex::new(HashMap::new()),
                parent: Some(parent.clone()),
            }),
        }
    }

    /// Create or replace a binding in this scope.
    pub fn define(&self, name: &str, value: Value) {
        self.inner
            .vars
            .lock()
            .unwrap()
            .insert(name.to_string(), value);
    }

    /// Look a name up through the scope chain.
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.inner.vars.lock().unwrap().get(name) {
            return Some(value.clone());
        }
        self.inner.parent.as_ref()?.get(name)
    }

    /// Rebind the nearest existing binding. Returns false when the name is
    /// not bound anywhere in the chain.
    pub fn set(&self, name: &str, value: Value) -> bool {
        {
            let mut vars = self.inner.vars.lock().unwrap();
            if let Some(slot) = vars.get_mut(name) {
                *slot = value;
                return true;
            }
        }
        match &self.inner.parent {
            Some(parent) => parent.set(name, value),
            None => false,
        }
    }

    /// Look a name up in this scope only. Module member access goes through
    /// here so imports never leak the base environment's builtins.
    pub fn get_local(&self, name: &str) -> Option<Value> {
        self.inner.vars.lock().unwrap().get(name).cloned()
    }

    /// Copy of this scope's own bindings.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.vars.lock().unwrap().clone()
    }

    /// Identity: two handles over the same scope.
    pub fn same(&self, other: &Environment) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}
