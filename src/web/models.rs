//! The contract between the worker and model code.
//!
//! A model is a plain Rust type implementing [`ServableModel`]. It declares
//! its callable methods in a [`MethodTable`]; the worker only ever reaches
//! model code through that table, after `preprocess`.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Error raised by model code. Reported to the caller, never fatal to the worker.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ModelError {
    message: String,
}

impl ModelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for ModelError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// A callable model method: payload in, result out.
pub type Method<M> = fn(&mut M, Value) -> Result<Value, ModelError>;

/// Named methods a model exposes.
pub struct MethodTable<M> {
    entries: BTreeMap<String, Method<M>>,
}

impl<M> MethodTable<M> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, method: Method<M>) -> Self {
        self.entries.insert(name.to_string(), method);
        self
    }
}

impl<M> Default for MethodTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for MethodTable<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

/// Implemented by every servable model type.
pub trait ServableModel: Send + 'static {
    /// Set up the context the model serves in (devices, sessions, scratch
    /// state). Called once, after construction and before the first request.
    fn enter(&mut self) -> Result<(), ModelError> {
        Ok(())
    }

    /// Tear down what `enter` set up. Called once when serving ends.
    fn exit(&mut self) {}

    /// Runs before every method call. Identity by default.
    fn preprocess(&mut self, payload: Value) -> Result<Value, ModelError> {
        Ok(payload)
    }

    fn methods() -> MethodTable<Self>
    where
        Self: Sized;
}

/// Object-safe view of a loaded model, owned by exactly one worker.
pub trait ModelInstance: Send {
    /// Method names currently callable, sorted.
    fn capabilities(&self) -> Vec<String>;

    fn has_method(&self, method: &str) -> bool;

    fn enter(&mut self) -> Result<(), ModelError>;

    fn exit(&mut self);

    fn preprocess(&mut self, payload: Value) -> Result<Value, ModelError>;

    fn call(&mut self, method: &str, payload: Value) -> Result<Value, ModelError>;

    /// Narrow the callable set to `allowed`. Returns the names in `allowed`
    /// the model does not provide, leaving the table untouched in that case.
    fn restrict(&mut self, allowed: &[String]) -> Result<(), Vec<String>>;
}

impl fmt::Debug for dyn ModelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelInstance")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

struct Bound<M: ServableModel> {
    model: M,
    table: BTreeMap<String, Method<M>>,
}

impl<M: ServableModel> ModelInstance for Bound<M> {
    fn capabilities(&self) -> Vec<String> {
        self.table.keys().cloned().collect()
    }

    fn has_method(&self, method: &str) -> bool {
        self.table.contains_key(method)
    }

    fn enter(&mut self) -> Result<(), ModelError> {
        self.model.enter()
    }

    fn exit(&mut self) {
        self.model.exit();
    }

    fn preprocess(&mut self, payload: Value) -> Result<Value, ModelError> {
        self.model.preprocess(payload)
    }

    fn call(&mut self, method: &str, payload: Value) -> Result<Value, ModelError> {
        let f = self
            .table
            .get(method)
            .copied()
            .ok_or_else(|| ModelError::new(format!("Model does not have method {method}")))?;
        f(&mut self.model, payload)
    }

    fn restrict(&mut self, allowed: &[String]) -> Result<(), Vec<String>> {
        let missing: Vec<String> = allowed
            .iter()
            .filter(|name| !self.table.contains_key(name.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(missing);
        }
        self.table.retain(|name, _| allowed.contains(name));
        Ok(())
    }
}

/// Bind a model to its method table.
pub fn instance<M: ServableModel>(model: M) -> Box<dyn ModelInstance> {
    Box::new(Bound {
        model,
        table: M::methods().entries,
    })
}
