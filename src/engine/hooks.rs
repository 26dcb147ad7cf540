//! Hook Dispatcher
//!
//! Delivers intermediate neuron values to user callbacks during
//! evaluation, synchronously and in place — never deferred. A neuron is
//! matched by its hook key (the trailing token of its wire name).
//! Callbacks see the computed value, cannot mutate the graph, and any
//! error they return propagates to the caller of evaluation.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::ir::Neuron;
use crate::Result;

/// A registered hook callback.
pub type HookFn = Box<dyn Fn(&Tensor) -> Result<()> + Send + Sync>;

/// Registry of hook callbacks keyed by neuron hook key.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Vec<HookFn>>,
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for every neuron whose hook key equals `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, callback: F)
    where
        F: Fn(&Tensor) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks
            .entry(name.into())
            .or_default()
            .push(Box::new(callback));
    }

    /// Remove every callback registered under `name`.
    pub fn deregister(&mut self, name: &str) {
        self.hooks.remove(name);
    }

    /// Whether no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Invoke all callbacks matching `neuron`, in registration order.
    pub(crate) fn dispatch(&self, neuron: &Neuron, value: &Tensor) -> Result<()> {
        if self.hooks.is_empty() {
            return Ok(());
        }
        if let Some(callbacks) = self.hooks.get(neuron.hook_key()) {
            for callback in callbacks {
                callback(value)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("names", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}
