//! Free-list of interpreter instances for one plugin version.
//!
//! Growth policy: unbounded. [`InstancePool::take`] pops an idle instance or
//! builds a new one; [`InstancePool::put`] always keeps the instance. Under a
//! burst of N concurrent calls the pool ends up holding N instances and keeps
//! them. A reload replaces the whole pool, so instances of the old script
//! go away with the old pool once their callers return them.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::instance::{HandlerFactory, Interpreter};
use crate::error::{PluginError, PluginResult};

pub struct InstancePool {
    factory: HandlerFactory,
    idle: Mutex<Vec<Interpreter>>,
    created: AtomicUsize,
}

impl InstancePool {
    /// Pool seeded with an already-built instance.
    pub fn seeded(factory: HandlerFactory, warm: Interpreter) -> Self {
        Self {
            factory,
            idle: Mutex::new(vec![warm]),
            created: AtomicUsize::new(1),
        }
    }

    pub fn new(factory: HandlerFactory) -> Self {
        Self {
            factory,
            idle: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Exclusive instance for one call. A factory failure is terminal for
    /// the call.
    pub fn take(&self) -> PluginResult<Interpreter> {
        if let Some(instance) = self.idle.lock().pop() {
            return Ok(instance);
        }
        let (instance, _) = self
            .factory
            .build()
            .map_err(|e| PluginError::InterpreterUnavailable(format!("{}: {e}", self.factory.name())))?;
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(instance)
    }

    pub fn put(&self, instance: Interpreter) {
        self.idle.lock().push(instance);
    }

    /// Instances currently waiting in the free-list.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Instances built over the pool's lifetime.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}
