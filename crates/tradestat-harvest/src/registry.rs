use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("operation {0} is already registered")]
    Duplicate(String),
    #[error("operation registry has been shut down")]
    ShutDown,
}

#[derive(Debug, Clone)]
pub struct OperationHandle {
    pub operation_id: String,
    pub created_at: DateTime<Utc>,
    generation: u64,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct Operations {
    active: HashMap<String, OperationHandle>,
    next_generation: u64,
    shut_down: bool,
}

/// In-flight harvests keyed by operation id.
///
/// Built once at startup and shared behind an `Arc`; entries of different operations never
/// interact.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    operations: Mutex<Operations>,
}

impl OperationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Operations> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a fresh cancellation handle. The returned lease releases it when dropped.
    pub fn register(self: &Arc<Self>, operation_id: &str) -> Result<OperationLease, RegistryError> {
        let token = CancellationToken::new();
        let generation = {
            let mut ops = self.lock();
            if ops.shut_down {
                return Err(RegistryError::ShutDown);
            }
            if ops.active.contains_key(operation_id) {
                return Err(RegistryError::Duplicate(operation_id.to_string()));
            }
            let generation = ops.next_generation;
            ops.next_generation += 1;
            ops.active.insert(
                operation_id.to_string(),
                OperationHandle {
                    operation_id: operation_id.to_string(),
                    created_at: Utc::now(),
                    generation,
                    token: token.clone(),
                },
            );
            generation
        };
        debug!(operation_id, "operation registered");
        Ok(OperationLease {
            registry: Arc::clone(self),
            operation_id: operation_id.to_string(),
            generation,
            token,
        })
    }

    /// Signals and removes the operation. `false` means no such operation is running.
    pub fn cancel(&self, operation_id: &str) -> bool {
        let handle = self.lock().active.remove(operation_id);
        match handle {
            Some(handle) => {
                handle.token.cancel();
                info!(operation_id, "operation cancelled");
                true
            }
            None => false,
        }
    }

    /// Idempotent removal by id.
    pub fn release(&self, operation_id: &str) {
        if self.lock().active.remove(operation_id).is_some() {
            debug!(operation_id, "operation released");
        }
    }

    /// Removes the entry only while it still belongs to the registration `generation` made.
    fn release_generation(&self, operation_id: &str, generation: u64) {
        let mut ops = self.lock();
        if ops.active.get(operation_id).is_some_and(|h| h.generation == generation) {
            ops.active.remove(operation_id);
            debug!(operation_id, "operation released");
        }
    }

    pub fn get(&self, operation_id: &str) -> Option<OperationHandle> {
        self.lock().active.get(operation_id).cloned()
    }

    pub fn operation_ids(&self) -> Vec<String> {
        self.lock().active.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels everything still running and refuses new registrations.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<OperationHandle> = {
            let mut ops = self.lock();
            ops.shut_down = true;
            ops.active.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &drained {
            handle.token.cancel();
        }
        if !drained.is_empty() {
            info!(cancelled = drained.len(), "operation registry shut down");
        }
        drained.len()
    }
}

/// Scoped ownership of a registered operation.
#[derive(Debug)]
pub struct OperationLease {
    registry: Arc<OperationRegistry>,
    operation_id: String,
    generation: u64,
    token: CancellationToken,
}

impl OperationLease {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for OperationLease {
    fn drop(&mut self) {
        self.registry.release_generation(&self.operation_id, self.generation);
    }
}
