use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::executor::BackendEvent;

/// Delivers backend events to the run that owns the job.
#[derive(Debug, Clone, Default)]
pub struct EventRouter {
    routes: Arc<Mutex<HashMap<Uuid, mpsc::UnboundedSender<BackendEvent>>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_id: Uuid) -> mpsc::UnboundedReceiver<BackendEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id, tx);
        rx
    }

    pub fn unregister(&self, job_id: &Uuid) {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
    }

    /// Returns `true` if a run took the event.
    pub fn route(&self, event: BackendEvent) -> bool {
        let Some(job_id) = event.job_id() else {
            tracing::trace!("Ignoring event for an unmanaged resource");
            return false;
        };
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        match routes.get(&job_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                tracing::trace!(job_id = %job_id, "No run registered for event");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.routes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
