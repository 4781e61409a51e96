//! Shared application state for the HTTP server.

use std::sync::Arc;

use reliquary::core::status::RunStatus;
use reliquary::io::store::RunStore;
use reliquary::project::Project;
use reliquary::query::QueryService;
use reliquary::workflow::Engine;
use tokio::sync::broadcast;

/// Events broadcast to SSE clients after a mutation commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    RunChanged {
        work_item_id: String,
        status: RunStatus,
    },
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine<dyn RunStore>>,
    pub query: Arc<QueryService<dyn RunStore>>,
    /// Broadcast sender for run change events.
    pub event_tx: Arc<broadcast::Sender<ChangeEvent>>,
}

impl AppState {
    pub fn new(project: Project<dyn RunStore>) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            engine: project.engine,
            query: project.query,
            event_tx: Arc::new(event_tx),
        }
    }

    /// Notify subscribers; having none is not an error.
    pub fn notify(&self, work_item_id: &str, status: RunStatus) {
        let _ = self.event_tx.send(ChangeEvent::RunChanged {
            work_item_id: work_item_id.to_string(),
            status,
        });
    }
}
