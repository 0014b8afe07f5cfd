use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::DispatchSettings;
use crate::engine::{Directory, Dispatcher};
use crate::notify::{BroadcastNotifier, DispatchEvent, Notifier};
use crate::observability::metrics::Metrics;
use crate::store::Store;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub dispatcher: Dispatcher,
    pub directory: Directory,
    pub events_tx: broadcast::Sender<DispatchEvent>,
    pub metrics: Metrics,
}

impl AppState {
    /// Wires the engine to a [`BroadcastNotifier`] feeding `events_tx`.
    pub fn new(
        store: Arc<dyn Store>,
        settings: DispatchSettings,
        event_buffer_size: usize,
    ) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(event_buffer_size);
        let notifier = Arc::new(BroadcastNotifier::new(events_tx.clone()));
        Self::with_notifier(store, notifier, events_tx, settings)
    }

    pub fn with_notifier(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        events_tx: broadcast::Sender<DispatchEvent>,
        settings: DispatchSettings,
    ) -> Self {
        let metrics = Metrics::new();
        Self {
            dispatcher: Dispatcher::new(store.clone(), notifier, metrics.clone(), settings),
            directory: Directory::new(store.clone(), settings),
            store,
            events_tx,
            metrics,
        }
    }
}
