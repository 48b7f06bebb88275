//! Delivery of host record changes to whoever observes the engine.

use alloc::sync::Arc;

use hostwatch_common::HostRecord;
use tokio::sync::{broadcast, mpsc};

/// Receives a snapshot every time a host record changes in a way observers care about.
///
/// Called from engine tasks; implementations must not block.
pub trait Notifier: Send + Sync {
    fn on_host_updated(&self, record: &Arc<HostRecord>);
}

impl Notifier for broadcast::Sender<Arc<HostRecord>> {
    fn on_host_updated(&self, record: &Arc<HostRecord>) {
        // Ignore send error: it only means nobody is subscribed right now.
        drop(self.send(Arc::clone(record)));
    }
}

impl Notifier for mpsc::UnboundedSender<Arc<HostRecord>> {
    fn on_host_updated(&self, record: &Arc<HostRecord>) {
        drop(self.send(Arc::clone(record)));
    }
}
