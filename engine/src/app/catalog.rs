//! Keeping a host's app catalog fresh.
//!
//! The poller only fetches while the host is online and paired. After a good,
//! non-empty catalog it slows down to the catalog period; anything else is
//! retried quickly.

use alloc::sync::Arc;
use core::time::Duration;

use hostwatch_common::{HostState, PairState, parse_app_catalog};
use tokio::{sync::Notify, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::app::{context::EngineContext, entry::HostEntry};

/// Whether an observed catalog should replace the known one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogVerdict {
    Accept,
    Ignore,
}

/// Hosts sometimes answer with an empty catalog while they are still starting up.
/// An empty catalog is therefore only believed once it was seen `threshold`
/// times in a row, and only once per streak.
#[derive(Debug, Clone)]
pub struct EmptyCatalogTracker {
    threshold: u32,
    consecutive_empty: u32,
}

impl EmptyCatalogTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_empty: 0,
        }
    }

    pub fn observe(&mut self, app_count: usize) -> CatalogVerdict {
        if app_count > 0 {
            self.consecutive_empty = 0;
            return CatalogVerdict::Accept;
        }
        self.consecutive_empty = self.consecutive_empty.saturating_add(1);
        if self.consecutive_empty == self.threshold {
            CatalogVerdict::Accept
        } else {
            CatalogVerdict::Ignore
        }
    }
}

/// What a single catalog cycle achieved, which decides the next delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CatalogCycle {
    /// A non-empty catalog was fetched.
    Fresh,
    /// Nothing to fetch from, or the fetch failed or came back empty.
    Retry,
}

/// Fetch the catalog once, under the host's network lock.
pub(crate) async fn catalog_cycle(
    entry: &HostEntry,
    ctx: &EngineContext,
    tracker: &mut EmptyCatalogTracker,
) -> CatalogCycle {
    let network = entry.lock_network().await;
    if network.retired {
        return CatalogCycle::Retry;
    }
    let record = entry.snapshot();
    let (Some(uuid), Some(address)) = (record.uuid.as_deref(), record.active_address.as_ref())
    else {
        return CatalogCycle::Retry;
    };
    if record.state != HostState::Online || record.pair_state != Some(PairState::Paired) {
        return CatalogCycle::Retry;
    }

    let raw = match ctx.catalog_source.fetch_app_catalog(address, &record).await {
        Ok(raw) if raw.trim().is_empty() => {
            warn!("Host {} returned a blank app catalog", record.label());
            return CatalogCycle::Retry;
        }
        Ok(raw) => raw,
        Err(e) => {
            debug!("Fetching app catalog of {} failed: {e}", record.label());
            return CatalogCycle::Retry;
        }
    };
    let apps = match parse_app_catalog(&raw) {
        Ok(apps) => apps,
        Err(e) => {
            warn!("Host {} sent an unreadable app catalog: {e}", record.label());
            return CatalogCycle::Retry;
        }
    };
    if tracker.observe(apps.len()) == CatalogVerdict::Ignore {
        debug!("Ignoring empty app catalog from {}", record.label());
        return CatalogCycle::Retry;
    }

    if let Err(e) = ctx.cache.write_app_catalog(uuid, &raw).await {
        error!("Failed to cache app catalog of {}: {e}", record.label());
    }
    if record.raw_app_catalog.as_deref() != Some(raw.as_str()) {
        debug!("App catalog of {} changed ({} apps)", record.label(), apps.len());
        let (snapshot, ()) = entry.update(|r| r.raw_app_catalog = Some(raw));
        ctx.notify(&snapshot);
    }
    if apps.is_empty() {
        CatalogCycle::Retry
    } else {
        CatalogCycle::Fresh
    }
}

/// Poll the app catalog of `entry` until cancelled. `wake` cuts the current wait short.
pub(crate) async fn run(
    entry: Arc<HostEntry>,
    ctx: Arc<EngineContext>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    debug!("Catalog poller started");
    let mut tracker = EmptyCatalogTracker::new(ctx.catalog.empty_threshold);
    loop {
        let delay: Duration = tokio::select! {
            () = cancel.cancelled() => break,
            cycle = catalog_cycle(&entry, &ctx, &mut tracker) => match cycle {
                CatalogCycle::Fresh => ctx.catalog.period(),
                CatalogCycle::Retry => ctx.catalog.retry(),
            },
        };
        tokio::select! {
            () = cancel.cancelled() => break,
            () = wake.notified() => debug!("Catalog poll requested"),
            () = sleep(delay) => {}
        }
    }
    debug!("Catalog poller stopped");
}
