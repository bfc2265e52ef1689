//! Per-browser bookkeeping.
//!
//! An `Instance` is never moved between `active` and `retired` by value in
//! a way that loses its counters — see [`crate::pool`] for the map-transfer
//! logic this type is deliberately passive about.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use crate::handle::BrowserHandle;

pub type InstanceId = u64;

/// Outcome of a pending launch, broadcast once to every task waiting on it.
///
/// `Failed` carries a rendered message rather than the original
/// [`crate::error::LaunchError`] because the error needs to reach an
/// unbounded number of concurrent waiters and `LaunchError` is not `Clone`.
#[derive(Debug, Clone)]
pub enum LaunchOutcome {
    Ready(Arc<dyn BrowserHandle>),
    Failed(Arc<str>),
}

/// The eventual Browser Handle backing an instance: may be pending, may
/// have failed, never both.
pub enum InstanceBrowser {
    Launching(watch::Receiver<Option<LaunchOutcome>>),
    Ready(Arc<dyn BrowserHandle>),
    Failed(Arc<str>),
}

pub struct Instance {
    pub id: InstanceId,
    pub browser: InstanceBrowser,
    pub active_pages: u32,
    pub total_pages: u32,
    pub last_page_opened_at: Instant,
    pub killed: bool,
    pub cache_dir: Option<PathBuf>,
}

impl Instance {
    pub fn launching(id: InstanceId, rx: watch::Receiver<Option<LaunchOutcome>>) -> Self {
        Self {
            id,
            browser: InstanceBrowser::Launching(rx),
            active_pages: 0,
            total_pages: 0,
            last_page_opened_at: Instant::now(),
            killed: false,
            cache_dir: None,
        }
    }

    /// `true` if this instance can currently accept a `newPage` allocation.
    pub fn is_eligible(&self, max_open_pages_per_instance: usize) -> bool {
        (self.active_pages as usize) < max_open_pages_per_instance
    }

    pub fn ready_handle(&self) -> Option<Arc<dyn BrowserHandle>> {
        match &self.browser {
            InstanceBrowser::Ready(handle) => Some(Arc::clone(handle)),
            _ => None,
        }
    }
}
