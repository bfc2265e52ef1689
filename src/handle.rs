//! External-collaborator interfaces.
//!
//! The browser launcher and the control-channel client are out of scope for
//! this crate (see the module-level docs in `lib.rs`); this module fixes the
//! seam the pool core consumes them through, as traits rather than prose.
//! A default chromiumoxide-backed implementation lives in
//! [`chromiumoxide_handle`] behind the `chromiumoxide` feature; tests use the
//! fakes in [`crate::testing`] instead.

#[cfg(feature = "chromiumoxide")]
pub mod chromiumoxide_handle;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{LaunchError, PageError};

/// Target kind as reported by the control channel's `targetdestroyed` event.
///
/// Only `Page` and `Other` affect the pool's `active_pages` bookkeeping; the
/// rest exist purely so callers can match exhaustively without the pool core
/// guessing at a closed set of CDP target types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Page,
    Other,
    ServiceWorker,
    BackgroundPage,
    Unknown,
}

impl TargetKind {
    /// Whether a `targetdestroyed` event of this kind decrements `active_pages`.
    pub fn counts_as_page(self) -> bool {
        matches!(self, TargetKind::Page | TargetKind::Other)
    }
}

/// Events emitted by a connected [`BrowserHandle`].
#[derive(Debug, Clone)]
pub enum BrowserEvent {
    /// The browser's control-channel connection was lost.
    Disconnected,
    /// A target (page or otherwise) was torn down.
    TargetDestroyed(TargetKind),
}

/// A navigable tab inside a browser.
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Opaque identity, stable for the lifetime of the page. Used to verify
    /// that `newPage` never hands back the same page object twice.
    fn id(&self) -> u64;

    /// Resolves once, the first time the page's fatal-error event fires.
    /// A page that never crashes simply never resolves this future.
    async fn wait_for_crash(&self);

    /// Best-effort close; the pool swallows errors from this path.
    async fn close(&self) -> Result<(), PageError>;
}

/// A connected, out-of-band control interface to a headless browser
/// subprocess.
///
/// Implementations are compared for `retire()` lookups by `Arc` pointer
/// identity, not by any field on the trait — see [`crate::pool::BrowserPool::retire`].
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    /// Open a new page/tab. Returns a shared handle: the pool keeps one
    /// clone to watch [`PageHandle::wait_for_crash`] in the background while
    /// the caller's clone is the one actually returned to them.
    async fn new_page(&self) -> Result<std::sync::Arc<dyn PageHandle>, PageError>;

    /// List currently open pages. Used by the reaper's empty-tab check.
    async fn pages(&self) -> Result<Vec<u64>, PageError>;

    /// Request an orderly close of the browser and all its pages.
    async fn close(&self) -> Result<(), PageError>;

    /// The OS process id backing this browser, if the browser has finished
    /// connecting. Used for the hard-kill path and interrupt delivery.
    fn process_id(&self) -> Option<u32>;

    /// Send an interrupt-class signal directly to the OS process. Swallows
    /// any error — the child may already be dead. A no-op if
    /// [`BrowserHandle::process_id`] is `None`.
    fn interrupt(&self);

    /// Send an unconditional hard-kill signal to the OS process. Swallows
    /// any error. A no-op if [`BrowserHandle::process_id`] is `None`.
    fn hard_kill(&self);

    /// A single consumable stream of lifecycle events. Implementations must
    /// support at most one live consumer; the instance-launch code consumes
    /// this exactly once, on a spawned task.
    fn events(&self) -> BoxStream<'static, BrowserEvent>;
}

/// Opaque-to-the-core launch options, cloned by the pool before each launch
/// and never mutated in place on the caller's copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchOptions {
    /// `None` means "unset", distinct from `Some(false)` — the
    /// disk-cache-recycling validation in [`crate::config::PoolConfig`]
    /// treats unset-without-devtools the same as headless.
    pub headless: Option<bool>,
    /// Whether devtools/headful-equivalent surface is enabled. An upstream
    /// Chromium bug makes disk-cache recycling unsupported in headless mode;
    /// `devtools: true` is treated as evidence of an effectively-headful run.
    pub devtools: bool,
    /// Extra command-line arguments appended verbatim. The pool appends a
    /// `--disk-cache-dir=<path>` entry here when cache recycling is active.
    pub extra_args: Vec<String>,
}

impl LaunchOptions {
    /// Whether this configuration is effectively headless, for the purposes
    /// of the disk-cache-recycling validation in [`crate::config::PoolConfig`].
    pub fn is_effectively_headless(&self) -> bool {
        match self.headless {
            Some(true) => true,
            Some(false) => false,
            None => !self.devtools,
        }
    }

    /// Returns a clone with `--disk-cache-dir=<path>` appended.
    pub fn with_disk_cache_dir(&self, path: &PathBuf) -> Self {
        let mut opts = self.clone();
        opts.extra_args
            .push(format!("--disk-cache-dir={}", path.display()));
        opts
    }
}

/// Factory producing a connected [`BrowserHandle`] from [`LaunchOptions`].
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserHandle>, LaunchError>;
}
