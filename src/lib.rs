//! A dynamically-sized pool of headless browser processes.
//!
//! Multiplexes page requests over a fleet of browsers bounded per-instance
//! but unbounded in count, recycles instances after a bounded amount of
//! use, optionally recycles on-disk HTTP caches across browser generations,
//! and guarantees orderly shutdown of every child process on interrupt.
//!
//! The concrete browser process launcher and its control channel are
//! external collaborators, consumed only through the [`handle`] module's
//! traits — see [`handle::Launcher`] and [`handle::BrowserHandle`]. A
//! default chromiumoxide-backed implementation is available behind the
//! `chromiumoxide` feature (on by default).
//!
//! ```ignore
//! use browser_pool::{config::PoolConfig, pool::BrowserPool};
//!
//! let config = PoolConfig::default();
//! let pool = BrowserPool::new(config);
//! let page = pool.new_page().await?;
//! pool.destroy().await;
//! ```

pub mod cache_recycler;
pub mod config;
pub mod error;
pub mod handle;
pub mod instance;
pub mod pool;

#[cfg(feature = "test-util")]
pub mod testing;

pub use config::PoolConfig;
pub use error::{LaunchError, PageError, PoolError};
pub use handle::{BrowserEvent, BrowserHandle, LaunchOptions, Launcher, PageHandle, TargetKind};
pub use instance::InstanceId;
pub use pool::{BrowserPool, PoolEvent, PoolStats};
