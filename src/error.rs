//! Error taxonomy for the browser pool.
//!
//! `new_page` is the only operation that surfaces errors to callers.
//! `retire` and `destroy` are infallible from the caller's perspective;
//! everything on their paths is logged and swallowed.

use thiserror::Error;

/// Error surfaced by the external [`crate::handle::Launcher`] implementation.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("failed to create browser profile directory: {0}")]
    ProfileDir(#[source] std::io::Error),

    #[error("browser executable not found")]
    ExecutableNotFound,

    #[error("launcher rejected: {0}")]
    Launcher(String),
}

/// Error surfaced by page-level operations on a [`crate::handle::BrowserHandle`]
/// or [`crate::handle::PageHandle`].
#[derive(Error, Debug)]
pub enum PageError {
    #[error("browser is not responding: {0}")]
    Unresponsive(String),

    #[error("page creation failed: {0}")]
    CreationFailed(String),

    #[error("page listing failed: {0}")]
    ListingFailed(String),

    #[error("close failed: {0}")]
    CloseFailed(String),
}

/// Error surfaced to `newPage` callers. All other pool operations are
/// infallible; internal failures on those paths are logged, not returned.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to launch browser instance: {0}")]
    LaunchFailed(#[from] LaunchError),

    #[error("failed to create page: {0}")]
    PageCreationFailed(#[from] PageError),

    #[error("pool has been destroyed")]
    Destroyed,
}
