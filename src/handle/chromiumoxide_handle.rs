//! Default chromiumoxide-backed [`Launcher`]/[`BrowserHandle`]/[`PageHandle`].
//!
//! Finds or downloads a Chrome/Chromium executable, launches it under a
//! unique profile directory with anti-automation-detection flags, and
//! adapts its CDP event stream into this crate's collaborator traits so
//! the pool can launch any number of them independently.
//!
//! chromiumoxide's `Browser` does not expose the underlying OS process id,
//! so [`ChromiumBrowserHandle::process_id`] returns `None` and the
//! hard-kill/interrupt paths are no-ops here — the orderly `close()` path
//! is the real teardown mechanism for this launcher. This is precisely why
//! the pool core only depends on the `BrowserHandle` trait: a collaborator
//! backed by a real subprocess handle can implement `process_id` for real.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::target::{EventTargetCreated, EventTargetDestroyed, TargetId};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use chromiumoxide::Page;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, info, trace, warn};
use uuid::Uuid;

use crate::error::{LaunchError, PageError};
use crate::handle::{BrowserEvent, BrowserHandle, LaunchOptions, Launcher, PageHandle, TargetKind};

const CHROME_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// RAII guard for the profile directory, cleaned up unless `into_path` is
/// called. Mirrors `browser_setup.rs`'s `TempDirGuard`.
struct TempDirGuard {
    path: PathBuf,
    keep: bool,
}

impl TempDirGuard {
    fn new(path: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self { path, keep: false })
    }

    fn into_path(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        if !self.keep {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to clean up profile dir after launch failure");
            }
        }
    }
}

fn find_browser_executable() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    let paths: &[&str] = if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    } else if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
        ]
    };

    for path_str in paths {
        let path = PathBuf::from(path_str);
        if path.exists() {
            return Some(path);
        }
    }

    if !cfg!(target_os = "windows") {
        for cmd in &["chromium", "chromium-browser", "google-chrome", "chrome"] {
            if let Ok(output) = Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path_str.is_empty() {
                        return Some(PathBuf::from(path_str));
                    }
                }
            }
        }
    }

    None
}

async fn download_managed_browser() -> AnyhowResult<PathBuf> {
    info!("downloading managed Chromium browser");
    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(|| std::env::temp_dir().join(".cache"))
        .join("browser_pool/chromium");
    std::fs::create_dir_all(&cache_dir).context("failed to create browser cache directory")?;

    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .context("failed to build fetcher options")?,
    );
    let revision_info = fetcher.fetch().await.context("failed to fetch browser")?;
    Ok(revision_info.executable_path)
}

fn should_disable_sandbox() -> bool {
    std::path::Path::new("/.dockerenv").exists()
        || std::env::var("container").is_ok()
        || std::env::var("KUBERNETES_SERVICE_HOST").is_ok()
}

/// Default [`Launcher`]: finds or downloads a Chrome/Chromium executable,
/// creates a unique profile directory, and launches with anti-automation
/// detection flags applied.
#[derive(Default)]
pub struct ChromiumLauncher;

#[async_trait]
impl Launcher for ChromiumLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserHandle>, LaunchError> {
        let chrome_path = match find_browser_executable() {
            Some(path) => path,
            None => download_managed_browser()
                .await
                .map_err(|_| LaunchError::ExecutableNotFound)?,
        };

        let profile_dir = std::env::temp_dir().join(format!("browser_pool_chrome_{}", Uuid::new_v4()));
        let temp_guard = TempDirGuard::new(profile_dir).map_err(LaunchError::ProfileDir)?;
        let user_data_dir = temp_guard.path.clone();

        let mut config_builder = BrowserConfigBuilder::default()
            .request_timeout(Duration::from_secs(30))
            .window_size(1920, 1080)
            .user_data_dir(user_data_dir)
            .chrome_executable(chrome_path);

        config_builder = if options.is_effectively_headless() {
            config_builder.headless_mode(HeadlessMode::default())
        } else {
            config_builder.with_head()
        };

        config_builder = config_builder
            .arg(format!("--user-agent={CHROME_USER_AGENT}"))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-notifications")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-background-networking")
            .arg("--disable-backgrounding-occluded-windows")
            .arg("--metrics-recording-only")
            .arg("--password-store=basic")
            .arg("--use-mock-keychain")
            .arg("--mute-audio");

        if options.devtools {
            config_builder = config_builder.with_head();
        }
        for arg in &options.extra_args {
            config_builder = config_builder.arg(arg.clone());
        }

        if should_disable_sandbox() {
            config_builder = config_builder.arg("--no-sandbox").arg("--disable-setuid-sandbox");
        }

        let browser_config = config_builder
            .build()
            .map_err(|e| LaunchError::Launcher(e.to_string()))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| LaunchError::Launcher(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let target_kinds: Arc<StdMutex<HashMap<TargetId, TargetKind>>> =
            Arc::new(StdMutex::new(HashMap::new()));

        let created_listener = browser.event_listener::<EventTargetCreated>().await.ok();
        let destroyed_listener = browser.event_listener::<EventTargetDestroyed>().await.ok();

        if let Some(mut created) = created_listener {
            let kinds = Arc::clone(&target_kinds);
            tokio::spawn(async move {
                while let Some(event) = created.next().await {
                    let kind = classify_target_type(&event.target_info.r#type);
                    kinds
                        .lock()
                        .expect("target kind cache poisoned")
                        .insert(event.target_info.target_id.clone(), kind);
                }
            });
        }

        if let Some(mut destroyed) = destroyed_listener {
            let kinds = Arc::clone(&target_kinds);
            let tx = events_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = destroyed.next().await {
                    let kind = kinds
                        .lock()
                        .expect("target kind cache poisoned")
                        .remove(&event.target_id)
                        .unwrap_or(TargetKind::Unknown);
                    let _ = tx.send(BrowserEvent::TargetDestroyed(kind));
                }
            });
        }

        let handler_task = tokio::task::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(e) = h {
                    let msg = e.to_string();
                    let benign = msg.contains("data did not match any variant of untagged enum Message")
                        || msg.contains("Failed to deserialize WS response");
                    if benign {
                        trace!(error = %msg, "suppressed benign CDP serialization error");
                    } else {
                        error!(error = %msg, "browser handler error");
                    }
                }
            }
            let _ = events_tx.send(BrowserEvent::Disconnected);
            info!("browser handler task completed");
        });

        temp_guard.into_path();

        Ok(Box::new(ChromiumBrowserHandle {
            browser,
            handler_task,
            events_rx: StdMutex::new(Some(events_rx)),
        }))
    }
}

fn classify_target_type(target_type: &str) -> TargetKind {
    match target_type {
        "page" => TargetKind::Page,
        "other" | "browser" | "iframe" => TargetKind::Other,
        "service_worker" => TargetKind::ServiceWorker,
        "background_page" => TargetKind::BackgroundPage,
        _ => TargetKind::Unknown,
    }
}

pub struct ChromiumBrowserHandle {
    browser: Browser,
    handler_task: JoinHandle<()>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<BrowserEvent>>>,
}

#[async_trait]
impl BrowserHandle for ChromiumBrowserHandle {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>, PageError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| PageError::CreationFailed(e.to_string()))?;
        Ok(Arc::new(ChromiumPageHandle { page }))
    }

    async fn pages(&self) -> Result<Vec<u64>, PageError> {
        let pages = self
            .browser
            .pages()
            .await
            .map_err(|e| PageError::ListingFailed(e.to_string()))?;
        Ok(pages.iter().map(page_id).collect())
    }

    async fn close(&self) -> Result<(), PageError> {
        let mut browser = self.browser.clone();
        browser
            .close()
            .await
            .map_err(|e| PageError::CloseFailed(e.to_string()))?;
        Ok(())
    }

    fn process_id(&self) -> Option<u32> {
        None
    }

    fn interrupt(&self) {}

    fn hard_kill(&self) {
        self.handler_task.abort();
    }

    fn events(&self) -> BoxStream<'static, BrowserEvent> {
        let rx = self
            .events_rx
            .lock()
            .expect("events receiver mutex poisoned")
            .take();
        match rx {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => futures::stream::empty().boxed(),
        }
    }
}

fn page_id(page: &Page) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::hash::Hash::hash(&page.target_id().inner(), &mut hasher);
    std::hash::Hasher::finish(&hasher)
}

pub struct ChromiumPageHandle {
    page: Page,
}

#[async_trait]
impl PageHandle for ChromiumPageHandle {
    fn id(&self) -> u64 {
        page_id(&self.page)
    }

    async fn wait_for_crash(&self) {
        // chromiumoxide does not surface a page-level crash event distinct
        // from the browser-level `targetCrashed` CDP event; a page that
        // never crashes simply never resolves here, matching the trait's
        // documented contract.
        std::future::pending::<()>().await;
    }

    async fn close(&self) -> Result<(), PageError> {
        self.page
            .close()
            .await
            .map_err(|e| PageError::CloseFailed(e.to_string()))?;
        Ok(())
    }
}
