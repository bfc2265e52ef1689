//! Fake [`Launcher`]/[`BrowserHandle`]/[`PageHandle`] for deterministic pool
//! tests with no real Chrome process — the launcher is an external
//! collaborator, and the pool core must be testable without one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::{mpsc, Notify};

use crate::error::{LaunchError, PageError};
use crate::handle::{BrowserEvent, BrowserHandle, LaunchOptions, Launcher, PageHandle};

/// Shared control surface for a [`FakeLauncher`]'s browsers, so a test can
/// reach in and fire events / inspect launch counts after handing the
/// launcher to a pool.
#[derive(Default)]
pub struct FakeLauncherControl {
    pub launch_count: AtomicU32,
    pub fail_next_launch: AtomicBool,
    pub browsers: Mutex<Vec<Arc<FakeBrowserHandle>>>,
}

pub struct FakeLauncher {
    pub control: Arc<FakeLauncherControl>,
}

impl FakeLauncher {
    pub fn new() -> (Arc<Self>, Arc<FakeLauncherControl>) {
        let control = Arc::new(FakeLauncherControl::default());
        (
            Arc::new(Self {
                control: Arc::clone(&control),
            }),
            control,
        )
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, _options: &LaunchOptions) -> Result<Box<dyn BrowserHandle>, LaunchError> {
        self.control.launch_count.fetch_add(1, Ordering::SeqCst);
        if self.control.fail_next_launch.swap(false, Ordering::SeqCst) {
            return Err(LaunchError::Launcher("injected test failure".into()));
        }
        let browser = Arc::new(FakeBrowserHandle::new());
        self.control.browsers.lock().unwrap().push(Arc::clone(&browser));
        Ok(Box::new(FakeBrowserHandleBox(browser)))
    }
}

/// `Launcher::launch` must return an owned `Box<dyn BrowserHandle>`, but
/// tests want to keep their own `Arc` to the same fake browser to drive its
/// events. This thin wrapper forwards every call to the shared `Arc`.
struct FakeBrowserHandleBox(Arc<FakeBrowserHandle>);

#[async_trait]
impl BrowserHandle for FakeBrowserHandleBox {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>, PageError> {
        self.0.new_page().await
    }
    async fn pages(&self) -> Result<Vec<u64>, PageError> {
        self.0.pages().await
    }
    async fn close(&self) -> Result<(), PageError> {
        self.0.close().await
    }
    fn process_id(&self) -> Option<u32> {
        self.0.process_id()
    }
    fn interrupt(&self) {
        self.0.interrupt()
    }
    fn hard_kill(&self) {
        self.0.hard_kill()
    }
    fn events(&self) -> BoxStream<'static, BrowserEvent> {
        self.0.events()
    }
}

pub struct FakeBrowserHandle {
    next_page_id: AtomicU64,
    pages: Mutex<HashSet<u64>>,
    events_tx: mpsc::UnboundedSender<BrowserEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<BrowserEvent>>>,
    closed: AtomicBool,
    fail_next_page: AtomicBool,
    last_created_page: Mutex<Option<Arc<FakePageHandle>>>,
}

impl FakeBrowserHandle {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            next_page_id: AtomicU64::new(0),
            pages: Mutex::new(HashSet::from([0])), // the residual blank tab
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
            fail_next_page: AtomicBool::new(false),
            last_created_page: Mutex::new(None),
        }
    }

    pub fn fail_next_page_creation(&self) {
        self.fail_next_page.store(true, Ordering::SeqCst);
    }

    /// The concrete [`FakePageHandle`] most recently handed back by
    /// `new_page`, so a test can reach past the `Arc<dyn PageHandle>` the
    /// pool's public API returns and fire its crash event directly.
    pub fn last_page(&self) -> Option<Arc<FakePageHandle>> {
        self.last_created_page.lock().unwrap().clone()
    }

    pub fn emit_disconnected(&self) {
        let _ = self.events_tx.send(BrowserEvent::Disconnected);
    }

    pub fn emit_target_destroyed(&self, kind: crate::handle::TargetKind) {
        let _ = self.events_tx.send(BrowserEvent::TargetDestroyed(kind));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    /// Removes the residual blank page, simulating every real page closing.
    pub fn close_all_pages_except_blank(&self) {
        let mut pages = self.pages.lock().unwrap();
        pages.retain(|id| *id == 0);
    }

    async fn new_page(&self) -> Result<Arc<dyn PageHandle>, PageError> {
        if self.fail_next_page.swap(false, Ordering::SeqCst) {
            return Err(PageError::CreationFailed("injected test failure".into()));
        }
        let id = self.next_page_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.pages.lock().unwrap().insert(id);
        let page = Arc::new(FakePageHandle {
            id,
            crashed: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        });
        *self.last_created_page.lock().unwrap() = Some(Arc::clone(&page));
        Ok(page)
    }

    async fn pages(&self) -> Result<Vec<u64>, PageError> {
        Ok(self.pages.lock().unwrap().iter().copied().collect())
    }

    async fn close(&self) -> Result<(), PageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn process_id(&self) -> Option<u32> {
        Some(0)
    }

    fn interrupt(&self) {}

    fn hard_kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn events(&self) -> BoxStream<'static, BrowserEvent> {
        use futures::stream::StreamExt;
        use tokio_stream::wrappers::UnboundedReceiverStream;

        match self.events_rx.lock().unwrap().take() {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => futures::stream::empty().boxed(),
        }
    }
}

pub struct FakePageHandle {
    id: u64,
    crashed: Arc<Notify>,
    closed: AtomicBool,
}

impl FakePageHandle {
    pub fn crash(&self) {
        self.crashed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageHandle for FakePageHandle {
    fn id(&self) -> u64 {
        self.id
    }

    async fn wait_for_crash(&self) {
        self.crashed.notified().await;
    }

    async fn close(&self) -> Result<(), PageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
