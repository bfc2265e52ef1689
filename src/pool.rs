//! The Pool Controller: page allocation, retirement, destroy, the periodic
//! reaper, the kill procedure, and the interrupt hook.
//!
//! Concurrency model: a single `tokio::sync::Mutex<PoolInner>` stands in
//! for a single logical execution context — all map mutations and counter
//! updates happen while holding it, and it is always released before an
//! await that talks to a browser (page creation, close, page listing) so
//! the ordering guarantees ("counters updated before page-creation is
//! awaited", "inserted into active before launch is awaited") hold without
//! the lock itself ever being held across a suspension point that depends
//! on a collaborator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::join_all;
use futures_util::StreamExt;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache_recycler::CacheRecycler;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::handle::{BrowserEvent, BrowserHandle, PageHandle};
use crate::instance::{Instance, InstanceBrowser, InstanceId, LaunchOutcome};

/// Grace delay between a retired instance's last page closing and tearing
/// the browser down, so the event-originating close can complete first.
const PAGE_CLOSE_KILL_TIMEOUT_MILLIS: u64 = 1000;

/// Max wait between requesting an orderly close and hard-killing the
/// underlying OS process.
const PROCESS_KILL_TIMEOUT_MILLIS: u64 = 5000;

/// Point-in-time snapshot of pool occupancy. No total-capacity or
/// utilization fields, since this pool has no fixed ceiling to report
/// against — saturation here always launches a new instance rather than
/// waiting for one to free up.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub active_instances: usize,
    pub retired_instances: usize,
    pub total_pages_served: u64,
    pub recycled_cache_dirs: usize,
}

/// Observability events, purely additive — the pool is fully functional
/// with no subscriber.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    InstanceLaunched(InstanceId),
    InstanceRetired(InstanceId),
    InstanceKilled(InstanceId),
    CacheDirRecycled(InstanceId),
}

struct PoolInner {
    active: HashMap<InstanceId, Instance>,
    retired: HashMap<InstanceId, Instance>,
    next_id: InstanceId,
    destroying: bool,
    total_pages_served: u64,
}

impl PoolInner {
    fn new() -> Self {
        Self {
            active: HashMap::new(),
            retired: HashMap::new(),
            next_id: 0,
            destroying: false,
            total_pages_served: 0,
        }
    }

    /// Smallest-id eligible active instance, or `None` if every active
    /// instance is saturated (or there are none). Deterministic tie-break
    /// among eligible candidates.
    fn select_eligible(&self, max_open_pages_per_instance: usize) -> Option<InstanceId> {
        self.active
            .values()
            .filter(|inst| inst.is_eligible(max_open_pages_per_instance))
            .map(|inst| inst.id)
            .min()
    }

    fn retire_instance(&mut self, id: InstanceId) -> bool {
        if let Some(instance) = self.active.remove(&id) {
            self.retired.insert(id, instance);
            true
        } else {
            false
        }
    }
}

enum NewPageWait {
    Ready(Arc<dyn BrowserHandle>),
    Pending(watch::Receiver<Option<LaunchOutcome>>),
}

/// A dynamically-sized pool of headless browser processes.
///
/// Always held behind an `Arc` — [`BrowserPool::new`] returns one directly
/// because the background reaper and interrupt tasks hold their own clone.
pub struct BrowserPool {
    inner: Mutex<PoolInner>,
    config: PoolConfig,
    cache_recycler: Option<CacheRecycler>,
    reaper: StdMutex<Option<JoinHandle<()>>>,
    interrupt: StdMutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<PoolEvent>,
}

impl BrowserPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let cache_recycler = if config.can_recycle_disk_cache() {
            Some(CacheRecycler::new())
        } else {
            None
        };
        let (events_tx, _) = broadcast::channel(256);

        let pool = Arc::new(Self {
            inner: Mutex::new(PoolInner::new()),
            config,
            cache_recycler,
            reaper: StdMutex::new(None),
            interrupt: StdMutex::new(None),
            events: events_tx,
        });

        let reaper_handle = tokio::spawn(Arc::clone(&pool).reaper_loop());
        *pool.reaper.lock().expect("reaper mutex poisoned") = Some(reaper_handle);

        let interrupt_handle = tokio::spawn(Arc::clone(&pool).interrupt_loop());
        *pool.interrupt.lock().expect("interrupt mutex poisoned") = Some(interrupt_handle);

        pool
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        PoolStats {
            active_instances: inner.active.len(),
            retired_instances: inner.retired.len(),
            total_pages_served: inner.total_pages_served,
            recycled_cache_dirs: self.cache_recycler.as_ref().map(CacheRecycler::len).unwrap_or(0),
        }
    }

    /// Allocates a page from an eligible active instance, launching a new
    /// one if none is eligible.
    pub async fn new_page(self: &Arc<Self>) -> Result<Arc<dyn PageHandle>, PoolError> {
        let (id, wait) = {
            let mut inner = self.inner.lock().await;
            if inner.destroying {
                return Err(PoolError::Destroyed);
            }

            let id = match inner.select_eligible(self.config.max_open_pages_per_instance) {
                Some(id) => id,
                None => self.reserve_new_instance(&mut inner),
            };

            let should_retire = {
                let instance = inner
                    .active
                    .get_mut(&id)
                    .expect("selected or just-reserved instance is in `active`");
                instance.last_page_opened_at = std::time::Instant::now();
                instance.total_pages += 1;
                instance.active_pages += 1;
                instance.total_pages >= self.config.retire_instance_after_request_count
            };
            inner.total_pages_served += 1;

            let wait = match &inner.active[&id].browser {
                InstanceBrowser::Ready(handle) => NewPageWait::Ready(Arc::clone(handle)),
                InstanceBrowser::Launching(rx) => NewPageWait::Pending(rx.clone()),
                InstanceBrowser::Failed(_) => {
                    unreachable!("a Failed instance is removed from `active` immediately")
                }
            };

            if should_retire && inner.retire_instance(id) {
                self.emit(PoolEvent::InstanceRetired(id));
            }

            (id, wait)
        };

        let handle = match wait {
            NewPageWait::Ready(handle) => handle,
            NewPageWait::Pending(rx) => self.await_launch(id, rx).await?,
        };

        match handle.new_page().await {
            Ok(page) => {
                self.spawn_page_crash_watcher(id, Arc::clone(&page));
                Ok(page)
            }
            Err(e) => {
                self.retire_by_id(id).await;
                Err(PoolError::PageCreationFailed(e))
            }
        }
    }

    /// Inserts a new `Launching` instance into `active` and spawns the
    /// launch task, before returning its id. Must be called while holding
    /// `inner`'s lock so the id is visible to callers and the reaper before
    /// the launch is awaited by anyone.
    fn reserve_new_instance(self: &Arc<Self>, inner: &mut PoolInner) -> InstanceId {
        let id = inner.next_id;
        inner.next_id += 1;

        let (tx, rx) = watch::channel(None);
        inner.active.insert(id, Instance::launching(id, rx));

        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.run_launch(id, tx).await });

        id
    }

    async fn run_launch(self: Arc<Self>, id: InstanceId, tx: watch::Sender<Option<LaunchOutcome>>) {
        let cache_dir = match &self.cache_recycler {
            Some(recycler) => match recycler.take_or_create() {
                Ok(dir) => Some(dir),
                Err(e) => {
                    warn!(instance_id = id, error = %e, "failed to prepare disk-cache directory, launching without one");
                    None
                }
            },
            None => None,
        };

        let options = match &cache_dir {
            Some(dir) => self.config.launch_options.with_disk_cache_dir(dir),
            None => self.config.launch_options.clone(),
        };

        match self.config.launcher.launch(&options).await {
            Ok(boxed) => {
                let handle: Arc<dyn BrowserHandle> = Arc::from(boxed);

                // The instance may have been retired (a normal, expected
                // transition — e.g. it already crossed
                // `retire_instance_after_request_count` on the `new_page`
                // call that reserved it) by the time the launch resolves,
                // so it can be sitting in `retired` rather than `active`.
                // That is not teardown: only `destroying`, or the id being
                // absent from *both* maps (removed by `destroy` draining
                // them), means this launch lost the race against shutdown.
                let destroying = {
                    let mut inner = self.inner.lock().await;
                    if inner.destroying {
                        true
                    } else if let Some(instance) = inner
                        .active
                        .get_mut(&id)
                        .or_else(|| inner.retired.get_mut(&id))
                    {
                        instance.browser = InstanceBrowser::Ready(Arc::clone(&handle));
                        instance.cache_dir = cache_dir.clone();
                        false
                    } else {
                        // Removed by `destroy` having already drained both maps.
                        true
                    }
                };

                if destroying {
                    let _ = tx.send(Some(LaunchOutcome::Failed(Arc::from(
                        "pool destroyed while this instance was launching",
                    ))));
                    let _ = handle.close().await;
                    if let Some(dir) = cache_dir {
                        self.delete_cache_dir(&dir).await;
                    }
                    return;
                }

                let _ = tx.send(Some(LaunchOutcome::Ready(Arc::clone(&handle))));
                self.spawn_event_consumer(id, handle);
                info!(instance_id = id, "browser instance launched");
                self.emit(PoolEvent::InstanceLaunched(id));
            }
            Err(e) => {
                warn!(instance_id = id, error = %e, "browser launch failed");
                {
                    let mut inner = self.inner.lock().await;
                    if inner.active.remove(&id).is_none() {
                        inner.retired.remove(&id);
                    }
                }
                if let Some(dir) = cache_dir {
                    self.delete_cache_dir(&dir).await;
                }
                let _ = tx.send(Some(LaunchOutcome::Failed(Arc::from(e.to_string()))));
            }
        }
    }

    /// Waits for a pending launch to resolve using a `watch` channel rather
    /// than `tokio::sync::Notify`: `watch::Receiver::borrow` always reflects
    /// the latest sent value regardless of when the receiver started
    /// waiting, which avoids the missed-wakeup window a bare `Notify` has
    /// between observing "still launching" and registering to be woken.
    async fn await_launch(
        &self,
        id: InstanceId,
        mut rx: watch::Receiver<Option<LaunchOutcome>>,
    ) -> Result<Arc<dyn BrowserHandle>, PoolError> {
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return match outcome {
                    LaunchOutcome::Ready(handle) => Ok(handle),
                    LaunchOutcome::Failed(msg) => Err(PoolError::LaunchFailed(
                        crate::error::LaunchError::Launcher(msg.to_string()),
                    )),
                };
            }
            if rx.changed().await.is_err() {
                warn!(instance_id = id, "launch task ended without reporting an outcome");
                return Err(PoolError::Destroyed);
            }
        }
    }

    fn spawn_event_consumer(self: &Arc<Self>, id: InstanceId, handle: Arc<dyn BrowserHandle>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut events = handle.events();
            while let Some(event) = events.next().await {
                match event {
                    BrowserEvent::Disconnected => pool.handle_disconnected(id).await,
                    BrowserEvent::TargetDestroyed(kind) => {
                        pool.handle_target_destroyed(id, kind).await
                    }
                }
            }
        });
    }

    async fn handle_disconnected(self: &Arc<Self>, id: InstanceId) {
        let (already_killed, moved) = {
            let mut inner = self.inner.lock().await;
            match inner.active.get(&id).or_else(|| inner.retired.get(&id)) {
                Some(instance) => {
                    let killed = instance.killed;
                    let moved = if !killed { inner.retire_instance(id) } else { false };
                    (killed, moved)
                }
                None => (true, false),
            }
        };
        if !already_killed {
            error!(instance_id = id, "browser disconnected unexpectedly");
            if moved {
                self.emit(PoolEvent::InstanceRetired(id));
            }
        }
    }

    async fn handle_target_destroyed(self: &Arc<Self>, id: InstanceId, kind: crate::handle::TargetKind) {
        if !kind.counts_as_page() {
            return;
        }
        let schedule_kill = {
            let mut inner = self.inner.lock().await;
            let retired = inner.retired.contains_key(&id);
            match inner.active.get_mut(&id).or_else(|| inner.retired.get_mut(&id)) {
                Some(instance) => {
                    instance.active_pages = instance.active_pages.saturating_sub(1);
                    retired && instance.active_pages == 0
                }
                None => false,
            }
        };
        if schedule_kill {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(PAGE_CLOSE_KILL_TIMEOUT_MILLIS)).await;
                pool.kill_instance(id).await;
            });
        }
    }

    fn spawn_page_crash_watcher(self: &Arc<Self>, id: InstanceId, page: Arc<dyn PageHandle>) {
        tokio::spawn(async move {
            page.wait_for_crash().await;
            warn!(instance_id = id, page_id = page.id(), "page crashed");
            if let Err(e) = page.close().await {
                warn!(instance_id = id, page_id = page.id(), error = %e, "failed to close crashed page");
            }
        });
    }

    async fn retire_by_id(&self, id: InstanceId) {
        let moved = {
            let mut inner = self.inner.lock().await;
            inner.retire_instance(id)
        };
        if moved {
            self.emit(PoolEvent::InstanceRetired(id));
        }
    }

    /// Moves the instance whose resolved handle is `browser` (identity
    /// comparison) from `active` to `retired`. A no-op if no such instance
    /// is found: already retired, or never belonged to this pool.
    pub async fn retire(&self, browser: &Arc<dyn BrowserHandle>) {
        let id = {
            let inner = self.inner.lock().await;
            inner.active.iter().find_map(|(id, instance)| match &instance.browser {
                InstanceBrowser::Ready(h) if Arc::ptr_eq(h, browser) => Some(*id),
                _ => None,
            })
        };
        if let Some(id) = id {
            self.retire_by_id(id).await;
        }
    }

    /// Tears down every instance and deletes every cache directory the pool
    /// owns. Always succeeds; internal errors are logged, not surfaced.
    /// Safe to call more than once — the second call is a no-op.
    pub async fn destroy(&self) {
        let already_destroying = {
            let mut inner = self.inner.lock().await;
            std::mem::replace(&mut inner.destroying, true)
        };
        if already_destroying {
            return;
        }

        if let Some(handle) = self.reaper.lock().expect("reaper mutex poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = self.interrupt.lock().expect("interrupt mutex poisoned").take() {
            handle.abort();
        }

        let instances: Vec<Instance> = {
            let mut inner = self.inner.lock().await;
            inner
                .active
                .drain()
                .chain(inner.retired.drain())
                .map(|(_, instance)| instance)
                .collect()
        };

        let mut leftover_dirs = Vec::new();
        let closes: Vec<_> = instances
            .into_iter()
            .filter_map(|mut instance| {
                instance.killed = true;
                if let Some(dir) = instance.cache_dir.take() {
                    leftover_dirs.push(dir);
                }
                match instance.browser {
                    InstanceBrowser::Ready(handle) => Some(async move {
                        if let Err(e) = handle.close().await {
                            warn!(error = %e, "orderly close failed during destroy");
                        }
                    }),
                    _ => None,
                }
            })
            .collect();
        join_all(closes).await;

        for dir in leftover_dirs {
            self.delete_cache_dir(&dir).await;
        }
        if let Some(recycler) = &self.cache_recycler {
            recycler.drain_delete_all().await;
        }
    }

    /// The kill procedure: remove from the pool's maps, then race an
    /// unconditional hard-kill timer against an orderly close, whichever
    /// finishes first recycles or deletes the cache directory (the other
    /// finds it already taken).
    async fn kill_instance(self: &Arc<Self>, id: InstanceId) {
        let instance = {
            let mut inner = self.inner.lock().await;
            inner.retired.remove(&id).or_else(|| inner.active.remove(&id))
        };
        let Some(mut instance) = instance else {
            return;
        };

        let handle = instance.ready_handle();
        let already_killed = instance.killed;
        instance.killed = true;
        let cache_dir = Arc::new(StdMutex::new(instance.cache_dir.take()));

        {
            let pool = Arc::clone(self);
            let handle = handle.clone();
            let cache_dir = Arc::clone(&cache_dir);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(PROCESS_KILL_TIMEOUT_MILLIS)).await;
                if let Some(handle) = &handle {
                    handle.hard_kill();
                }
                pool.finish_cache_dir(id, &cache_dir).await;
            });
        }

        if let Some(handle) = &handle {
            if !already_killed {
                if let Err(e) = handle.close().await {
                    warn!(instance_id = id, error = %e, "orderly close failed");
                }
            }
        }
        self.finish_cache_dir(id, &cache_dir).await;
        info!(instance_id = id, "browser instance killed");
        self.emit(PoolEvent::InstanceKilled(id));
    }

    async fn finish_cache_dir(&self, id: InstanceId, cache_dir: &Arc<StdMutex<Option<PathBuf>>>) {
        let taken = cache_dir
            .lock()
            .expect("cache dir mutex poisoned")
            .take();
        let Some(dir) = taken else {
            return;
        };
        match &self.cache_recycler {
            Some(recycler) => {
                recycler.recycle(dir);
                self.emit(PoolEvent::CacheDirRecycled(id));
            }
            None => self.delete_cache_dir(&dir).await,
        }
    }

    async fn delete_cache_dir(&self, path: &std::path::Path) {
        if let Err(e) = tokio::fs::remove_dir_all(path).await {
            warn!(path = %path.display(), error = %e, "failed to delete cache directory");
        }
    }

    /// Periodic reaper: kills retired instances that have been idle too
    /// long, or whose only remaining page is the residual blank tab.
    async fn reaper_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.instance_killer_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.reap_once().await;
        }
    }

    async fn reap_once(self: &Arc<Self>) {
        let candidates: Vec<InstanceId> = {
            let inner = self.inner.lock().await;
            inner.retired.keys().copied().collect()
        };

        for id in candidates {
            let (idle_expired, handle) = {
                let inner = self.inner.lock().await;
                match inner.retired.get(&id) {
                    Some(instance) => {
                        let idle = instance.last_page_opened_at.elapsed() > self.config.kill_instance_after;
                        (idle, instance.ready_handle())
                    }
                    None => continue,
                }
            };

            if idle_expired {
                self.kill_instance(id).await;
                continue;
            }

            let Some(handle) = handle else { continue };
            match handle.pages().await {
                Ok(pages) if pages.len() <= 1 => self.kill_instance(id).await,
                Ok(_) => {}
                Err(e) => {
                    warn!(instance_id = id, error = %e, "page listing failed");
                    self.kill_instance(id).await;
                }
            }
        }
    }

    /// Returns the `Arc<dyn BrowserHandle>` the pool currently holds for
    /// `id`, if any. Test-only: production callers only ever see handles
    /// indirectly, through the pages `new_page` hands back.
    #[cfg(feature = "test-util")]
    pub async fn handle_for_testing(&self, id: InstanceId) -> Option<Arc<dyn BrowserHandle>> {
        let inner = self.inner.lock().await;
        inner
            .active
            .get(&id)
            .or_else(|| inner.retired.get(&id))
            .and_then(Instance::ready_handle)
    }

    /// Subscribes once to the process interrupt signal; on fire, sends an
    /// interrupt-class signal to every live child, swallowing errors. Does
    /// not itself call `destroy` — it prioritises no-orphaned-children over
    /// orderly shutdown.
    async fn interrupt_loop(self: Arc<Self>) {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("interrupt received, signaling all browser processes");
        let handles: Vec<Arc<dyn BrowserHandle>> = {
            let inner = self.inner.lock().await;
            inner
                .active
                .values()
                .chain(inner.retired.values())
                .filter_map(Instance::ready_handle)
                .collect()
        };
        for handle in handles {
            handle.interrupt();
        }
    }
}
