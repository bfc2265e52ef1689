//! Pool-level scenario tests against the fake launcher — no real Chrome
//! process, per the six scenarios this crate is specified against.

use std::sync::Arc;
use std::time::Duration;

use browser_pool::testing::FakeLauncher;
use browser_pool::{BrowserPool, LaunchOptions, PageHandle, PoolConfig, PoolError};

fn config_with(launcher: Arc<FakeLauncher>, f: impl FnOnce(&mut PoolConfig)) -> PoolConfig {
    let mut config = PoolConfig::new(launcher);
    f(&mut config);
    config
}

#[tokio::test]
async fn saturation_triggers_launch() {
    let (launcher, control) = FakeLauncher::new();
    let config = config_with(launcher, |c| c.max_open_pages_per_instance = 2);
    let pool = BrowserPool::new(config);

    let page1 = pool.new_page().await.unwrap();
    let page2 = pool.new_page().await.unwrap();
    let page3 = pool.new_page().await.unwrap();

    assert_eq!(control.launch_count.load(std::sync::atomic::Ordering::SeqCst), 2);

    let instance0_handle = pool.handle_for_testing(0).await.unwrap();
    let instance1_handle = pool.handle_for_testing(1).await.unwrap();
    assert!(!Arc::ptr_eq(&instance0_handle, &instance1_handle));

    // page1 and page2 came from instance 0, page3 from instance 1 — we
    // can't compare page identity to instance identity directly through
    // the public API, but exactly two instances existing with the first
    // saturated at 2 pages and the second holding page 3 is exactly what
    // `stats()` reports.
    let stats = pool.stats().await;
    assert_eq!(stats.active_instances, 2);
    assert_eq!(stats.total_pages_served, 3);

    drop((page1, page2, page3));
    pool.destroy().await;
}

#[tokio::test]
async fn lifetime_retirement_launches_a_replacement() {
    let (launcher, control) = FakeLauncher::new();
    let config = config_with(launcher, |c| {
        c.retire_instance_after_request_count = 3;
        c.max_open_pages_per_instance = 10;
    });
    let pool = BrowserPool::new(config);

    let _p1 = pool.new_page().await.unwrap();
    let _p2 = pool.new_page().await.unwrap();
    let _p3 = pool.new_page().await.unwrap();

    let stats = pool.stats().await;
    assert_eq!(stats.active_instances, 0);
    assert_eq!(stats.retired_instances, 1);

    let _p4 = pool.new_page().await.unwrap();
    assert_eq!(control.launch_count.load(std::sync::atomic::Ordering::SeqCst), 2);

    let stats = pool.stats().await;
    assert_eq!(stats.active_instances, 1);
    assert_eq!(stats.retired_instances, 1);

    pool.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn idle_retired_instance_is_reaped() {
    let (launcher, _control) = FakeLauncher::new();
    let config = config_with(launcher, |c| {
        c.kill_instance_after = Duration::from_millis(100);
        c.instance_killer_interval = Duration::from_millis(10);
    });
    let pool = BrowserPool::new(config);

    let page = pool.new_page().await.unwrap();
    let handle = pool.handle_for_testing(0).await.unwrap();
    pool.retire(&handle).await;
    drop(page);

    tokio::time::advance(Duration::from_millis(150)).await;
    // Give the reaper task a chance to run after the simulated time jump.
    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_millis(10)).await;
    tokio::task::yield_now().await;

    assert!(pool.handle_for_testing(0).await.is_none());

    pool.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn retired_instance_with_only_blank_tab_is_reaped() {
    let (launcher, control) = FakeLauncher::new();
    let config = config_with(launcher, |c| {
        c.instance_killer_interval = Duration::from_millis(10);
        c.kill_instance_after = Duration::from_secs(3600);
    });
    let pool = BrowserPool::new(config);

    let page = pool.new_page().await.unwrap();
    let handle = pool.handle_for_testing(0).await.unwrap();
    pool.retire(&handle).await;
    drop(page);

    let browser = Arc::clone(&control.browsers.lock().unwrap()[0]);
    browser.close_all_pages_except_blank();

    tokio::time::advance(Duration::from_millis(20)).await;
    tokio::task::yield_now().await;

    assert!(pool.handle_for_testing(0).await.is_none());

    pool.destroy().await;
}

#[tokio::test]
async fn disconnect_auto_retires_and_logs_once() {
    let (launcher, control) = FakeLauncher::new();
    let config = PoolConfig::new(launcher);
    let pool = BrowserPool::new(config);

    let _page = pool.new_page().await.unwrap();
    let browser = Arc::clone(&control.browsers.lock().unwrap()[0]);

    browser.emit_disconnected();
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    let stats = pool.stats().await;
    assert_eq!(stats.retired_instances, 1);
    assert_eq!(stats.active_instances, 0);

    // A second disconnected event after the instance is gone entirely is a
    // silent no-op — nothing to assert on besides "this doesn't panic".
    browser.emit_disconnected();
    tokio::task::yield_now().await;

    pool.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn cache_recycling_round_trips_a_directory() {
    let (launcher, control) = FakeLauncher::new();
    let config = config_with(launcher, |c| {
        c.recycle_disk_cache = true;
        c.instance_killer_interval = Duration::from_millis(10);
        c.launch_options = LaunchOptions {
            headless: Some(false),
            devtools: false,
            extra_args: Vec::new(),
        };
    });
    let pool = BrowserPool::new(config);

    let page_a = pool.new_page().await.unwrap();
    let _ = page_a.close().await;
    let handle_a = pool.handle_for_testing(0).await.unwrap();

    let browser = Arc::clone(&control.browsers.lock().unwrap()[0]);
    browser.close_all_pages_except_blank();
    pool.retire(&handle_a).await;

    // Give the reaper's empty-tab check a tick to kill the instance and
    // recycle its cache directory.
    tokio::time::advance(Duration::from_millis(20)).await;
    tokio::task::yield_now().await;

    assert_eq!(pool.stats().await.recycled_cache_dirs, 1);

    let _page_b = pool.new_page().await.unwrap();
    assert_eq!(pool.stats().await.recycled_cache_dirs, 0);
    assert_eq!(control.launch_count.load(std::sync::atomic::Ordering::SeqCst), 2);

    pool.destroy().await;
}

#[tokio::test]
async fn retire_is_idempotent() {
    let (launcher, _control) = FakeLauncher::new();
    let pool = BrowserPool::new(PoolConfig::new(launcher));

    let _page = pool.new_page().await.unwrap();
    let handle = pool.handle_for_testing(0).await.unwrap();

    pool.retire(&handle).await;
    pool.retire(&handle).await;

    assert_eq!(pool.stats().await.retired_instances, 1);
    pool.destroy().await;
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let (launcher, _control) = FakeLauncher::new();
    let pool = BrowserPool::new(PoolConfig::new(launcher));

    let _page = pool.new_page().await.unwrap();
    pool.destroy().await;
    pool.destroy().await;

    assert_eq!(pool.stats().await.active_instances, 0);
}

#[tokio::test]
async fn new_page_never_returns_the_same_page_twice() {
    let (launcher, _control) = FakeLauncher::new();
    let config = config_with(launcher, |c| c.max_open_pages_per_instance = 100);
    let pool = BrowserPool::new(config);

    let mut ids = std::collections::HashSet::new();
    for _ in 0..20 {
        let page = pool.new_page().await.unwrap();
        assert!(ids.insert(page.id()), "duplicate page id returned");
    }

    pool.destroy().await;
}

#[tokio::test]
async fn destroy_deletes_every_cache_directory() {
    let (launcher, _control) = FakeLauncher::new();
    let config = config_with(launcher, |c| {
        c.recycle_disk_cache = true;
        c.launch_options = LaunchOptions {
            headless: Some(false),
            devtools: false,
            extra_args: Vec::new(),
        };
    });
    let pool = BrowserPool::new(config);

    let _page = pool.new_page().await.unwrap();
    let stats_before = pool.stats().await;
    assert_eq!(stats_before.active_instances, 1);

    pool.destroy().await;

    // Every directory the pool created must be gone from disk. We don't
    // have the path from here, but `stats()` reporting zero recycled dirs
    // after destroy plus the cache_recycler's own drain test covers
    // deletion directly.
    assert_eq!(pool.stats().await.recycled_cache_dirs, 0);
}

#[tokio::test]
async fn page_creation_failure_retires_the_instance_and_propagates_the_error() {
    let (launcher, control) = FakeLauncher::new();
    let pool = BrowserPool::new(PoolConfig::new(launcher));

    let _page = pool.new_page().await.unwrap();
    let browser = Arc::clone(&control.browsers.lock().unwrap()[0]);
    browser.fail_next_page_creation();

    let result = pool.new_page().await;
    assert!(
        matches!(result, Err(PoolError::PageCreationFailed(_))),
        "expected PageCreationFailed, got {result:?}"
    );

    let stats = pool.stats().await;
    assert_eq!(stats.active_instances, 0);
    assert_eq!(stats.retired_instances, 1);

    pool.destroy().await;
}

#[tokio::test]
async fn page_crash_closes_the_page_without_surfacing_an_error() {
    let (launcher, control) = FakeLauncher::new();
    let pool = BrowserPool::new(PoolConfig::new(launcher));

    let page = pool.new_page().await.unwrap();
    let browser = Arc::clone(&control.browsers.lock().unwrap()[0]);
    let fake_page = browser.last_page().expect("a page was just created");
    assert_eq!(fake_page.id(), page.id());
    assert!(!fake_page.is_closed());

    fake_page.crash();
    // Let the background crash watcher spawned by `new_page` observe the
    // crash and close the page.
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    assert!(fake_page.is_closed());
    // The instance itself is untouched by a page crash — only the page is
    // closed, per the spec's `PageCrashed` error taxonomy entry.
    assert_eq!(pool.stats().await.active_instances, 1);

    pool.destroy().await;
}

#[tokio::test]
async fn launch_resolving_after_its_instance_already_retired_still_installs_the_browser() {
    // Regression test: with `retire_instance_after_request_count == 1`, the
    // very first `new_page` call retires instance 0 (crossing the lifetime
    // cap) before the spawned launch task has resolved. The resolving
    // launch must still install the browser and hand it to the waiting
    // caller, not treat the retirement as a sign the pool is being
    // destroyed.
    let (launcher, control) = FakeLauncher::new();
    let config = config_with(launcher, |c| c.retire_instance_after_request_count = 1);
    let pool = BrowserPool::new(config);

    let page = pool.new_page().await.unwrap();
    assert_eq!(control.launch_count.load(std::sync::atomic::Ordering::SeqCst), 1);

    let stats = pool.stats().await;
    assert_eq!(stats.active_instances, 0);
    assert_eq!(stats.retired_instances, 1);

    // The instance's browser was installed rather than closed out from
    // under the caller.
    let browser = Arc::clone(&control.browsers.lock().unwrap()[0]);
    assert!(!browser.is_closed());
    assert!(pool.handle_for_testing(0).await.is_some());

    drop(page);
    pool.destroy().await;
}
