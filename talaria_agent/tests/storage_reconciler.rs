//! Storage breakdown invariants and source precedence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use proptest::prelude::*;
use talaria_agent::config::StorageConfig;
use talaria_agent::storage::{
    decompose, CapacitySource, ContainerFigures, StorageReconciler, VolumeSource, VolumeUsage,
    OTHER_THRESHOLD_GB,
};
use talaria_agent::types::DiskInfo;
use tokio::runtime::Handle;

proptest! {
    #[test]
    fn categories_account_for_the_whole_container(
        total in 0.0f64..4000.0,
        free_frac in 0.0f64..1.0,
        purge_frac in 0.0f64..1.0,
        os_used in 0.0f64..2000.0,
        data_used in 0.0f64..4000.0,
    ) {
        let free = total * free_frac;
        let purgeable = free * purge_frac;
        let b = decompose(total, free - purgeable, purgeable, VolumeUsage { os_used, data_used });

        prop_assert!(b.categories.iter().all(|c| c.size_gb >= 0.0 && c.size_gb.is_finite()));
        prop_assert!((b.used_gb + b.free_gb - b.total_gb).abs() < 1e-6);
        let sum: f64 = b.categories.iter().map(|c| c.size_gb).sum();
        let expected = b.used_gb + b.free_gb;
        prop_assert!(sum <= expected + 1e-6, "sum {} > {}", sum, expected);
        prop_assert!(expected - sum <= OTHER_THRESHOLD_GB + 1e-6, "gap {}", expected - sum);
        prop_assert_eq!(b.categories.last().map(|c| c.name.as_str()), Some("Free"));
    }

    #[test]
    fn garbage_inputs_never_go_negative(
        total in prop::num::f64::ANY,
        free in prop::num::f64::ANY,
        purgeable in prop::num::f64::ANY,
        os_used in prop::num::f64::ANY,
    ) {
        let b = decompose(total, free, purgeable, VolumeUsage { os_used, data_used: 0.0 });
        prop_assert!(b.categories.iter().all(|c| c.size_gb >= 0.0));
        prop_assert!(b.used_gb >= 0.0 && b.free_gb >= 0.0);
    }
}

struct FakeSource {
    name: &'static str,
    answer: Option<ContainerFigures>,
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl FakeSource {
    fn boxed(name: &'static str, answer: Option<ContainerFigures>) -> (Box<dyn CapacitySource>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let src = FakeSource {
            name,
            answer,
            calls: calls.clone(),
            delay: Duration::ZERO,
        };
        (Box::new(src), calls)
    }
}

impl CapacitySource for FakeSource {
    fn name(&self) -> &'static str {
        self.name
    }

    fn query(&self) -> BoxFuture<'_, Option<ContainerFigures>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.answer
        })
    }
}

struct FixedVolumes(Vec<DiskInfo>);

impl VolumeSource for FixedVolumes {
    fn volumes(&self) -> Vec<DiskInfo> {
        self.0.clone()
    }
}

const GB: u64 = 1_000_000_000;

fn layout() -> StorageConfig {
    StorageConfig {
        os_mount: "/".into(),
        data_mount: "/data".into(),
    }
}

fn volumes() -> Arc<FixedVolumes> {
    Arc::new(FixedVolumes(vec![
        DiskInfo {
            filesystem: "ext4".into(),
            mount_point: "/".into(),
            total_gb: 200.0,
            used_gb: 20.0,
            free_gb: 180.0,
            used_percent: 10.0,
        },
        DiskInfo {
            filesystem: "ext4".into(),
            mount_point: "/data".into(),
            total_gb: 200.0,
            used_gb: 30.0,
            free_gb: 170.0,
            used_percent: 15.0,
        },
    ]))
}

fn figures(total_gb: u64, free_gb: u64, purgeable_gb: u64) -> ContainerFigures {
    ContainerFigures {
        total: total_gb * GB,
        free: free_gb * GB,
        purgeable: purgeable_gb * GB,
    }
}

#[tokio::test]
async fn first_usable_tier_wins() {
    let (empty, empty_calls) = FakeSource::boxed("empty", None);
    let (listing, listing_calls) = FakeSource::boxed("listing", Some(figures(500, 100, 20)));
    let (never, never_calls) = FakeSource::boxed("never", Some(figures(1, 1, 0)));
    let r = StorageReconciler::new(vec![empty, listing, never], volumes(), layout(), Handle::current());

    let b = r.reconcile().await;
    assert_eq!(b.total_gb, 500.0);
    assert_eq!(b.purgeable_gb, 20.0);
    assert_eq!(b.free_gb, 120.0);
    assert_eq!(empty_calls.load(Ordering::SeqCst), 1);
    assert_eq!(listing_calls.load(Ordering::SeqCst), 1);
    assert_eq!(never_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn falls_back_to_os_volume() {
    let (empty, _) = FakeSource::boxed("empty", None);
    let r = StorageReconciler::new(vec![empty], volumes(), layout(), Handle::current());
    let b = r.reconcile().await;
    assert_eq!(b.total_gb, 200.0);
    assert_eq!(b.free_gb, 180.0);
    assert_eq!(b.purgeable_gb, 0.0);
}

#[tokio::test]
async fn nothing_available_is_the_zero_breakdown() {
    let r = StorageReconciler::new(
        Vec::new(),
        Arc::new(FixedVolumes(Vec::new())),
        layout(),
        Handle::current(),
    );
    let b = r.reconcile().await;
    assert_eq!(b.total_gb, 0.0);
    assert!(b.categories.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_readers_share_one_refresh() {
    let calls = Arc::new(AtomicUsize::new(0));
    let slow = FakeSource {
        name: "slow",
        answer: Some(figures(100, 40, 0)),
        calls: calls.clone(),
        delay: Duration::from_millis(200),
    };
    let r = Arc::new(StorageReconciler::new(
        vec![Box::new(slow)],
        volumes(),
        layout(),
        Handle::current(),
    ));

    // Readers never wait: the cold value is the zero breakdown.
    let first = r.breakdown();
    assert_eq!(first.total_gb, 0.0);
    for _ in 0..20 {
        r.breakdown();
    }
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let fresh = r.breakdown();
    assert_eq!(fresh.total_gb, 100.0);
    // Still inside the refresh interval: no second refresh.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stale_value_triggers_background_refresh() {
    let (src, calls) = FakeSource::boxed("fast", Some(figures(100, 50, 0)));
    let r = Arc::new(
        StorageReconciler::new(vec![src], volumes(), layout(), Handle::current())
            .with_interval(Duration::from_millis(50)),
    );
    r.breakdown();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(r.breakdown().total_gb, 100.0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(calls.load(Ordering::SeqCst) >= 2);
}
