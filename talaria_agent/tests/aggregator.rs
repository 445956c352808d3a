//! Snapshot aggregation: failure isolation and parallel latency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use talaria_agent::aggregator::{encode, Aggregator, Probe, Providers, SnapshotCache};
use talaria_agent::types::{CpuMetrics, MemoryMetrics, NetworkMetrics, SystemMetrics};

fn cpu(usage: f32) -> Probe<CpuMetrics> {
    Probe::new("cpu", Duration::from_millis(200), move || -> anyhow::Result<_> {
        Ok(CpuMetrics {
            usage_percent: usage,
            core_count: 8,
            ..Default::default()
        })
    })
}

#[tokio::test]
async fn failing_provider_degrades_only_its_category() {
    let mut p = Providers::zeroed();
    p.cpu = cpu(42.0);
    p.memory = Probe::new("memory", Duration::from_millis(200), || -> anyhow::Result<MemoryMetrics> {
        anyhow::bail!("sysctl unavailable")
    });
    let snap = Aggregator::new(p).collect(1).await;
    assert_eq!(snap.cpu.usage_percent, 42.0);
    assert_eq!(snap.memory.total_mb, 0);
    assert!(snap.memory.pressure_level.is_empty());
}

#[tokio::test]
async fn panicking_provider_degrades_only_its_category() {
    let mut p = Providers::zeroed();
    p.cpu = cpu(7.5);
    p.network = Probe::new("network", Duration::from_millis(200), || -> anyhow::Result<NetworkMetrics> {
        panic!("driver went away")
    });
    let snap = Aggregator::new(p).collect(0).await;
    assert_eq!(snap.cpu.usage_percent, 7.5);
    assert!(snap.network.interfaces.is_empty());
    assert!(encode(&snap).is_some());
}

#[tokio::test]
async fn timed_out_provider_reports_zero_value() {
    let mut p = Providers::zeroed();
    p.cpu = cpu(3.0);
    p.system = Probe::new("system", Duration::from_millis(100), || -> anyhow::Result<_> {
        std::thread::sleep(Duration::from_millis(600));
        Ok(SystemMetrics {
            hostname: "too-late".into(),
            ..Default::default()
        })
    });
    let started = Instant::now();
    let snap = Aggregator::new(p).collect(0).await;
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(snap.system.hostname.is_empty());
    assert_eq!(snap.cpu.usage_percent, 3.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn probes_run_in_parallel() {
    let slow = |category: &'static str| {
        Probe::new(category, Duration::from_secs(2), || -> anyhow::Result<CpuMetrics> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(CpuMetrics::default())
        })
    };
    let mut p = Providers::zeroed();
    p.cpu = slow("cpu");
    p.memory = Probe::new("memory", Duration::from_secs(2), || -> anyhow::Result<_> {
        std::thread::sleep(Duration::from_millis(200));
        Ok(MemoryMetrics::default())
    });
    p.network = Probe::new("network", Duration::from_secs(2), || -> anyhow::Result<_> {
        std::thread::sleep(Duration::from_millis(200));
        Ok(NetworkMetrics::default())
    });
    let agg = Aggregator::new(p);

    let started = Instant::now();
    agg.collect(0).await;
    // Three 200ms providers: sequential would be 600ms.
    assert!(started.elapsed() < Duration::from_millis(450), "{:?}", started.elapsed());
}

#[tokio::test]
async fn http_snapshot_cache_shares_one_pass() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut p = Providers::zeroed();
    p.cpu = Probe::new("cpu", Duration::from_secs(1), {
        let calls = calls.clone();
        move || -> anyhow::Result<CpuMetrics> {
            calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            Ok(CpuMetrics::default())
        }
    });
    let cache = Arc::new(SnapshotCache::new(
        Arc::new(Aggregator::new(p)),
        Duration::from_secs(5),
    ));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.json(0).await })
        })
        .collect();
    for h in handles {
        let json = h.await.unwrap().expect("encoded");
        assert!(json.contains("\"client_count\""));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
