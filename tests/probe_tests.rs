//! Integration coverage for the probe dispatch layer: every protocol must
//! return a `ResultRecord`, never an `Err`, even against unreachable targets.

use netmon_core::model::{Endpoint, Protocol, Status};
use netmon_core::probe::{ProbeDispatcher, Prober};
use std::time::Duration;

fn endpoint(protocol: Protocol, address: &str, timeout: Duration) -> Endpoint {
    Endpoint {
        id: "probe-test".into(),
        region: "local".into(),
        name: "probe test endpoint".into(),
        protocol,
        address: address.into(),
        timeout,
        enabled: true,
        follow_redirects: false,
        user_agent: None,
        verify_tls: true,
    }
}

#[tokio::test]
async fn tcp_probe_against_closed_port_reports_error_not_panic() {
    let dispatcher = ProbeDispatcher::default();
    // Port 0 is never connectable; connect fails immediately rather than timing out.
    let ep = endpoint(Protocol::Tcp, "127.0.0.1:0", Duration::from_millis(500));
    let result = dispatcher.probe(&ep, ep.timeout).await;
    assert_eq!(result.endpoint_id, "probe-test");
    assert_eq!(result.status, Status::Error);
    assert!(result.latency_ms.is_none());
}

#[tokio::test]
async fn http_probe_against_unroutable_address_times_out_or_fails() {
    let dispatcher = ProbeDispatcher::default();
    let ep = endpoint(
        Protocol::Http,
        "http://10.255.255.1/",
        Duration::from_millis(200),
    );
    let result = dispatcher.probe(&ep, ep.timeout).await;
    assert!(matches!(
        result.status,
        Status::Failure | Status::Timeout | Status::Error
    ));
}

#[tokio::test]
async fn udp_probe_never_panics_on_unreachable_host() {
    let dispatcher = ProbeDispatcher::default();
    let ep = endpoint(Protocol::Udp, "127.0.0.1:1", Duration::from_millis(300));
    let _ = dispatcher.probe(&ep, ep.timeout).await;
}

#[tokio::test]
async fn disabled_endpoint_can_still_be_probed_directly() {
    // Scheduling skips disabled endpoints; the dispatcher itself has no
    // opinion on `enabled` -- that filter lives in `ConfigSnapshot`.
    let dispatcher = ProbeDispatcher::default();
    let mut ep = endpoint(Protocol::Tcp, "127.0.0.1:1", Duration::from_millis(200));
    ep.enabled = false;
    let result = dispatcher.probe(&ep, ep.timeout).await;
    assert_eq!(result.protocol, Protocol::Tcp);
}
