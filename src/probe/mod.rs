//! Probe protocol layer: one `Prober` implementation per [`Protocol`], sharing
//! a uniform `(Endpoint, deadline) -> ResultRecord` contract. None may return
//! `Err` -- a failed probe is encoded directly into the returned
//! [`ResultRecord`] per the propagation policy (§7 of the specification).

mod http;
mod icmp;
mod tcp;
mod udp;

pub use http::HttpProber;
pub use icmp::IcmpProber;
pub use tcp::TcpProber;
pub use udp::UdpProber;

use crate::model::{Detail, Endpoint, Protocol, ResultRecord, Status};
use async_trait::async_trait;
use chrono::Utc;
use std::time::{Duration, Instant};

/// A capability trait implemented once per protocol. Implementations are
/// data-only and must never block past `deadline`.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint, deadline: Duration) -> ResultRecord;
}

/// Dispatches to the concrete prober for `endpoint.protocol`.
pub struct ProbeDispatcher {
    icmp: IcmpProber,
    tcp: TcpProber,
    udp: UdpProber,
    http: HttpProber,
}

impl Default for ProbeDispatcher {
    fn default() -> Self {
        Self {
            icmp: IcmpProber::default(),
            tcp: TcpProber::default(),
            udp: UdpProber::default(),
            http: HttpProber::default(),
        }
    }
}

#[async_trait]
impl Prober for ProbeDispatcher {
    async fn probe(&self, endpoint: &Endpoint, deadline: Duration) -> ResultRecord {
        if endpoint.timeout.is_zero() {
            return error_result(endpoint, "invalid configuration: timeout must be > 0");
        }
        match endpoint.protocol {
            Protocol::Icmp => self.icmp.probe(endpoint, deadline).await,
            Protocol::Tcp => self.tcp.probe(endpoint, deadline).await,
            Protocol::Udp => self.udp.probe(endpoint, deadline).await,
            Protocol::Http => self.http.probe(endpoint, deadline).await,
        }
    }
}

/// Builds an `error` result with no latency, shared by every prober's
/// invalid-configuration and socket-open-failure edge cases.
pub(crate) fn error_result(endpoint: &Endpoint, message: impl Into<String>) -> ResultRecord {
    ResultRecord {
        timestamp: Utc::now(),
        endpoint_id: endpoint.id.clone(),
        protocol: endpoint.protocol,
        status: Status::Error,
        latency_ms: None,
        error: Some(message.into()),
        detail: None,
    }
}

/// Builds a `timeout` result, shared by every prober's deadline-exceeded path.
pub(crate) fn timeout_result(endpoint: &Endpoint, message: impl Into<String>) -> ResultRecord {
    ResultRecord {
        timestamp: Utc::now(),
        endpoint_id: endpoint.id.clone(),
        protocol: endpoint.protocol,
        status: Status::Timeout,
        latency_ms: None,
        error: Some(message.into()),
        detail: None,
    }
}

/// Builds a `success` result carrying latency measured from `start`.
pub(crate) fn success_result(
    endpoint: &Endpoint,
    start: Instant,
    detail: Option<Detail>,
) -> ResultRecord {
    ResultRecord {
        timestamp: Utc::now(),
        endpoint_id: endpoint.id.clone(),
        protocol: endpoint.protocol,
        status: Status::Success,
        latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
        error: None,
        detail: detail.filter(|d| !d.is_empty()),
    }
}

pub(crate) fn failure_result(
    endpoint: &Endpoint,
    message: impl Into<String>,
    detail: Option<Detail>,
) -> ResultRecord {
    ResultRecord {
        timestamp: Utc::now(),
        endpoint_id: endpoint.id.clone(),
        protocol: endpoint.protocol,
        status: Status::Failure,
        latency_ms: None,
        error: Some(message.into()),
        detail: detail.filter(|d| !d.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn sample_endpoint(protocol: Protocol, timeout: StdDuration) -> Endpoint {
        Endpoint {
            id: "e1".into(),
            region: "r1".into(),
            name: "test".into(),
            protocol,
            address: "127.0.0.1:1".into(),
            timeout,
            enabled: true,
            follow_redirects: false,
            user_agent: None,
            verify_tls: true,
        }
    }

    #[tokio::test]
    async fn zero_timeout_is_error_not_failure() {
        let dispatcher = ProbeDispatcher::default();
        let endpoint = sample_endpoint(Protocol::Tcp, StdDuration::from_millis(0));
        let result = dispatcher.probe(&endpoint, StdDuration::from_millis(0)).await;
        assert_eq!(result.status, Status::Error);
        assert!(result.error.unwrap().contains("invalid configuration"));
    }
}
