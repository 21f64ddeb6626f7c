//! ICMP probe: one echo request, IPv4/IPv6, via `surge-ping`'s unprivileged
//! or privileged datagram sockets depending on what the platform permits.
//!
//! Failure to open the socket (commonly a permissions problem on platforms
//! that restrict raw/datagram ICMP) is reported as `error`, never `failure`,
//! per the specification's edge-case policy.

use super::{error_result, timeout_result, Prober};
use crate::model::{Detail, Endpoint};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use surge_ping::{Client, Config, PingIdentifier, PingSequence, ICMP};
use tokio::time::timeout as tokio_timeout;

const PAYLOAD: &[u8] = b"netmon-core-icmp-probe";

#[derive(Debug, Default, Clone, Copy)]
pub struct IcmpProber;

impl IcmpProber {
    async fn resolve(host: &str) -> std::io::Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let mut addrs = tokio::net::lookup_host((host, 0)).await?;
        addrs
            .next()
            .map(|a| a.ip())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"))
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn probe(&self, endpoint: &Endpoint, deadline: Duration) -> crate::model::ResultRecord {
        let budget = endpoint.timeout.min(deadline);

        let ip = match Self::resolve(&endpoint.address).await {
            Ok(ip) => ip,
            Err(e) => return error_result(endpoint, format!("icmp dns resolution failed: {e}")),
        };

        let kind = if ip.is_ipv4() { ICMP::V4 } else { ICMP::V6 };
        let config = Config::builder().kind(kind).build();
        let client = match Client::new(&config) {
            Ok(c) => c,
            Err(e) => return error_result(endpoint, format!("failed to open icmp socket: {e}")),
        };

        let ident = PingIdentifier(std::process::id() as u16);
        let mut pinger = client.pinger(ip, ident).await;
        pinger.timeout(budget);

        match tokio_timeout(budget, pinger.ping(PingSequence(0), PAYLOAD)).await {
            Ok(Ok((_packet, rtt))) => {
                let latency_ms = rtt.as_secs_f64() * 1000.0;
                crate::model::ResultRecord {
                    timestamp: chrono::Utc::now(),
                    endpoint_id: endpoint.id.clone(),
                    protocol: endpoint.protocol,
                    status: crate::model::Status::Success,
                    latency_ms: Some(latency_ms),
                    error: None,
                    detail: None::<Detail>,
                }
            }
            Ok(Err(e)) => error_result(endpoint, format!("icmp echo failed: {e}")),
            Err(_) => timeout_result(endpoint, "icmp echo timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_literal_ip_without_dns() {
        let ip = IcmpProber::resolve("127.0.0.1").await.unwrap();
        assert_eq!(ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    }
}
