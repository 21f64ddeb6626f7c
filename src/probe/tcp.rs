//! TCP probe: connect to `host:port`, report connect latency, close immediately.

use super::{error_result, success_result, timeout_result, Prober};
use crate::model::Endpoint;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout as tokio_timeout;

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, endpoint: &Endpoint, deadline: Duration) -> crate::model::ResultRecord {
        let budget = endpoint.timeout.min(deadline);
        let start = Instant::now();

        match tokio_timeout(budget, TcpStream::connect(&endpoint.address)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                success_result(endpoint, start, None)
            }
            Ok(Err(e)) => error_result(endpoint, format!("tcp connect failed: {e}")),
            Err(_) => timeout_result(endpoint, "tcp connect timed out"),
        }
    }
}
