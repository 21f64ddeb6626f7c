//! HTTP probe: GET the endpoint's URL, classify 2xx/3xx as success, 4xx/5xx as
//! failure, network errors as error, deadline exceeded as timeout.
//!
//! The default path uses `isahc` (teacher's `IsahcHttpClient` pattern) and
//! reports only total latency. When built with the `timings-curl` feature,
//! `curl`'s libcurl timers give a DNS/connect/TLS/TTFB phase breakdown
//! (teacher's `RealCurlRunner`).

use super::{error_result, failure_result, success_result, timeout_result, Prober};
use crate::model::{Detail, Endpoint, HttpPhaseTimings};
use async_trait::async_trait;
use isahc::config::{Configurable, RedirectPolicy};
use isahc::prelude::*;
use isahc::{HttpClient, Request};
use std::time::{Duration, Instant};
use tokio::time::timeout as tokio_timeout;

#[derive(Default)]
pub struct HttpProber;

impl HttpProber {
    fn build_client(endpoint: &Endpoint, timeout: Duration) -> Result<HttpClient, isahc::Error> {
        let redirect = if endpoint.follow_redirects {
            RedirectPolicy::Follow
        } else {
            RedirectPolicy::None
        };
        let mut builder = HttpClient::builder()
            .timeout(timeout)
            .redirect_policy(redirect)
            .ssl_options(if endpoint.verify_tls {
                isahc::config::SslOption::NONE
            } else {
                isahc::config::SslOption::DANGER_ACCEPT_INVALID_CERTS
                    | isahc::config::SslOption::DANGER_ACCEPT_REVOKED_CERTS
                    | isahc::config::SslOption::DANGER_ACCEPT_INVALID_HOSTS
            });
        if let Some(ua) = &endpoint.user_agent {
            builder = builder.default_header("User-Agent", ua.as_str());
        }
        builder.build()
    }

    #[cfg(feature = "timings-curl")]
    async fn probe_with_curl_timings(
        &self,
        endpoint: &Endpoint,
        budget: Duration,
    ) -> crate::model::ResultRecord {
        use curl::easy::Easy;

        let url = endpoint.address.clone();
        let timeout_ms = budget.as_millis() as u64;
        let user_agent = endpoint
            .user_agent
            .clone()
            .unwrap_or_else(|| "netmon-core/1.0".to_string());
        let verify_tls = endpoint.verify_tls;
        let follow_redirects = endpoint.follow_redirects;

        let outcome = tokio::task::spawn_blocking(move || -> Result<(u16, HttpPhaseTimings, f64), String> {
            let mut handle = Easy::new();
            handle.url(&url).map_err(|e| e.to_string())?;
            handle
                .timeout(Duration::from_millis(timeout_ms))
                .map_err(|e| e.to_string())?;
            handle.useragent(&user_agent).map_err(|e| e.to_string())?;
            handle.ssl_verify_peer(verify_tls).map_err(|e| e.to_string())?;
            handle.follow_location(follow_redirects).map_err(|e| e.to_string())?;
            handle
                .write_function(|data| Ok(data.len()))
                .map_err(|e| e.to_string())?;
            handle.perform().map_err(|e| e.to_string())?;

            let status = handle.response_code().map_err(|e| e.to_string())? as u16;
            let dns = handle.namelookup_time().map_err(|e| e.to_string())?.as_secs_f64();
            let connect = handle.connect_time().map_err(|e| e.to_string())?.as_secs_f64();
            let appconnect = handle.appconnect_time().map_err(|e| e.to_string())?.as_secs_f64();
            let starttransfer = handle.starttransfer_time().map_err(|e| e.to_string())?.as_secs_f64();
            let total = handle.total_time().map_err(|e| e.to_string())?.as_secs_f64();

            let phases = HttpPhaseTimings {
                dns_ms: Some((dns * 1000.0).max(0.0) as u64),
                connect_ms: Some(((connect - dns).max(0.0) * 1000.0) as u64),
                tls_ms: if appconnect > 0.0 {
                    Some(((appconnect - connect).max(0.0) * 1000.0) as u64)
                } else {
                    None
                },
                ttfb_ms: Some((starttransfer * 1000.0).max(0.0) as u64),
            };

            Ok((status, phases, total * 1000.0))
        })
        .await;

        match outcome {
            Ok(Ok((status, phases, total_ms))) => {
                let detail = Detail {
                    http_status: Some(status),
                    phases: Some(phases),
                    ..Default::default()
                };
                classify_http_status(endpoint, status, total_ms, Some(detail))
            }
            Ok(Err(e)) => error_result(endpoint, format!("curl probe failed: {e}")),
            Err(e) => error_result(endpoint, format!("curl task join failed: {e}")),
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, endpoint: &Endpoint, deadline: Duration) -> crate::model::ResultRecord {
        let budget = endpoint.timeout.min(deadline);

        #[cfg(feature = "timings-curl")]
        {
            return self.probe_with_curl_timings(endpoint, budget).await;
        }

        #[cfg(not(feature = "timings-curl"))]
        {
            let client = match Self::build_client(endpoint, budget) {
                Ok(c) => c,
                Err(e) => return error_result(endpoint, format!("failed to build http client: {e}")),
            };

            let request = match Request::get(&endpoint.address).body(()) {
                Ok(r) => r,
                Err(e) => return error_result(endpoint, format!("invalid request: {e}")),
            };

            let start = Instant::now();
            let send = client.send_async(request);

            match tokio_timeout(budget, send).await {
                Ok(Ok(mut response)) => {
                    let status = response.status().as_u16();
                    let http_version = format!("{:?}", response.version());
                    let remaining = budget.saturating_sub(start.elapsed());

                    match tokio_timeout(remaining, response.bytes()).await {
                        Ok(Ok(body)) => {
                            let detail = Detail {
                                http_status: Some(status),
                                http_version: Some(http_version),
                                response_bytes: Some(body.len() as u64),
                                ..Default::default()
                            };
                            let total_ms = start.elapsed().as_secs_f64() * 1000.0;
                            classify_http_status(endpoint, status, total_ms, Some(detail))
                        }
                        Ok(Err(e)) => classify_isahc_error(endpoint, e, "response body read"),
                        Err(_) => timeout_result(endpoint, "http response body read timed out"),
                    }
                }
                Ok(Err(e)) => classify_isahc_error(endpoint, e, "http request"),
                Err(_) => timeout_result(endpoint, "http request timed out"),
            }
        }
    }
}

/// Classifies an `isahc::Error` surfaced mid-request (headers or body) into
/// a `timeout` or `error` Result -- isahc's own timeout kind is distinct from
/// the outer `tokio_timeout` wrapper and must be inspected rather than
/// discarded, since either one can fire depending on where in the transfer
/// the deadline lands.
fn classify_isahc_error(endpoint: &Endpoint, e: isahc::Error, phase: &str) -> crate::model::ResultRecord {
    if e.kind() == isahc::error::ErrorKind::Timeout {
        timeout_result(endpoint, format!("{phase} timed out"))
    } else {
        error_result(endpoint, format!("{phase} failed: {e}"))
    }
}

fn classify_http_status(
    endpoint: &Endpoint,
    status: u16,
    total_ms: f64,
    detail: Option<Detail>,
) -> crate::model::ResultRecord {
    if (200..400).contains(&status) {
        let mut record = success_result(endpoint, Instant::now(), detail);
        record.latency_ms = Some(total_ms);
        record
    } else {
        failure_result(endpoint, format!("http status {status}"), detail)
    }
}
