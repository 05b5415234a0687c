//! Readiness probes
//!
//! A service counts as *started* once its process has been launched. It is
//! *ready* only once a probe says it can serve requests. Start ordering
//! alone guarantees the former; dependents that need the latter wait on a
//! probe registered with the orchestrator.

mod command;
mod http;
mod tcp;

pub use command::CommandProbe;
pub use http::HttpProbe;
pub use tcp::TcpProbe;

use crate::compose::config::{parse_duration, ServiceConfig};
use crate::container::ContainerRuntime;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Upper bound for the delay between probe attempts
pub const MAX_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Default per-attempt timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Decides whether a started service can serve requests
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Run one check
    async fn check(&self) -> Result<bool>;

    /// Per-attempt timeout
    fn timeout(&self) -> Duration;

    /// Human readable target, for logs
    fn describe(&self) -> String;
}

/// Probe until it succeeds, doubling the delay between attempts up to
/// [`MAX_PROBE_INTERVAL`]
pub async fn wait_until_ready<P: ReadinessProbe + ?Sized>(
    probe: &P,
    max_retries: usize,
    interval: Duration,
) -> bool {
    let mut delay = interval;

    for attempt in 0..max_retries {
        match probe.check().await {
            Ok(true) => return true,
            Ok(false) => {
                tracing::debug!(probe = %probe.describe(), attempt, "not ready yet");
            }
            Err(e) => {
                tracing::debug!(probe = %probe.describe(), attempt, error = %e, "probe failed");
            }
        }

        if attempt + 1 < max_retries {
            sleep(delay).await;
            delay = std::cmp::min(delay * 2, MAX_PROBE_INTERVAL);
        }
    }

    false
}

/// Label naming an HTTP endpoint that answers 2xx once the service is ready
pub const HTTP_READINESS_LABEL: &str = "io.stackrun.readiness.http";

/// Derive a probe for a service running as `container`.
///
/// In order of preference: its healthcheck command, executed inside the
/// container; the URL in its [`HTTP_READINESS_LABEL`] label; a TCP connect
/// to its first published port on localhost.
pub fn probe_for_service(
    service: &ServiceConfig,
    container: &str,
    runtime: Arc<dyn ContainerRuntime>,
) -> Result<Option<Arc<dyn ReadinessProbe>>> {
    if let Some(hc) = &service.healthcheck {
        if hc.is_disabled() {
            return Ok(None);
        }
        let timeout = match &hc.timeout {
            Some(t) => parse_duration(t)?,
            None => DEFAULT_PROBE_TIMEOUT,
        };
        if let Some(args) = hc.test_args() {
            let probe = CommandProbe::new(runtime, container, args, timeout)?;
            return Ok(Some(Arc::new(probe)));
        }
    }

    if let Some(url) = service.label_map().get(HTTP_READINESS_LABEL) {
        let probe = HttpProbe::new(url, DEFAULT_PROBE_TIMEOUT)?;
        return Ok(Some(Arc::new(probe)));
    }

    let published = service
        .port_bindings()?
        .into_iter()
        .find(|b| b.host_port.is_some() && b.protocol == crate::container::Protocol::Tcp);

    Ok(published.and_then(|binding| {
        let host = binding
            .host_ip
            .filter(|ip| ip != "0.0.0.0")
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let port = binding.host_port?;
        Some(Arc::new(TcpProbe::new(format!("{}:{}", host, port), DEFAULT_PROBE_TIMEOUT))
            as Arc<dyn ReadinessProbe>)
    }))
}
