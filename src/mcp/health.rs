//! Endpoint health probing.

use std::sync::Arc;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::mcp::config::PROBE_COMMAND_TIMEOUT;
use crate::mcp::endpoint::{Endpoint, EndpointStatus};
use crate::mcp::rate_limit::RateLimiter;
use crate::mcp::registry::EndpointRegistry;
use crate::mcp::transport::{ConnectMode, Connector};

const PROBE_PREFIX: &str = "connection_test_";
const PROBE_COMMAND: &str = "echo \"connection_test_$(date +%s)\"";

pub struct HealthChecker {
    connector: Arc<dyn Connector>,
    registry: Arc<EndpointRegistry>,
    rate_limiter: Arc<RateLimiter>,
}

impl HealthChecker {
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Arc<EndpointRegistry>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            connector,
            registry,
            rate_limiter,
        }
    }

    /// Probe one endpoint on a fresh connection and record the outcome.
    ///
    /// Returns true when the endpoint answered the probe command. A probe
    /// refused by the rate limiter restores the previous status.
    pub async fn probe(&self, endpoint: &Endpoint) -> bool {
        let key = endpoint.key();
        let previous = self.registry.set_status(&key, EndpointStatus::Testing);

        if !self
            .rate_limiter
            .check(&format!("test:{}", endpoint.hostname()))
        {
            if let Some(status) = previous {
                self.registry.set_status(&key, status);
            }
            return false;
        }

        let start = Instant::now();
        let conn = match self.connector.connect(endpoint, ConnectMode::Probe).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Health probe of {} failed to connect: {}", key, e);
                self.registry.record_probe(&key, None);
                return false;
            }
        };

        let passed = match conn.exec(PROBE_COMMAND, PROBE_COMMAND_TIMEOUT).await {
            Ok(output) => output.stdout.trim_start().starts_with(PROBE_PREFIX),
            Err(e) => {
                warn!("Health probe of {} failed: {}", key, e);
                false
            }
        };
        let elapsed = start.elapsed().as_secs_f64();
        conn.close().await;

        if passed {
            debug!("Endpoint {} healthy ({:.3}s)", key, elapsed);
            self.registry.record_probe(&key, Some(elapsed));
        } else {
            warn!("Endpoint {} failed its health probe", key);
            self.registry.record_probe(&key, None);
        }
        passed
    }

    /// Probe every registered endpoint concurrently.
    ///
    /// Returns the number of endpoints that passed.
    pub async fn probe_all(&self) -> usize {
        let endpoints = self.registry.list();
        let results = join_all(endpoints.iter().map(|ep| self.probe(ep))).await;
        let healthy = results.iter().filter(|ok| **ok).count();
        info!(
            "Health check complete: {}/{} endpoint(s) healthy",
            healthy,
            endpoints.len()
        );
        healthy
    }
}
