//! Active endpoint selection.

use std::sync::{Arc, RwLock};

use tracing::{error, info, warn};

use crate::mcp::endpoint::Endpoint;
use crate::mcp::health::HealthChecker;
use crate::mcp::registry::EndpointRegistry;

/// Pick the active endpoint with the lowest response time.
///
/// Ties keep registry order. Endpoints without a measured response time
/// are never selected.
pub fn select_fastest(endpoints: &[Endpoint]) -> Option<Endpoint> {
    let mut candidates: Vec<&Endpoint> = endpoints
        .iter()
        .filter(|ep| ep.is_active() && ep.response_time().is_some())
        .collect();
    candidates.sort_by(|a, b| {
        let a = a.response_time().unwrap_or(f64::INFINITY);
        let b = b.response_time().unwrap_or(f64::INFINITY);
        a.total_cmp(&b)
    });
    candidates.first().map(|ep| (*ep).clone())
}

pub struct FailoverCoordinator {
    health: Arc<HealthChecker>,
    registry: Arc<EndpointRegistry>,
    active: RwLock<Option<String>>,
}

impl FailoverCoordinator {
    pub fn new(health: Arc<HealthChecker>, registry: Arc<EndpointRegistry>) -> Self {
        Self {
            health,
            registry,
            active: RwLock::new(None),
        }
    }

    /// Probe all endpoints and return the fastest healthy one.
    pub async fn find_best_endpoint(&self) -> Option<Endpoint> {
        self.health.probe_all().await;
        select_fastest(&self.registry.list())
    }

    /// Keep the current endpoint while it passes a fresh probe, otherwise
    /// switch to the best available one.
    ///
    /// Returns `None` when no endpoint is available.
    pub async fn auto_failover(&self) -> Option<Endpoint> {
        if let Some(current) = self.active()
            && self.health.probe(&current).await
        {
            return self.registry.get(&current.key());
        }
        self.reselect().await
    }

    /// Switch to the best available endpoint even if the current one is healthy.
    pub async fn reselect(&self) -> Option<Endpoint> {
        let Some(best) = self.find_best_endpoint().await else {
            error!("Failover found no available endpoint");
            self.set_active(None);
            return None;
        };

        let previous = self.active_key();
        if previous.as_deref() != Some(best.key().as_str()) {
            match previous {
                Some(old) => warn!("Failing over from {} to {}", old, best.key()),
                None => info!("Selected endpoint {}", best.key()),
            }
            self.set_active(Some(best.key()));
            if let Err(e) = self.registry.save() {
                error!("Failed to persist registry after failover: {}", e);
            }
        }
        Some(best)
    }

    /// Currently selected endpoint, with its latest registry state.
    pub fn active(&self) -> Option<Endpoint> {
        self.active_key().and_then(|key| self.registry.get(&key))
    }

    /// Forget the active selection if it points at `key`.
    pub fn forget(&self, key: &str) {
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        if active.as_deref() == Some(key) {
            *active = None;
        }
    }

    fn active_key(&self) -> Option<String> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_active(&self, key: Option<String>) {
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = key;
    }
}
