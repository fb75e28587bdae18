//! Composition root for the endpoint broker.
//!
//! [`HardwareManager`] builds every component from one [`ManagerConfig`] and a
//! [`Connector`], wires the shared pieces together and owns the background
//! loops. Tools receive it behind an `Arc`; there is no global state.
//!
//! # Background loops
//!
//! - **Health**: probes every endpoint each `health_check_interval` and
//!   persists the registry. A failed save backs the loop off for a minute.
//! - **Sweep**: closes terminal sessions idle for longer than
//!   `session_timeout`, every `sweep_interval`.
//!
//! Both loops stop when [`HardwareManager::shutdown`] cancels their token.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::mcp::config::{LOOP_ERROR_BACKOFF, ManagerConfig};
use crate::mcp::endpoint::{Endpoint, EndpointSpec};
use crate::mcp::error::{HardwareError, Result};
use crate::mcp::executor::CommandExecutor;
use crate::mcp::failover::FailoverCoordinator;
use crate::mcp::hardware::HardwareInspector;
use crate::mcp::health::HealthChecker;
use crate::mcp::pool::ConnectionPool;
use crate::mcp::rate_limit::RateLimiter;
use crate::mcp::registry::EndpointRegistry;
use crate::mcp::security::SecurityValidator;
use crate::mcp::terminal::TerminalManager;
use crate::mcp::transport::{Connector, SshConnector};

pub struct HardwareManager {
    config: ManagerConfig,
    validator: Arc<SecurityValidator>,
    rate_limiter: Arc<RateLimiter>,
    registry: Arc<EndpointRegistry>,
    pool: Arc<ConnectionPool>,
    health: Arc<HealthChecker>,
    failover: FailoverCoordinator,
    executor: CommandExecutor,
    terminals: Arc<TerminalManager>,
    hardware: HardwareInspector,
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HardwareManager {
    /// Build a manager from the environment with the SSH transport.
    pub fn from_env() -> Result<Self> {
        let config = ManagerConfig::from_env()?;
        let connector = Arc::new(SshConnector::new(&config));
        Self::new(config, connector)
    }

    /// Validate `config`, load the persisted registry and assemble the
    /// components around `connector`.
    pub fn new(config: ManagerConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let registry = EndpointRegistry::load(&config.registry_path)?;
        Ok(Self::assemble(config, connector, registry))
    }

    pub(crate) fn assemble(
        config: ManagerConfig,
        connector: Arc<dyn Connector>,
        registry: EndpointRegistry,
    ) -> Self {
        let registry = Arc::new(registry);
        let validator = Arc::new(SecurityValidator::new(config.agent_mode));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.max_requests_per_minute,
            config.rate_limiting,
        ));
        let pool = Arc::new(ConnectionPool::new(
            connector.clone(),
            registry.clone(),
            config.max_pool_size,
        ));
        let health = Arc::new(HealthChecker::new(
            connector.clone(),
            registry.clone(),
            rate_limiter.clone(),
        ));
        let failover = FailoverCoordinator::new(health.clone(), registry.clone());
        let executor = CommandExecutor::new(pool.clone(), validator.clone(), rate_limiter.clone());
        let terminals = Arc::new(TerminalManager::new(
            connector,
            validator.clone(),
            config.session_timeout,
            config.terminal_completion,
        ));
        let hardware = HardwareInspector::new(pool.clone());

        Self {
            config,
            validator,
            rate_limiter,
            registry,
            pool,
            health,
            failover,
            executor,
            terminals,
            hardware,
            cancel_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the health and sweep loops. Calling it again is a no-op.
    pub fn init(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            warn!("Hardware manager already initialized");
            return;
        }
        if self.cancel_token.is_cancelled() {
            warn!("Hardware manager was shut down, background loops not started");
            return;
        }

        tasks.push(tokio::spawn(health_loop(
            self.health.clone(),
            self.registry.clone(),
            self.config.health_check_interval,
            self.cancel_token.clone(),
        )));
        tasks.push(tokio::spawn(sweep_loop(
            self.terminals.clone(),
            self.config.sweep_interval,
            self.cancel_token.clone(),
        )));
        info!(
            "Background loops started (health every {:?}, sweep every {:?})",
            self.config.health_check_interval, self.config.sweep_interval
        );
    }

    /// Stop the loops, drain the pool, close every terminal session and
    /// persist the registry.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background loop ended abnormally: {}", e);
            }
        }

        self.pool.drain().await;
        self.terminals.close_all().await;
        self.persist();
        info!("Hardware manager shut down");
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn validator(&self) -> &SecurityValidator {
        &self.validator
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn failover(&self) -> &FailoverCoordinator {
        &self.failover
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn terminals(&self) -> &TerminalManager {
        &self.terminals
    }

    pub fn hardware(&self) -> &HardwareInspector {
        &self.hardware
    }

    /// Endpoint chosen by auto-failover.
    pub async fn select_endpoint(&self) -> Result<Endpoint> {
        self.failover
            .auto_failover()
            .await
            .ok_or(HardwareError::NoEndpointAvailable)
    }

    /// Validate and register a new endpoint, then persist the registry.
    pub fn add_endpoint(&self, spec: EndpointSpec) -> Result<Endpoint> {
        self.validator.validate_hostname(&spec.hostname)?;
        if self.config.validate_keys {
            self.validator
                .validate_ssh_key(&spec.key_path.to_string_lossy())?;
        }
        let endpoint = spec.build()?;
        self.registry.add(endpoint.clone())?;
        self.persist();
        Ok(endpoint)
    }

    /// Unregister an endpoint by key or hostname, close its idle
    /// connections, then persist the registry.
    pub async fn remove_endpoint(&self, key_or_hostname: &str) -> Result<Endpoint> {
        let removed = self.registry.remove(key_or_hostname)?;
        self.failover.forget(&removed.key());
        self.pool.drain_endpoint(&removed.key()).await;
        self.persist();
        Ok(removed)
    }

    /// Save the registry, logging instead of failing.
    pub fn persist(&self) {
        if let Err(e) = self.registry.save() {
            error!("Failed to persist endpoint registry: {}", e);
        }
    }
}

/// Sleep for `period` unless cancelled first. Returns false on cancellation.
async fn pause(period: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(period) => true,
    }
}

async fn health_loop(
    health: Arc<HealthChecker>,
    registry: Arc<EndpointRegistry>,
    interval: Duration,
    token: CancellationToken,
) {
    while pause(interval, &token).await {
        let healthy = health.probe_all().await;
        debug!("Health cycle finished, {} endpoint(s) healthy", healthy);

        if let Err(e) = registry.save() {
            error!("Health loop failed to persist registry: {}", e);
            if !pause(LOOP_ERROR_BACKOFF, &token).await {
                break;
            }
        }
    }
    debug!("Health loop stopped");
}

async fn sweep_loop(terminals: Arc<TerminalManager>, interval: Duration, token: CancellationToken) {
    while pause(interval, &token).await {
        let closed = terminals.sweep_expired().await;
        if closed > 0 {
            info!("Idle sweep closed {} terminal session(s)", closed);
        }
    }
    debug!("Sweep loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::endpoint::EndpointStatus;
    use crate::mcp::executor::ExecOptions;
    use crate::mcp::testing::{MockConnector, endpoint};

    fn config() -> ManagerConfig {
        ManagerConfig {
            validate_keys: false,
            ..Default::default()
        }
    }

    fn manager_with(connector: Arc<MockConnector>, hosts: &[&str]) -> HardwareManager {
        let registry = EndpointRegistry::new();
        for host in hosts {
            registry.add(endpoint(host)).unwrap();
        }
        HardwareManager::assemble(config(), connector, registry)
    }

    mod construction {
        use super::*;

        #[test]
        fn test_new_rejects_invalid_config() {
            let config = ManagerConfig {
                max_requests_per_minute: 0,
                ..Default::default()
            };
            let result = HardwareManager::new(config, Arc::new(MockConnector::new()));
            assert!(matches!(result, Err(HardwareError::Configuration(_))));
        }

        #[test]
        fn test_new_loads_missing_registry_as_empty() {
            let config = ManagerConfig {
                registry_path: std::env::temp_dir()
                    .join(format!("hwmcp-manager-{}.json", uuid::Uuid::new_v4())),
                ..Default::default()
            };
            let manager = HardwareManager::new(config, Arc::new(MockConnector::new())).unwrap();
            assert!(manager.registry().is_empty());
        }
    }

    mod endpoints {
        use super::*;

        #[tokio::test]
        async fn test_add_and_remove_endpoint() {
            let manager = manager_with(Arc::new(MockConnector::new()), &[]);

            let added = manager
                .add_endpoint(EndpointSpec::new("gpu-7.example.com", "agent", "/keys/id"))
                .unwrap();
            assert_eq!(added.key(), "gpu-7.example.com:22");
            assert_eq!(manager.registry().len(), 1);

            let removed = manager.remove_endpoint("gpu-7.example.com").await.unwrap();
            assert_eq!(removed.key(), added.key());
            assert!(manager.registry().is_empty());
        }

        #[test]
        fn test_add_rejects_bad_hostname() {
            let manager = manager_with(Arc::new(MockConnector::new()), &[]);
            let result = manager.add_endpoint(EndpointSpec::new("bad;host", "agent", "/keys/id"));
            assert!(matches!(result, Err(HardwareError::Security(_))));
            assert!(manager.registry().is_empty());
        }

        #[test]
        fn test_add_validates_key_when_configured() {
            let registry = EndpointRegistry::new();
            let manager = HardwareManager::assemble(
                ManagerConfig::default(),
                Arc::new(MockConnector::new()),
                registry,
            );
            let result = manager.add_endpoint(EndpointSpec::new(
                "gpu-8.example.com",
                "agent",
                "/nonexistent/hwmcp/id_ed25519",
            ));
            assert!(matches!(result, Err(HardwareError::Security(_))));
        }

        #[tokio::test]
        async fn test_remove_unknown_endpoint() {
            let manager = manager_with(Arc::new(MockConnector::new()), &[]);
            assert!(matches!(
                manager.remove_endpoint("ghost.example.com").await,
                Err(HardwareError::EndpointNotFound(_))
            ));
        }

        #[tokio::test]
        async fn test_remove_closes_idle_connections() {
            let connector = Arc::new(MockConnector::new());
            let manager = manager_with(connector.clone(), &["gpu-1.example.com"]);
            let ep = manager.registry().get("gpu-1.example.com:22").unwrap();

            let result = manager
                .executor()
                .execute(&ep, "uptime", &ExecOptions::with_timeout(Duration::from_secs(5)))
                .await;
            assert!(result.success);
            assert_eq!(connector.close_count(), 0);

            manager.remove_endpoint("gpu-1.example.com").await.unwrap();
            assert_eq!(connector.close_count(), 1);
        }
    }

    mod selection {
        use super::*;

        #[tokio::test]
        async fn test_select_endpoint_without_endpoints() {
            let manager = manager_with(Arc::new(MockConnector::new()), &[]);
            assert!(matches!(
                manager.select_endpoint().await,
                Err(HardwareError::NoEndpointAvailable)
            ));
        }

        #[tokio::test]
        async fn test_select_endpoint_skips_failed_host() {
            let connector = Arc::new(MockConnector::new());
            connector.fail_host("gpu-1.example.com");
            let manager = manager_with(connector, &["gpu-1.example.com", "gpu-2.example.com"]);

            let selected = manager.select_endpoint().await.unwrap();
            assert_eq!(selected.hostname(), "gpu-2.example.com");
            assert_eq!(
                manager
                    .registry()
                    .get("gpu-1.example.com:22")
                    .unwrap()
                    .status(),
                EndpointStatus::Failed
            );
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_shutdown_stops_loops_and_closes_sessions() {
            let connector = Arc::new(MockConnector::new());
            let manager = manager_with(connector.clone(), &["gpu-1.example.com"]);
            manager.init();
            manager.init();
            assert_eq!(manager.tasks.lock().unwrap().len(), 2);

            let ep = manager.select_endpoint().await.unwrap();
            manager.terminals().create(&ep, None).await.unwrap();
            let result = manager
                .executor()
                .execute(
                    &ep,
                    "uptime",
                    &crate::mcp::executor::ExecOptions::with_timeout(Duration::from_secs(5)),
                )
                .await;
            assert!(result.success);

            manager.shutdown().await;
            assert!(manager.tasks.lock().unwrap().is_empty());
            assert!(manager.terminals().is_empty());
            assert_eq!(manager.pool.idle_count(&ep.key()), 0);
        }

        #[tokio::test]
        async fn test_init_after_shutdown_is_ignored() {
            let manager = manager_with(Arc::new(MockConnector::new()), &[]);
            manager.shutdown().await;
            manager.init();
            assert!(manager.tasks.lock().unwrap().is_empty());
        }
    }
}
