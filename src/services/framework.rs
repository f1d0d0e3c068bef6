//! Service Framework
//!
//! Hosts long-running background tasks such as the counter event poller:
//! - [`Service`] trait for the task itself
//! - [`ServiceManager`] for start and graceful shutdown

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// Service Trait
// ============================================================================

/// A background task managed by the [`ServiceManager`]
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Run until `shutdown` fires
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError>;

    /// Service name for logging and lookups
    fn name(&self) -> &'static str;

    /// Current status
    fn status(&self) -> ServiceStatus;
}

// ============================================================================
// Service Status
// ============================================================================

/// Status of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Service is initializing
    Starting,

    /// Service is running normally
    Running,

    /// Service is shutting down
    Stopping,

    /// Service has stopped
    Stopped,

    /// Service failed with an error
    Failed(String),
}

impl ServiceStatus {
    /// Check if the service is in a healthy state
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceStatus::Running)
    }
}

// ============================================================================
// Service Error
// ============================================================================

/// Errors that can occur in services
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Service encountered an error during execution
    #[error("Service runtime error: {0}")]
    RuntimeError(String),

    /// A service with the same name is already registered or running
    #[error("Service already running")]
    AlreadyRunning,

    /// The requested service was not found in the registry
    #[error("Service not found: {0}")]
    NotFound(String),
}

// ============================================================================
// Service Config
// ============================================================================

/// Configuration for the service manager
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Timeout for graceful shutdown
    pub shutdown_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Service Manager
// ============================================================================

struct ServiceHandle {
    service: Arc<dyn Service>,
    task: Option<JoinHandle<Result<(), ServiceError>>>,
}

/// Coordinates background service lifecycles
pub struct ServiceManager {
    config: ServiceConfig,
    services: RwLock<HashMap<&'static str, ServiceHandle>>,
    shutdown_tx: broadcast::Sender<()>,
    running: RwLock<bool>,
}

impl ServiceManager {
    /// Create a new service manager
    pub fn new(config: ServiceConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            services: RwLock::new(HashMap::new()),
            shutdown_tx,
            running: RwLock::new(false),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ServiceConfig::default())
    }

    /// Register a service with the manager
    pub fn register(&self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let name = service.name();
        let mut services = self.services.write();

        if services.contains_key(name) {
            return Err(ServiceError::AlreadyRunning);
        }

        services.insert(
            name,
            ServiceHandle {
                service,
                task: None,
            },
        );

        tracing::debug!(service = name, "Service registered");
        Ok(())
    }

    /// Start all registered services
    pub async fn start_all(&self) -> Result<(), ServiceError> {
        {
            let mut running = self.running.write();
            if *running {
                return Err(ServiceError::AlreadyRunning);
            }
            *running = true;
        }

        let names: Vec<&'static str> = self.services.read().keys().copied().collect();
        for name in names {
            self.start_service(name).await?;
        }

        tracing::info!("All services started");
        Ok(())
    }

    /// Start a specific service
    pub async fn start_service(&self, name: &'static str) -> Result<(), ServiceError> {
        let service = {
            let mut services = self.services.write();
            let handle = services
                .get_mut(name)
                .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;

            let service = Arc::clone(&handle.service);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let runner = Arc::clone(&service);
            handle.task = Some(tokio::spawn(async move { runner.start(shutdown_rx).await }));
            service
        };

        // Give the service a moment to report Running
        let start_wait = Instant::now();
        let max_wait = Duration::from_millis(100);
        while start_wait.elapsed() < max_wait {
            if service.status().is_healthy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tracing::debug!(service = name, "Service started");
        Ok(())
    }

    /// Stop all services gracefully
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        tracing::info!("Initiating graceful shutdown");

        let _ = self.shutdown_tx.send(());

        let tasks: Vec<(&'static str, JoinHandle<Result<(), ServiceError>>)> = {
            let mut services = self.services.write();
            services
                .iter_mut()
                .filter_map(|(name, handle)| handle.task.take().map(|task| (*name, task)))
                .collect()
        };

        let deadline = Instant::now() + self.config.shutdown_timeout;

        for (name, task) in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());

            match tokio::time::timeout(remaining, task).await {
                Ok(Ok(Ok(()))) => {
                    tracing::debug!(service = name, "Service stopped gracefully");
                },
                Ok(Ok(Err(e))) => {
                    tracing::warn!(service = name, error = %e, "Service stopped with error");
                },
                Ok(Err(e)) => {
                    tracing::error!(service = name, error = %e, "Service task panicked");
                },
                Err(_) => {
                    tracing::warn!(service = name, "Service shutdown timed out, aborting");
                },
            }
        }

        *self.running.write() = false;
        tracing::info!("Shutdown complete");
        Ok(())
    }

    /// Get the status of all services
    pub fn status(&self) -> HashMap<&'static str, ServiceStatus> {
        let services = self.services.read();
        services
            .iter()
            .map(|(name, handle)| (*name, handle.service.status()))
            .collect()
    }

    /// Get the status of a specific service
    pub fn service_status(&self, name: &str) -> Option<ServiceStatus> {
        let services = self.services.read();
        services.get(name).map(|h| h.service.status())
    }

    /// Check if all services are healthy
    pub fn is_healthy(&self) -> bool {
        let services = self.services.read();
        services.values().all(|h| h.service.status().is_healthy())
    }
}
