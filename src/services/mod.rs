//! Background Services Module
//!
//! Hosts the counter event poller under a [`ServiceManager`] that handles
//! startup and graceful shutdown.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  start/stop  ┌──────────────────────┐
//! │ ServiceManager  │─────────────▶│ CounterEventPoller   │
//! └─────────────────┘              └──────────────────────┘
//!                                        │ pending / process_message
//!                                        ▼
//!                                  ┌──────────────────────┐
//!                                  │ EventProcessor       │
//!                                  └──────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use cascade_store::services::{ServiceManager, ServiceConfig};
//!
//! let manager = ServiceManager::new(ServiceConfig::default());
//! assert_eq!(manager.status().len(), 0);
//! ```

pub mod framework;
pub mod poller;

pub use framework::{Service, ServiceConfig, ServiceError, ServiceManager, ServiceStatus};
pub use poller::{CounterEventPoller, PollerStats};
