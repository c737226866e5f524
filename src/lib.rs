//! Slotmux - zero-downtime dual-slot database credential rotation.
//!
//! Two database users, slot A and slot B, are kept valid at all times. A run
//! moves the application from the active slot to the standby slot, verifies
//! it, and only then gives the previous slot a fresh password. The secret
//! store, the database, a shared config file and the orchestrator's runtime
//! secret are kept in lockstep, and every run is resumable from durable
//! state.
//!
//! # Features
//!
//! - **Dual-slot rotation**: the old credential keeps working until every
//!   replica has restarted
//! - **Rollback**: a failed switch restores the config file byte for byte
//! - **Self-healing**: drift between the secret and the application is
//!   corrected on the next run
//! - **Dry run**: every mutation is logged and skipped
//! - **Feature Flags**: optional backend compilation to minimize dependencies
//!
//! # Quick Start
//!
//! ```no_run
//! use slotmux::{factory, Config};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> slotmux::Result<()> {
//!     let config = Config::new("openemr/db-slots", "openemr/db-admin")
//!         .with_region("us-east-1")
//!         .with_kubernetes("openemr", "openemr", "openemr-db-credentials")
//!         .with_health_url("https://openemr.internal/interface/login/login.php")
//!         .with_rollout_timeout(Duration::from_secs(900));
//!     config.validate()?;
//!
//!     let engine = factory::new_engine(config).await?;
//!     let report = engine.run().await;
//!     println!("{}", report.to_json()?);
//!     Ok(())
//! }
//! ```
//!
//! # Backends
//!
//! | Concern | Backend | Feature Flag |
//! |---------|---------|--------------|
//! | Secret store | AWS Secrets Manager | `aws` |
//! | Database | MySQL over TLS | `mysql` |
//! | Orchestrator | Kubernetes | `kubernetes` |
//! | All of the above | In-memory mocks | `mock` (default) |
//!
//! Use `full` to enable every real backend:
//!
//! ```toml
//! [dependencies]
//! slotmux = { version = "0.1", features = ["full"] }
//! ```

pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod factory;
pub mod retry;
pub mod rotation;
pub mod runtime;
pub mod secrets;
pub mod shared_config;
pub mod slot;
pub mod sqlconf;
pub mod validation;
pub mod validator;

pub use config::Config;
pub use error::{Result, RotationError};
pub use rotation::{RotationEngine, RunReport, RunStatus};
pub use slot::{AdminCredential, DbCredential, Slot, SlotSecret};
