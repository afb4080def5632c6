//! Supervisor for long-running game server processes.
//!
//! Instances are launched either inside a detached `screen` session or as
//! direct children, tracked in one handle table, and administered through
//! RCON. Log files are tailed to any number of subscribers.

pub mod config_store;
pub mod console;
pub mod dispatch;
pub mod error;
pub mod launch;
pub mod log_tail;
pub mod properties;
pub mod rcon;
pub mod reconcile;
pub mod settings;
pub mod supervisor;

pub use config_store::{ConfigStore, InstanceConfig};
pub use error::{RconError, SupervisorError};
pub use settings::Settings;
pub use supervisor::{ProcessSupervisor, RuntimeHandle};
