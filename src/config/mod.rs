//! # Configuration
//!
//! - `controller`: reconciler, watcher and persistence settings
//! - `server`: HTTP server settings
//! - `rules_file`: stores and rules declared in a YAML file

mod controller;
mod rules_file;
mod server;

pub use controller::ControllerConfig;
pub use rules_file::{LoadedRules, RuleEntry, RulesFile, RulesFileError, StoreEntry};
pub use server::ServerConfig;
