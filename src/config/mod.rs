//! Configuration module for emberlm
//!
//! Loads config from `$XDG_CONFIG_HOME/emberlm/config.toml` or `~/.config/emberlm/config.toml`.
//! Falls back to embedded defaults if file doesn't exist.
//! Partial configs are merged with defaults using serde's default attributes.
//!
//! # Example
//!
//! ```no_run
//! use emberlm::config::Config;
//!
//! let config = Config::load().expect("Failed to load config");
//! println!("Models dir: {}", config.models.models_dir.display());
//! println!("Context length: {}", config.backend.settings.context_length);
//! ```

pub mod schema;

pub use schema::{BackendSection, Config, ModelsConfig};
