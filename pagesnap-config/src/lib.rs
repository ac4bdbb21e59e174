//! Configuration for pagesnap.
//!
//! Values are layered: built-in defaults, then an optional TOML file
//! (`--config`, `PAGESNAP_CONFIG`, `pagesnap.toml` or
//! `config/pagesnap.toml`), then environment variables, with `.env` loaded
//! first through `dotenvy`. The composed [`Config`] is checked against guard
//! rails before it is handed out.

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoader, ConfigLoaderOptions, error::ConfigLoadError};
pub use models::{
    CaptureConfig, Config, ConfigMetadata, FallbackConfig, QueueConfig, RedisConfig,
    ResultsConfig, Role, ServerConfig, StatusConfig, StorageConfig, WorkerConfig,
    sources::{EnvConfig, FileConfig},
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
