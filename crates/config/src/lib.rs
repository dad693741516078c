//! Configuration loading and env substitution.
//!
//! Config files: `cadence.toml`, `cadence.yaml`, or `cadence.json`
//! Searched in `./` then `~/.config/cadence/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{config_dir, data_dir, discover_and_load, find_config_file, load_config},
    schema::{
        CacheBackend, CacheConfig, CadenceConfig, LedgerBackend, LedgerConfig, LockBackend,
        LockConfig,
    },
};
