//! Public configuration types for shardfeed.
//!
//! Everything in this crate is plain data: it can be deserialized from the
//! YAML configuration file and carries no runtime behavior beyond defaults
//! and validation.

pub mod config;
pub mod error;

pub use config::{
    ExtraShardGroup, IngestConfig, PipelineSettings, PoolSettings, ShardsConfig, SourceSpec,
    StoreConfig, TlsConfig, TlsMode, TlsVersion,
};
pub use error::ConfigError;
