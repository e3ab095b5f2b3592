//! Shared types, error model, and configuration for repolore.
//!
//! This crate is the foundation depended on by all other repolore crates.
//! It provides:
//! - [`RepoloreError`] — the unified error type
//! - Domain types ([`Dimension`], [`RawCandidate`], [`ScanResult`], [`SessionId`])
//! - The default dimension catalog ([`default_dimensions`])
//! - Configuration ([`AppConfig`], [`PipelineSection`], config loading)

pub mod config;
pub mod dimensions;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AgentSection, AppConfig, MissingAgentPolicy, PipelineSection, StorageSection, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use dimensions::default_dimensions;
pub use error::{RepoloreError, Result};
pub use types::{
    Dimension, FileSet, OutputKind, ProjectFacts, RawCandidate, ScanExample, ScanResult,
    ScanVariant, SessionId, SourceFile, TargetInfo, TargetMap,
};
