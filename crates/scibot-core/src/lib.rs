//! scibot-core - CI orchestration for the Scipion distribution
//!
//! Provides the building blocks of the CI master:
//! - Immutable [`settings::Settings`] and the validated plugin registry
//! - Shell step and build factory definitions
//! - Dynamic test-stage discovery ([`extract::StageExtractor`])
//! - Builder and scheduler assembly per build group
//! - A pipeline runner that executes a builder's factory

pub mod builder;
pub mod error;
pub mod extract;
pub mod factory;
pub mod pipeline;
pub mod plugins;
pub mod runner;
pub mod scheduler;
pub mod settings;
pub mod step;
pub mod telemetry;

// Re-export key types
pub use builder::{builders_for_group, plan_digest, BuilderConfig};
pub use error::{Result, ScibotError};
pub use extract::{ExtractorConfig, Grammar, StageExtractor};
pub use factory::{BuildFactory, FactoryStep, StageDiscovery};
pub use pipeline::{Pipeline, PipelineResult};
pub use plugins::{PluginRegistry, PluginSpec};
pub use runner::{StepResult, StepRunner};
pub use scheduler::{schedulers_for, Scheduler, SchedulerKind};
pub use settings::{BuildGroup, Settings};
pub use step::ShellStep;
pub use telemetry::init_tracing;

/// scibot version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
