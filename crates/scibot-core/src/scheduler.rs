//! Scheduler assembly: every builder gets a triggerable scheduler (fired
//! by the orchestrator) and a force scheduler (fired manually from the
//! UI), named after the builder.

use serde::{Deserialize, Serialize};

use crate::builder::BuilderConfig;
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Fired programmatically by an upstream builder.
    Triggerable,
    /// Fired manually by an operator.
    Force,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduler {
    pub name: String,
    pub kind: SchedulerKind,
    pub builder_names: Vec<String>,
}

/// The scheduler pair for every builder in the plan.
pub fn schedulers_for(settings: &Settings, builders: &[BuilderConfig]) -> Vec<Scheduler> {
    let mut schedulers = Vec::with_capacity(builders.len() * 2);
    for builder in builders {
        schedulers.push(Scheduler {
            name: builder.name.clone(),
            kind: SchedulerKind::Triggerable,
            builder_names: vec![builder.name.clone()],
        });
        schedulers.push(Scheduler {
            name: format!("{}{}", settings.prefixes.force, builder.name),
            kind: SchedulerKind::Force,
            builder_names: vec![builder.name.clone()],
        });
    }
    schedulers
}
