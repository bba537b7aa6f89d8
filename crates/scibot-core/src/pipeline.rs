//! Factory execution: walk a builder's steps in order, expanding stage
//! discovery in place.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::builder::BuilderConfig;
use crate::error::Result;
use crate::factory::{FactoryStep, StageDiscovery};
use crate::runner::{StepResult, StepRunner};
use crate::step::ShellStep;

/// Result of a complete builder execution.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// Unique id of this run.
    pub run_id: String,

    /// Builder that was executed.
    pub builder: String,

    /// Whether every executed step passed.
    pub success: bool,

    /// Whether a halting failure cut the factory short.
    pub halted: bool,

    /// Results of individual steps, in execution order. Discovered test
    /// stages appear here as ordinary steps, right after the discovery
    /// step that produced them.
    pub steps: Vec<StepResult>,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl PipelineResult {
    /// Number of steps that passed.
    pub fn passed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.passed()).count()
    }

    /// Number of steps that failed.
    pub fn failed_count(&self) -> usize {
        self.steps.iter().filter(|s| !s.passed()).count()
    }
}

/// Executes a builder's factory.
pub struct Pipeline;

impl Pipeline {
    /// Run every step of `builder` in order. Steps run inside `workdir`
    /// when given, otherwise inside the factory's configured workdir
    /// (resolved relative to the current directory).
    ///
    /// A failing step halts the factory when its `halt_on_failure` flag
    /// is set; otherwise execution continues and the failure is reflected
    /// in the final result. Discovery steps run their probe, extract the
    /// stage list and execute one step per stage in place.
    pub async fn run(builder: &BuilderConfig, workdir: Option<&Path>) -> Result<PipelineResult> {
        let started_at = Utc::now();
        let start = std::time::Instant::now();
        let run_id = Uuid::new_v4().to_string();

        let fallback = PathBuf::from(&builder.factory.workdir);
        let workdir: Option<&Path> = Some(workdir.unwrap_or(fallback.as_path()));

        info!(run_id = %run_id, builder = %builder.name, "Starting builder");

        let mut steps = Vec::new();
        let mut all_passed = true;
        let mut halted = false;

        for step in builder.factory.steps() {
            match step {
                FactoryStep::Shell(shell) => {
                    let result = Self::run_shell(shell, workdir, &builder.env).await;
                    let failed = !result.passed();
                    steps.push(result);
                    if failed {
                        all_passed = false;
                        if shell.halt_on_failure {
                            warn!(step = %shell.name, "Halting builder on failed step");
                            halted = true;
                            break;
                        }
                    }
                }
                FactoryStep::Discovery(discovery) => {
                    let ok =
                        Self::run_discovery(discovery, workdir, &builder.env, &mut steps).await?;
                    if !ok {
                        all_passed = false;
                        if discovery.halt_on_failure {
                            warn!(step = %discovery.name, "Halting builder on failed discovery");
                            halted = true;
                            break;
                        }
                    }
                }
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        if all_passed {
            info!(run_id = %run_id, builder = %builder.name, "Builder passed");
        } else {
            info!(run_id = %run_id, builder = %builder.name, "Builder failed");
        }

        Ok(PipelineResult {
            run_id,
            builder: builder.name.clone(),
            success: all_passed,
            halted,
            steps,
            started_at,
            duration_ms,
        })
    }

    /// Execute one shell step, folding spawn/timeout errors into a failed
    /// result so the factory loop sees a uniform outcome.
    async fn run_shell(
        step: &ShellStep,
        workdir: Option<&Path>,
        env: &BTreeMap<String, String>,
    ) -> StepResult {
        info!(step = %step.name, "Executing step");
        let start = std::time::Instant::now();
        match StepRunner::execute(step, workdir, env).await {
            Ok(result) => result,
            Err(e) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                warn!(step = %step.name, error = %e, "Step execution error");
                StepResult::execution_failure(&step.name, &e.to_string(), duration_ms)
            }
        }
    }

    /// Run a discovery step: probe, extract, expand. Returns whether the
    /// discovery (including every expanded stage) passed.
    ///
    /// Extraction is only attempted when the probe exits zero; a failing
    /// probe surfaces as the discovery step's own failure. Zero
    /// discovered stages fails the step unless `allow_empty` is set.
    async fn run_discovery(
        discovery: &StageDiscovery,
        workdir: Option<&Path>,
        env: &BTreeMap<String, String>,
        steps: &mut Vec<StepResult>,
    ) -> Result<bool> {
        let extractor = discovery.extractor.compile()?;

        let probe_step = ShellStep::new(
            discovery.name.clone(),
            discovery.probe.clone(),
            discovery.timeout_secs,
        );
        let probe_result = Self::run_shell(&probe_step, workdir, env).await;

        if !probe_result.passed() {
            warn!(step = %discovery.name, exit_code = probe_result.exit_code,
                  "Probe command failed, skipping extraction");
            steps.push(probe_result);
            return Ok(false);
        }

        let stages = extractor.extract(&probe_result.stdout);
        info!(step = %discovery.name, stages = stages.len(), "Discovered test stages");

        if stages.is_empty() && !discovery.allow_empty {
            warn!(step = %discovery.name, "No test stages discovered");
            let mut failed = probe_result;
            failed.success = false;
            failed.exit_code = -1;
            steps.push(failed);
            return Ok(false);
        }

        steps.push(probe_result);

        let mut all_passed = true;
        for stage in &stages {
            let stage_step = discovery.stage_step(stage);
            let result = Self::run_shell(&stage_step, workdir, env).await;
            if !result.passed() {
                all_passed = false;
            }
            steps.push(result);
        }

        Ok(all_passed)
    }
}
