//! Shell step execution with captured output and timeouts.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

use crate::error::{Result, ScibotError};
use crate::step::ShellStep;

/// Result of a step execution.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Step name.
    pub step_name: String,

    /// Exit code (0 = success, -1 = killed or spawn failure).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,
}

impl StepResult {
    /// Whether this step passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Synthetic failed result for a step that could not be executed at
    /// all (spawn error, timeout).
    pub fn execution_failure(step_name: &str, error: &str, duration_ms: u64) -> Self {
        Self {
            step_name: step_name.to_string(),
            exit_code: -1,
            stdout: String::new(),
            stderr: error.to_string(),
            duration_ms,
            success: false,
        }
    }
}

/// Executes a single [`ShellStep`] in a working directory with an
/// environment table.
pub struct StepRunner;

impl StepRunner {
    /// Run the step's argv, merging `base_env` under the step's own
    /// overrides, and capture combined output.
    ///
    /// Timeouts and spawn failures are `Err`; an ordinary non-zero exit
    /// is an `Ok` result with `success == false`.
    pub async fn execute(
        step: &ShellStep,
        workdir: Option<&Path>,
        base_env: &BTreeMap<String, String>,
    ) -> Result<StepResult> {
        let start = Instant::now();

        if step.command.is_empty() {
            return Err(ScibotError::EmptyCommand {
                name: step.name.clone(),
            });
        }

        let exe = &step.command[0];
        let args = &step.command[1..];

        let mut command = Command::new(exe);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out child must not outlive its step.
            .kill_on_drop(true);
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }
        for (key, value) in base_env {
            command.env(key, value);
        }
        for (key, value) in &step.env {
            command.env(key, value);
        }

        let child = command.spawn()?;

        let output = if step.timeout_secs > 0 {
            tokio::time::timeout(
                std::time::Duration::from_secs(step.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| ScibotError::StepTimeout {
                name: step.name.clone(),
                timeout_secs: step.timeout_secs,
            })??
        } else {
            child.wait_with_output().await?
        };

        let duration_ms = start.elapsed().as_millis() as u64;

        Ok(StepResult {
            step_name: step.name.clone(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms,
            success: output.status.success(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn test_step_result_passed() {
        let result = StepResult {
            step_name: "Scipion Config".to_string(),
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 100,
            success: true,
        };
        assert!(result.passed());
    }

    #[test]
    fn test_execution_failure_result() {
        let result = StepResult::execution_failure("Scipion Install", "timed out", 50);
        assert!(!result.passed());
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.stderr, "timed out");
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let step = ShellStep::new(
            "echo",
            vec!["echo".to_string(), "hello".to_string()],
            60,
        );
        let result = StepRunner::execute(&step, None, &no_env())
            .await
            .expect("execute failed");
        assert!(result.passed());
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let step = ShellStep::new("false", vec!["false".to_string()], 60);
        let result = StepRunner::execute(&step, None, &no_env())
            .await
            .expect("execute failed");
        assert!(!result.passed());
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_step_env_overrides_base_env() {
        let step = ShellStep::bash("env probe", "echo -n $EM_ROOT", 60).with_env(
            BTreeMap::from([("EM_ROOT".to_string(), "step-level".to_string())]),
        );
        let base = BTreeMap::from([("EM_ROOT".to_string(), "builder-level".to_string())]);

        let result = StepRunner::execute(&step, None, &base)
            .await
            .expect("execute failed");
        assert_eq!(result.stdout, "step-level");
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let step = ShellStep::new("empty", Vec::new(), 60);
        let err = StepRunner::execute(&step, None, &no_env()).await.unwrap_err();
        assert!(matches!(err, ScibotError::EmptyCommand { .. }));
    }

    #[tokio::test]
    async fn test_timeout_is_an_error() {
        let step = ShellStep::new(
            "sleep",
            vec!["sleep".to_string(), "5".to_string()],
            1,
        );
        let err = StepRunner::execute(&step, None, &no_env()).await.unwrap_err();
        assert!(matches!(err, ScibotError::StepTimeout { .. }));
    }

    #[tokio::test]
    async fn test_timed_out_child_is_killed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("late");
        let step = ShellStep::bash(
            "hang",
            format!("sleep 2 && touch {}", marker.display()),
            1,
        );

        let err = StepRunner::execute(&step, None, &no_env()).await.unwrap_err();
        assert!(matches!(err, ScibotError::StepTimeout { .. }));

        // Give an orphaned child time to reach the touch; a killed one
        // never does.
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        assert!(!marker.exists(), "child kept running past its timeout");
    }

    #[tokio::test]
    async fn test_workdir_applies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let step = ShellStep::new("pwd", vec!["pwd".to_string()], 60);
        let result = StepRunner::execute(&step, Some(dir.path()), &no_env())
            .await
            .expect("execute failed");
        assert!(result.stdout.trim_end().ends_with(
            dir.path().file_name().and_then(|n| n.to_str()).expect("name")
        ));
    }
}
