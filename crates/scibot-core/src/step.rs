//! Shell step definitions and the canned configuration-patching steps.
//!
//! A [`ShellStep`] is one unit of work inside a factory: an argv to run,
//! a timeout and a halt-on-failure flag. The constructors mirror the
//! recurring shapes in the orchestration: plain argv steps, `bash -c`
//! one-liners, and sed-based edits of the distribution's conf files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::plugins::PluginRegistry;
use crate::settings::Settings;

/// Configuration for one shell step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShellStep {
    /// Step name shown in the orchestration log.
    pub name: String,

    /// Longer description for the log.
    pub description: String,

    /// Command to execute (first element is the executable).
    pub command: Vec<String>,

    /// Timeout in seconds (0 = no timeout).
    pub timeout_secs: u64,

    /// Whether a non-zero exit halts the rest of the factory.
    pub halt_on_failure: bool,

    /// Environment overrides for this step only.
    pub env: BTreeMap<String, String>,
}

impl ShellStep {
    pub fn new(name: impl Into<String>, command: Vec<String>, timeout_secs: u64) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            command,
            timeout_secs,
            halt_on_failure: true,
            env: BTreeMap::new(),
        }
    }

    /// A `bash -c` one-liner.
    pub fn bash(name: impl Into<String>, script: impl Into<String>, timeout_secs: u64) -> Self {
        Self::new(
            name,
            vec!["bash".to_string(), "-c".to_string(), script.into()],
            timeout_secs,
        )
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// A failure of this step does not halt the factory.
    pub fn tolerant(mut self) -> Self {
        self.halt_on_failure = false;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Render the sed invocation that substitutes `var = <value>` in a
/// conf file. Slashes in the value must be escaped for sed's `s///`.
pub fn change_conf_var(var: &str, value: &str, file: &str, escape_slash: bool) -> Vec<String> {
    let value = if escape_slash {
        value.replace('/', "\\/")
    } else {
        value.to_string()
    };
    vec![
        "bash".to_string(),
        "-c".to_string(),
        format!("sed -i -e \"s/{var} = .*/{var} = {value}/\" {file}"),
    ]
}

/// Render the sed invocation that appends `var = <value>` at the end of
/// a conf file (for variables the generator does not emit at all).
pub fn append_conf_var(var: &str, value: &str, file: &str) -> Vec<String> {
    vec![
        "bash".to_string(),
        "-c".to_string(),
        format!("sed -ie \"\\$a{var} = {value}\" {file}"),
    ]
}

/// Delete the conf file inside the build workdir.
pub fn remove_local_conf() -> ShellStep {
    ShellStep::new(
        "Clean Scipion Config",
        vec![
            "rm".to_string(),
            "-f".to_string(),
            "config/scipion.conf".to_string(),
        ],
        0,
    )
    .describe("Delete existing conf file at scipion HOME")
    .tolerant()
}

/// Delete the per-user conf file.
pub fn remove_home_conf(settings: &Settings) -> ShellStep {
    ShellStep::bash(
        "Clean Scipion Config at USERS HOME",
        format!("rm {}", settings.local_config_path),
        0,
    )
    .describe("Delete existing conf file at users HOME")
    .tolerant()
}

/// Regenerate the conf files from scratch.
pub fn regenerate_conf(settings: &Settings) -> ShellStep {
    ShellStep::new(
        "Scipion Config",
        vec![
            settings.scipion_cmd.clone(),
            "config".to_string(),
            "--notify".to_string(),
            "--overwrite".to_string(),
        ],
        settings.timeouts.short,
    )
    .describe("Create installation configuration files")
}

/// Turn off usage notifications so CI runs stay out of the stats.
pub fn disable_notify(settings: &Settings) -> ShellStep {
    ShellStep::bash(
        "Cancel notifications",
        format!(
            "sed -i -e \"s/SCIPION_NOTIFY = True/SCIPION_NOTIFY = False/g\" {}",
            settings.local_config_path
        ),
        settings.timeouts.short,
    )
    .describe("Do not notify usage from CI builds")
}

/// One step per configured conf variable, substituted in place.
pub fn set_conf_vars(settings: &Settings) -> Vec<ShellStep> {
    settings
        .conf_vars
        .iter()
        .map(|(var, value)| {
            ShellStep::new(
                format!("Change {var}"),
                change_conf_var(var, value, "config/scipion.conf", true),
                settings.timeouts.short,
            )
            .describe(format!("Set the right {var} path"))
        })
        .collect()
}

/// One step per configured conf append, added at the end of the
/// per-user conf file.
pub fn append_conf_vars(settings: &Settings) -> Vec<ShellStep> {
    settings
        .conf_appends
        .iter()
        .map(|(var, value)| {
            ShellStep::new(
                format!("Set {var} in scipion conf"),
                append_conf_var(var, value, &settings.local_config_path),
                settings.timeouts.short,
            )
        })
        .collect()
}

/// Point SCIPION_TESTS at the shared data directory to save storage.
pub fn set_data_tests_dir(settings: &Settings) -> ShellStep {
    ShellStep::new(
        "Set data tests dir",
        vec![
            "sed".to_string(),
            "-i".to_string(),
            "-e".to_string(),
            "s/SCIPION_TESTS = data\\/tests/SCIPION_TESTS = ~\\/data\\/tests/g".to_string(),
            "config/scipion.conf".to_string(),
        ],
        settings.timeouts.short,
    )
    .describe("Use the common data tests dir")
}

/// Compile the distribution.
pub fn install_scipion(settings: &Settings) -> ShellStep {
    ShellStep::new(
        "Scipion Install",
        vec![
            settings.scipion_cmd.clone(),
            "install".to_string(),
            "-j".to_string(),
            "8".to_string(),
        ],
        settings.timeouts.install,
    )
    .describe("Compile everything that needs re-compiling")
}

/// Remove every EM package except xmipp (they get reinstalled by the
/// plugins needing them).
pub fn clean_em_packages(settings: &Settings) -> ShellStep {
    ShellStep::bash(
        "Clean EM packages",
        "ls software/em/ -1 -I xmipp | xargs -i rm -rf \"software/em/\"{}",
        settings.timeouts.short,
    )
    .describe("Delete existing EM software packages")
    .tolerant()
}

/// Drop downloaded tarballs so the next install fetches fresh ones.
pub fn clean_em_tarballs(settings: &Settings) -> ShellStep {
    ShellStep::bash(
        "Clean tgz files",
        "rm -rf software/tmp/* ; rm -rf software/em/*.tgz",
        settings.timeouts.short,
    )
    .describe("Delete downloaded tgz files to get the latest version")
    .tolerant()
}

/// Hand the plugin registry to the worker: the plugin builders read it
/// from the build tree, so the install step writes it there.
pub fn write_plugins_manifest(settings: &Settings, registry: &PluginRegistry) -> Result<ShellStep> {
    let manifest = serde_json::to_string_pretty(registry)?;
    Ok(ShellStep::bash(
        "Write plugins manifest",
        format!(
            "cat > {} <<'EOF'\n{}\nEOF",
            settings.plugins_file, manifest
        ),
        settings.timeouts.short,
    )
    .describe("Write the plugin registry to the worker"))
}

/// Incremental checkout of the distribution repository.
pub fn git_pull(settings: &Settings, branch: &str) -> ShellStep {
    ShellStep::bash(
        "Scipion Git Repository Pull",
        format!(
            "git clone {url} . 2>/dev/null || git fetch origin; git checkout {branch} && git pull origin {branch}",
            url = settings.git_repo_url,
        ),
        settings.timeouts.install,
    )
    .describe(format!("Incremental checkout of branch {branch}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_conf_var_escapes_slashes() {
        let cmd = change_conf_var("MPI_LIBDIR", "/usr/lib/openmpi", "config/scipion.conf", true);
        assert_eq!(cmd[0], "bash");
        assert_eq!(cmd[1], "-c");
        assert_eq!(
            cmd[2],
            "sed -i -e \"s/MPI_LIBDIR = .*/MPI_LIBDIR = \\/usr\\/lib\\/openmpi/\" config/scipion.conf"
        );
    }

    #[test]
    fn test_change_conf_var_verbatim_when_not_escaping() {
        let cmd = change_conf_var("CUDA", "True", "xmipp.conf", false);
        assert_eq!(cmd[2], "sed -i -e \"s/CUDA = .*/CUDA = True/\" xmipp.conf");
    }

    #[test]
    fn test_append_conf_var_appends_at_eof() {
        let cmd = append_conf_var("CCP4_HOME", "/opt/xtal/ccp4-7.1", "$HOME/scipion.conf");
        assert_eq!(
            cmd[2],
            "sed -ie \"\\$aCCP4_HOME = /opt/xtal/ccp4-7.1\" $HOME/scipion.conf"
        );
    }

    #[test]
    fn test_step_defaults() {
        let step = ShellStep::new("list", vec!["ls".to_string()], 60);
        assert!(step.halt_on_failure);
        assert_eq!(step.description, "list");
        assert!(step.env.is_empty());
    }

    #[test]
    fn test_tolerant_step_does_not_halt() {
        assert!(!remove_local_conf().halt_on_failure);
        assert!(!clean_em_packages(&Settings::default()).halt_on_failure);
    }

    #[test]
    fn test_set_conf_vars_covers_all_settings_entries() {
        let settings = Settings::default();
        let steps = set_conf_vars(&settings);
        assert_eq!(steps.len(), settings.conf_vars.len());
        assert!(steps.iter().any(|s| s.name == "Change MPI_LIBDIR"));
    }

    #[test]
    fn test_plugins_manifest_step_embeds_registry() {
        use crate::plugins::PluginSpec;

        let settings = Settings::default();
        let registry =
            PluginRegistry::new(vec![PluginSpec::new("scipion-em-relion")]).expect("registry");
        let step = write_plugins_manifest(&settings, &registry).expect("step");

        assert_eq!(step.name, "Write plugins manifest");
        assert!(step.command[2].starts_with(&format!("cat > {}", settings.plugins_file)));
        assert!(step.command[2].contains("scipion-em-relion"));
    }

    #[test]
    fn test_bash_step_shape() {
        let step = ShellStep::bash("probe", "echo hi", 5);
        assert_eq!(
            step.command,
            vec!["bash".to_string(), "-c".to_string(), "echo hi".to_string()]
        );
    }
}
