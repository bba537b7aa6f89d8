//! Build factories: ordered step sequences for each builder.
//!
//! A factory is a list of [`FactoryStep`]s plus the workdir they run in.
//! Most steps are plain [`ShellStep`]s; a [`StageDiscovery`] step runs a
//! probe command, extracts test identifiers from its output and expands
//! into one step per discovered test at execution time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, ScibotError};
use crate::extract::ExtractorConfig;
use crate::plugins::{PluginRegistry, PluginSpec};
use crate::settings::{BuildGroup, Settings, SCIPION_BUILD_ID};
use crate::step::{self, ShellStep};

/// The dynamic test factory step: run the probe, extract stages, schedule
/// one step per stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageDiscovery {
    /// Step name shown in the log.
    pub name: String,

    /// Probe command, e.g. `./scipion test --show --grep pyworkflow`.
    pub probe: Vec<String>,

    /// Extraction rules applied to the probe output.
    pub extractor: ExtractorConfig,

    /// Argv prefix each discovered stage is appended to,
    /// e.g. `./scipion test`.
    pub stage_prefix: Vec<String>,

    /// Per-stage environment overrides, keyed by the full identifier.
    pub stage_envs: BTreeMap<String, BTreeMap<String, String>>,

    /// Timeout in seconds applied to the probe and to every stage.
    pub timeout_secs: u64,

    /// Whether zero discovered stages is acceptable. Off by default:
    /// an empty list usually means the probe is broken.
    pub allow_empty: bool,

    /// Whether a failure here halts the rest of the factory.
    pub halt_on_failure: bool,
}

impl StageDiscovery {
    pub fn new(
        name: impl Into<String>,
        probe: Vec<String>,
        extractor: ExtractorConfig,
        timeout_secs: u64,
    ) -> Self {
        Self {
            name: name.into(),
            probe,
            extractor,
            stage_prefix: Vec::new(),
            stage_envs: BTreeMap::new(),
            timeout_secs,
            allow_empty: false,
            halt_on_failure: false,
        }
    }

    pub fn with_stage_prefix(mut self, prefix: Vec<String>) -> Self {
        self.stage_prefix = prefix;
        self
    }

    pub fn with_stage_envs(mut self, envs: BTreeMap<String, BTreeMap<String, String>>) -> Self {
        self.stage_envs = envs;
        self
    }

    pub fn tolerate_empty(mut self) -> Self {
        self.allow_empty = true;
        self
    }

    /// Step executed for one discovered stage: the prefix argv plus the
    /// identifier (split on whitespace — pattern-mode stages carry whole
    /// command lines), with that stage's env overrides merged in.
    pub fn stage_step(&self, stage: &str) -> ShellStep {
        let mut command = self.stage_prefix.clone();
        command.extend(stage.split_whitespace().map(str::to_string));

        let display = stage.rsplit('.').next().unwrap_or(stage);
        ShellStep::new(stage, command, self.timeout_secs)
            .describe(format!("Testing {display}"))
            .with_env(self.stage_envs.get(stage).cloned().unwrap_or_default())
            .tolerant()
    }
}

/// One entry of a factory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FactoryStep {
    Shell(ShellStep),
    Discovery(StageDiscovery),
}

impl FactoryStep {
    pub fn name(&self) -> &str {
        match self {
            FactoryStep::Shell(s) => &s.name,
            FactoryStep::Discovery(d) => &d.name,
        }
    }
}

/// Ordered step sequence executed in one worker directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildFactory {
    /// Directory (relative to the worker build root) the steps run in.
    pub workdir: String,
    steps: Vec<FactoryStep>,
}

impl BuildFactory {
    pub fn new(workdir: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            steps: Vec::new(),
        }
    }

    pub fn add_step(&mut self, step: ShellStep) {
        self.steps.push(FactoryStep::Shell(step));
    }

    pub fn add_discovery(&mut self, discovery: StageDiscovery) {
        self.steps.push(FactoryStep::Discovery(discovery));
    }

    pub fn steps(&self) -> &[FactoryStep] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(FactoryStep::name).collect()
    }
}

/// Steps shared by every distribution builder: checkout, conf wipe,
/// conf regeneration and the standard conf patches.
fn add_git_and_config_steps(
    factory: &mut BuildFactory,
    settings: &Settings,
    group: BuildGroup,
) -> Result<()> {
    let branch = settings
        .branch(group, SCIPION_BUILD_ID)
        .ok_or_else(|| ScibotError::UnknownGroup(group.id().to_string()))?;

    factory.add_step(step::git_pull(settings, branch));
    factory.add_step(step::remove_local_conf());
    factory.add_step(step::remove_home_conf(settings));
    factory.add_step(step::regenerate_conf(settings));
    factory.add_step(step::disable_notify(settings));
    for s in step::set_conf_vars(settings) {
        factory.add_step(s);
    }
    factory.add_step(step::set_data_tests_dir(settings));
    Ok(())
}

/// Install builder: checkout + configure + compile + plugin manifest +
/// post-install conf appends.
pub fn install_factory(
    settings: &Settings,
    registry: &PluginRegistry,
    group: BuildGroup,
) -> Result<BuildFactory> {
    let mut factory = BuildFactory::new(SCIPION_BUILD_ID);
    add_git_and_config_steps(&mut factory, settings, group)?;
    factory.add_step(step::install_scipion(settings));
    factory.add_step(
        ShellStep::new(
            "Test software/lib",
            vec!["ls".to_string(), "-1".to_string(), "software/lib".to_string()],
            settings.timeouts.short,
        )
        .describe("Check software/lib exists after installing scipion"),
    );
    factory.add_step(step::write_plugins_manifest(settings, registry)?);
    for s in step::append_conf_vars(settings) {
        factory.add_step(s);
    }
    Ok(factory)
}

/// Test builder for the distribution core: discover every `pyworkflow`
/// test and run each as its own stage.
pub fn distribution_test_factory(settings: &Settings) -> BuildFactory {
    let mut factory = BuildFactory::new(SCIPION_BUILD_ID);

    // The streaming extraction workflow needs the pinned EMAN version.
    let streaming_test =
        "pyworkflow.tests.em.workflows.test_workflow_streaming.TestRelionExtractStreaming";
    let stage_envs = BTreeMap::from([(streaming_test.to_string(), settings.env_pin("eman212"))]);

    let extractor = ExtractorConfig::new("pyworkflow")
        .with_root_name(trimmed_cmd(&settings.scipion_cmd))
        .with_blacklist(settings.blacklist());

    factory.add_discovery(
        StageDiscovery::new(
            "Generate Scipion test stages",
            probe_cmd(settings, "pyworkflow"),
            extractor,
            settings.timeouts.execute,
        )
        .with_stage_prefix(vec![settings.scipion_cmd.clone(), "test".to_string()])
        .with_stage_envs(stage_envs),
    );

    factory
}

/// Builder for one plugin: optional install, then per-module test
/// discovery.
pub fn plugin_factory(settings: &Settings, plugin: &PluginSpec) -> BuildFactory {
    let mut factory = BuildFactory::new(SCIPION_BUILD_ID);
    let module = plugin.module_name();

    if plugin.do_install {
        factory.add_step(
            ShellStep::new(
                format!("Install plugin {module}"),
                vec![
                    settings.scipion_cmd.clone(),
                    "installp".to_string(),
                    "-p".to_string(),
                    plugin.name.clone(),
                ],
                settings.timeouts.install,
            )
            .describe(format!("Install plugin {module}")),
        );
        for binary in &plugin.extra_binaries {
            factory.add_step(
                ShellStep::new(
                    format!("Install {binary}"),
                    vec![
                        settings.scipion_cmd.clone(),
                        "installb".to_string(),
                        binary.clone(),
                    ],
                    settings.timeouts.install,
                )
                .describe(format!("Install binary package {binary}")),
            );
        }
    }

    if plugin.do_test {
        let extractor = ExtractorConfig::new(module)
            .with_root_name(trimmed_cmd(&settings.scipion_cmd))
            .with_blacklist(settings.blacklist());

        factory.add_discovery(
            StageDiscovery::new(
                format!("Generate Scipion test stages for {module}"),
                probe_cmd(settings, module),
                extractor,
                settings.timeouts.execute,
            )
            .with_stage_prefix(vec![settings.scipion_cmd.clone(), "test".to_string()]),
        );
    }

    factory
}

/// Test builder for the Xmipp bundle: pattern-mode discovery over the
/// bundle's own test lister, once for programs and once for functions.
pub fn bundle_test_factory(settings: &Settings) -> BuildFactory {
    let mut factory = BuildFactory::new("xmipp-bundle");

    let probe = vec![
        settings.xmipp_cmd.clone(),
        "test".to_string(),
        "--show".to_string(),
    ];
    let blacklist = settings.blacklist();

    factory.add_discovery(StageDiscovery::new(
        "Generate test stages for Xmipp programs",
        probe.clone(),
        ExtractorConfig::new("xmipp")
            .with_pattern(format!("{} test (.*)", regex::escape(&settings.xmipp_cmd)))
            .with_blacklist(blacklist.clone()),
        settings.timeouts.execute,
    ));

    factory.add_discovery(StageDiscovery::new(
        "Generate test stages for Xmipp functions",
        probe,
        ExtractorConfig::new("xmipp")
            .with_pattern("xmipp_test_(.*)")
            .with_blacklist(blacklist),
        settings.timeouts.execute,
    ));

    factory
}

/// Cleanup builder: wipe the build trees so the next cycle starts fresh.
pub fn cleanup_factory(settings: &Settings) -> BuildFactory {
    let mut factory = BuildFactory::new(".");
    for dir in [SCIPION_BUILD_ID, "xmipp"] {
        factory.add_step(
            ShellStep::new(
                format!("Removing {dir}"),
                vec!["rm".to_string(), "-rf".to_string(), dir.to_string()],
                settings.timeouts.install,
            )
            .describe(format!("Remove the {dir} build tree")),
        );
    }
    factory
}

/// `./scipion test --show --grep <module> --mode onlyclasses`
fn probe_cmd(settings: &Settings, module: &str) -> Vec<String> {
    vec![
        settings.scipion_cmd.clone(),
        "test".to_string(),
        "--show".to_string(),
        "--grep".to_string(),
        module.to_string(),
        "--mode".to_string(),
        "onlyclasses".to_string(),
    ]
}

/// Probe lines report the bare program name, without the `./` the
/// launcher path carries.
fn trimmed_cmd(cmd: &str) -> String {
    cmd.trim_start_matches("./").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    #[test]
    fn test_install_factory_step_order() {
        let settings = Settings::default();
        let registry = PluginRegistry::default();
        let factory = install_factory(&settings, &registry, BuildGroup::Devel).expect("factory");
        let names = factory.step_names();

        assert_eq!(names[0], "Scipion Git Repository Pull");
        assert!(names.contains(&"Scipion Config"));
        assert!(names.contains(&"Scipion Install"));
        // Conf regeneration happens before the install.
        let conf = names.iter().position(|n| *n == "Scipion Config").expect("conf");
        let install = names.iter().position(|n| *n == "Scipion Install").expect("install");
        assert!(conf < install);
    }

    #[test]
    fn test_install_factory_writes_plugin_manifest() {
        let settings = Settings::default();
        let registry =
            PluginRegistry::new(vec![PluginSpec::new("scipion-em-relion")]).expect("registry");
        let factory = install_factory(&settings, &registry, BuildGroup::Devel).expect("factory");
        let names = factory.step_names();

        // The manifest lands on the worker after the install, so the
        // plugin builders can read it from the build tree.
        let install = names.iter().position(|n| *n == "Scipion Install").expect("install");
        let manifest = names
            .iter()
            .position(|n| *n == "Write plugins manifest")
            .expect("manifest step missing");
        assert!(install < manifest);

        let FactoryStep::Shell(step) = &factory.steps()[manifest] else {
            panic!("expected shell step");
        };
        assert!(step.command[2].contains(&settings.plugins_file));
        assert!(step.command[2].contains("scipion-em-relion"));
    }

    #[test]
    fn test_distribution_test_factory_discovers_pyworkflow() {
        let settings = Settings::default();
        let factory = distribution_test_factory(&settings);
        let discovery = match &factory.steps()[0] {
            FactoryStep::Discovery(d) => d,
            other => panic!("expected discovery step, got {other:?}"),
        };

        assert_eq!(discovery.extractor.target_test_set, "pyworkflow");
        assert!(discovery.probe.contains(&"--show".to_string()));
        assert_eq!(
            discovery.stage_prefix,
            vec![settings.scipion_cmd.clone(), "test".to_string()]
        );
        // Long tests stay blacklisted.
        assert!(discovery.extractor.blacklist.contains(
            "pyworkflow.tests.em.workflows.test_workflow_initialvolume.TestRibosome"
        ));
    }

    #[test]
    fn test_plugin_factory_honors_flags() {
        let settings = Settings::default();

        let full = plugin_factory(&settings, &PluginSpec::new("scipion-em-relion"));
        assert_eq!(full.step_names().len(), 2);

        let mut no_install = PluginSpec::new("scipion-em-relion");
        no_install.do_install = false;
        let factory = plugin_factory(&settings, &no_install);
        assert_eq!(factory.step_names(), vec!["Generate Scipion test stages for relion"]);

        let mut no_test = PluginSpec::new("scipion-em-relion");
        no_test.do_test = false;
        let factory = plugin_factory(&settings, &no_test);
        assert_eq!(factory.step_names(), vec!["Install plugin relion"]);
    }

    #[test]
    fn test_plugin_factory_installs_extra_binaries_in_order() {
        let settings = Settings::default();
        let mut plugin = PluginSpec::new("scipion-em-xmipp");
        plugin.module = Some("xmipp3".to_string());
        plugin.extra_binaries = vec!["deepLearningToolkit".to_string(), "nma".to_string()];

        let factory = plugin_factory(&settings, &plugin);
        assert_eq!(
            factory.step_names(),
            vec![
                "Install plugin xmipp3",
                "Install deepLearningToolkit",
                "Install nma",
                "Generate Scipion test stages for xmipp3",
            ]
        );
    }

    #[test]
    fn test_bundle_factory_uses_pattern_mode() {
        let settings = Settings::default();
        let factory = bundle_test_factory(&settings);
        assert_eq!(factory.steps().len(), 2);
        for step in factory.steps() {
            let FactoryStep::Discovery(d) = step else {
                panic!("expected discovery step");
            };
            assert!(d.extractor.pattern.is_some());
        }
    }

    #[test]
    fn test_stage_step_merges_env_and_prefix() {
        let settings = Settings::default();
        let streaming =
            "pyworkflow.tests.em.workflows.test_workflow_streaming.TestRelionExtractStreaming";
        let factory = distribution_test_factory(&settings);
        let FactoryStep::Discovery(d) = &factory.steps()[0] else {
            panic!("expected discovery step");
        };

        let step = d.stage_step(streaming);
        assert_eq!(step.name, streaming);
        assert_eq!(step.command[0], settings.scipion_cmd);
        assert_eq!(step.command[1], "test");
        assert_eq!(step.command[2], streaming);
        assert!(step.env.contains_key("EMAN2DIR"));
        assert!(!step.halt_on_failure);

        // A stage without an env pin gets an empty override set.
        let plain = d.stage_step("pyworkflow.tests.TestA");
        assert!(plain.env.is_empty());
        assert_eq!(plain.description, "Testing TestA");
    }

    #[test]
    fn test_stage_step_splits_pattern_mode_commands() {
        let d = StageDiscovery::new(
            "bundle",
            vec!["./xmipp".to_string(), "test".to_string(), "--show".to_string()],
            ExtractorConfig::new("xmipp").with_pattern(r"\./xmipp test (.*)"),
            60,
        );
        let step = d.stage_step("./xmipp test cudaBasic");
        assert_eq!(
            step.command,
            vec!["./xmipp".to_string(), "test".to_string(), "cudaBasic".to_string()]
        );
    }

    #[test]
    fn test_cleanup_factory_removes_both_trees() {
        let factory = cleanup_factory(&Settings::default());
        assert_eq!(factory.step_names(), vec!["Removing scipion", "Removing xmipp"]);
    }
}
