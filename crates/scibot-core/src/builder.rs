//! Builder assembly: one `BuilderConfig` per unit the schedulers can
//! trigger, assembled per build group from the settings and the plugin
//! registry.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::factory::{self, BuildFactory};
use crate::plugins::PluginRegistry;
use crate::settings::{BuildGroup, Settings};

/// A named, schedulable build configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuilderConfig {
    pub name: String,

    /// Tags shown in the orchestration UI (group id, module name).
    pub tags: Vec<String>,

    /// Workers allowed to run this builder.
    pub workers: Vec<String>,

    pub factory: BuildFactory,

    /// Environment applied to every step of the factory.
    pub env: BTreeMap<String, String>,

    /// Free-form properties (notification channel etc.).
    pub properties: BTreeMap<String, String>,
}

impl BuilderConfig {
    fn new(name: String, tags: Vec<String>, worker: &str, factory: BuildFactory) -> Self {
        Self {
            name,
            tags,
            workers: vec![worker.to_string()],
            factory,
            env: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    fn with_channel(mut self, channel: &str) -> Self {
        self.properties
            .insert("slack_channel".to_string(), channel.to_string());
        self
    }
}

/// Module name of the in-distribution xmipp plugin. It gets dedicated
/// split builders rather than the generic per-plugin one.
const XMIPP_MODULE: &str = "xmipp3";

/// Base environment for distribution builders.
fn base_env() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "SCIPION_IGNORE_PYTHONPATH".to_string(),
        "True".to_string(),
    )])
}

/// The full builder set for one group: install, core tests, cleanup and
/// one builder per registered plugin (in registry order).
pub fn scipion_builders(
    settings: &Settings,
    registry: &PluginRegistry,
    group: BuildGroup,
) -> Result<Vec<BuilderConfig>> {
    let env = base_env();
    let worker = &settings.workers.primary;
    let mut builders = Vec::new();

    builders.push(
        BuilderConfig::new(
            format!("{}{}", settings.prefixes.install, group),
            vec![group.id().to_string()],
            worker,
            factory::install_factory(settings, registry, group)?,
        )
        .with_env(env.clone())
        .with_channel(&settings.scipion_channel),
    );

    builders.push(
        BuilderConfig::new(
            format!("{}{}", settings.prefixes.tests, group),
            vec![group.id().to_string()],
            worker,
            factory::distribution_test_factory(settings),
        )
        .with_env(env.clone())
        .with_channel(&settings.scipion_channel),
    );

    builders.push(
        BuilderConfig::new(
            format!("{}{}", settings.prefixes.cleanup, group),
            vec![group.id().to_string()],
            worker,
            factory::cleanup_factory(settings),
        )
        .with_env(env.clone())
        .with_channel(&settings.scipion_channel),
    );

    for plugin in registry.iter() {
        let module = plugin.module_name();
        if module == XMIPP_MODULE {
            continue;
        }
        let mut plugin_env = env.clone();
        plugin_env.extend(plugin.env.clone());

        builders.push(
            BuilderConfig::new(
                format!("{module}_{group}"),
                vec![group.id().to_string(), module.to_string()],
                worker,
                factory::plugin_factory(settings, plugin),
            )
            .with_env(plugin_env)
            .with_channel(plugin.slack_channel.as_deref().unwrap_or("")),
        );
    }

    Ok(builders)
}

/// Xmipp builders for one group: a dedicated install builder, the
/// in-distribution test builder and, for the devel group, the
/// standalone bundle tests. Install and tests are split so a broken
/// xmipp build does not mask the test results of the previous one.
pub fn xmipp_builders(
    settings: &Settings,
    registry: &PluginRegistry,
    group: BuildGroup,
) -> Result<Vec<BuilderConfig>> {
    let mut builders = Vec::new();
    let env = base_env();

    if let Some(plugin) = registry.get(XMIPP_MODULE) {
        let mut xmipp_env = env.clone();
        xmipp_env.extend(plugin.env.clone());

        let mut install_only = plugin.clone();
        install_only.do_test = false;
        builders.push(
            BuilderConfig::new(
                format!("{}{}", settings.prefixes.xmipp_install, group),
                vec![group.id().to_string(), XMIPP_MODULE.to_string()],
                &settings.workers.primary,
                factory::plugin_factory(settings, &install_only),
            )
            .with_env(xmipp_env.clone())
            .with_channel(&settings.xmipp_channel),
        );

        let mut test_only = plugin.clone();
        test_only.do_install = false;
        test_only.extra_binaries.clear();
        builders.push(
            BuilderConfig::new(
                format!("{}{}", settings.prefixes.xmipp_tests, group),
                vec![group.id().to_string(), XMIPP_MODULE.to_string()],
                &settings.workers.primary,
                factory::plugin_factory(settings, &test_only),
            )
            .with_env(xmipp_env)
            .with_channel(&settings.xmipp_channel),
        );
    }

    if group == BuildGroup::Devel {
        builders.push(
            BuilderConfig::new(
                format!("{}{}", settings.prefixes.xmipp_bundle, group),
                vec![group.id().to_string()],
                &settings.workers.secondary,
                factory::bundle_test_factory(settings),
            )
            .with_env(env)
            .with_channel(&settings.xmipp_channel),
        );
    }

    Ok(builders)
}

/// Every builder for a group, distribution and xmipp alike.
pub fn builders_for_group(
    settings: &Settings,
    registry: &PluginRegistry,
    group: BuildGroup,
) -> Result<Vec<BuilderConfig>> {
    let mut builders = scipion_builders(settings, registry, group)?;
    builders.extend(xmipp_builders(settings, registry, group)?);
    Ok(builders)
}

/// Deterministic digest of a builder plan: ordered builder names and
/// their ordered step names. Two identical configurations always hash
/// the same, so plan drift is detectable across masters.
pub fn plan_digest(builders: &[BuilderConfig]) -> String {
    let mut hasher = Sha256::new();
    for builder in builders {
        hasher.update(builder.name.as_bytes());
        hasher.update(b"\0");
        for step in builder.factory.step_names() {
            hasher.update(step.as_bytes());
            hasher.update(b"\n");
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginSpec;

    fn registry() -> PluginRegistry {
        PluginRegistry::new(vec![
            PluginSpec::new("scipion-em-relion"),
            PluginSpec::new("scipion-em-eman2"),
        ])
        .expect("registry")
    }

    #[test]
    fn test_group_builder_set() {
        let settings = Settings::default();
        let builders = scipion_builders(&settings, &registry(), BuildGroup::Devel).expect("ok");

        let names: Vec<&str> = builders.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Install_Scipion_devel",
                "Test_Scipion_devel",
                "CleanUp_devel",
                "relion_devel",
                "eman2_devel",
            ]
        );
    }

    #[test]
    fn test_plugin_builders_follow_registry_order() {
        let settings = Settings::default();
        let registry = PluginRegistry::new(vec![
            PluginSpec::new("scipion-em-eman2"),
            PluginSpec::new("scipion-em-locscale"),
            PluginSpec::new("scipion-em-relion"),
        ])
        .expect("registry");

        let builders = scipion_builders(&settings, &registry, BuildGroup::Prod).expect("ok");
        let plugin_names: Vec<&str> = builders[3..].iter().map(|b| b.name.as_str()).collect();
        assert_eq!(plugin_names, vec!["eman2_prod", "locscale_prod", "relion_prod"]);
    }

    #[test]
    fn test_plugin_env_merged_over_base() {
        let settings = Settings::default();
        let mut plugin = PluginSpec::new("scipion-em-locscale");
        plugin.env = settings.env_pin("eman212");
        let registry = PluginRegistry::new(vec![plugin]).expect("registry");

        let builders = scipion_builders(&settings, &registry, BuildGroup::Devel).expect("ok");
        let locscale = builders.last().expect("builders");
        assert!(locscale.env.contains_key("SCIPION_IGNORE_PYTHONPATH"));
        assert!(locscale.env.contains_key("EMAN2DIR"));
    }

    #[test]
    fn test_bundle_builder_only_for_devel() {
        let settings = Settings::default();
        let registry = PluginRegistry::default();

        let devel = xmipp_builders(&settings, &registry, BuildGroup::Devel).expect("ok");
        assert!(devel.iter().any(|b| b.name == "xmipp_bundle_devel"));
        // Bundle builds run on the secondary worker.
        let bundle = devel.iter().find(|b| b.name == "xmipp_bundle_devel").expect("bundle");
        assert_eq!(bundle.workers, vec![settings.workers.secondary.clone()]);

        let prod = xmipp_builders(&settings, &registry, BuildGroup::Prod).expect("ok");
        assert!(prod.is_empty());
    }

    #[test]
    fn test_xmipp_install_and_tests_are_split() {
        let settings = Settings::default();
        let mut plugin = PluginSpec::new("scipion-em-xmipp");
        plugin.module = Some("xmipp3".to_string());
        plugin.extra_binaries = vec!["deepLearningToolkit".to_string()];
        let registry = PluginRegistry::new(vec![plugin]).expect("registry");

        let builders = xmipp_builders(&settings, &registry, BuildGroup::Prod).expect("ok");
        let names: Vec<&str> = builders.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["Install_Xmipp_prod", "xmipp_prod"]);

        // The install builder compiles xmipp and its binaries but never
        // discovers tests.
        let install_steps = builders[0].factory.step_names();
        assert!(install_steps.iter().any(|s| *s == "Install plugin xmipp3"));
        assert!(install_steps.iter().any(|s| s.contains("deepLearningToolkit")));
        assert!(!install_steps.iter().any(|s| s.contains("test stages")));

        // The test builder runs against whatever install last succeeded.
        let test_steps = builders[1].factory.step_names();
        assert!(test_steps
            .iter()
            .any(|s| s.contains("test stages for xmipp3")));
        assert!(!test_steps.iter().any(|s| s.starts_with("Install")));
    }

    #[test]
    fn test_xmipp_module_skipped_by_generic_plugin_builders() {
        let settings = Settings::default();
        let mut xmipp = PluginSpec::new("scipion-em-xmipp");
        xmipp.module = Some("xmipp3".to_string());
        let registry =
            PluginRegistry::new(vec![PluginSpec::new("scipion-em-relion"), xmipp])
                .expect("registry");

        let builders = scipion_builders(&settings, &registry, BuildGroup::Devel).expect("ok");
        let names: Vec<&str> = builders.iter().map(|b| b.name.as_str()).collect();
        assert!(names.contains(&"relion_devel"));
        assert!(!names.iter().any(|n| n.starts_with("xmipp3_")));
    }

    #[test]
    fn test_plan_digest_deterministic_and_order_sensitive() {
        let settings = Settings::default();
        let builders = builders_for_group(&settings, &registry(), BuildGroup::Devel).expect("ok");

        let a = plan_digest(&builders);
        let b = plan_digest(&builders);
        assert_eq!(a, b);

        let mut reversed = builders.clone();
        reversed.reverse();
        assert_ne!(a, plan_digest(&reversed));
    }
}
