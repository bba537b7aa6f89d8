//! Plugin registry: which plugins get a builder, and how each one is
//! installed and tested.
//!
//! The registry file is a JSON array, ordered by installation dependency
//! (a plugin may rely on another plugin being installed first), so order
//! is preserved end to end. Every record is validated at load time; a
//! malformed registry is rejected before any builder is assembled.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Result, ScibotError};

fn default_true() -> bool {
    true
}

/// One plugin record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginSpec {
    /// Package name, e.g. `scipion-em-relion`.
    pub name: String,

    /// Python module / test namespace. Derived from the package name
    /// (last dash-separated segment) when omitted.
    #[serde(default)]
    pub module: Option<String>,

    /// Whether the builder installs the plugin before testing.
    #[serde(default = "default_true")]
    pub do_install: bool,

    /// Whether the builder discovers and runs the plugin's tests.
    #[serde(default = "default_true")]
    pub do_test: bool,

    /// Extra binary packages installed alongside the plugin
    /// (e.g. `deepLearningToolkit`).
    #[serde(default)]
    pub extra_binaries: Vec<String>,

    /// Environment overrides applied to every step of this plugin's
    /// builder.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Notification channel for this plugin's failures.
    #[serde(default)]
    pub slack_channel: Option<String>,
}

impl PluginSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: None,
            do_install: true,
            do_test: true,
            extra_binaries: Vec::new(),
            env: BTreeMap::new(),
            slack_channel: None,
        }
    }

    /// Module name, falling back to the package-name convention
    /// (`scipion-em-relion` -> `relion`).
    pub fn module_name(&self) -> &str {
        match &self.module {
            Some(m) => m,
            None => self.name.rsplit('-').next().unwrap_or(&self.name),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ScibotError::InvalidPlugin {
                name: self.name.clone(),
                reason: "empty package name".to_string(),
            });
        }
        if self.module_name().is_empty() {
            return Err(ScibotError::InvalidPlugin {
                name: self.name.clone(),
                reason: "empty module name".to_string(),
            });
        }
        if !self.do_install && !self.extra_binaries.is_empty() {
            return Err(ScibotError::InvalidPlugin {
                name: self.name.clone(),
                reason: "extra binaries require installation".to_string(),
            });
        }
        Ok(())
    }
}

/// Ordered, validated collection of plugin records.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct PluginRegistry {
    plugins: Vec<PluginSpec>,
}

impl PluginRegistry {
    pub fn new(plugins: Vec<PluginSpec>) -> Result<Self> {
        let registry = Self { plugins };
        registry.validate()?;
        Ok(registry)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let plugins: Vec<PluginSpec> = serde_json::from_str(text)?;
        Self::new(plugins)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for plugin in &self.plugins {
            plugin.validate()?;
            if !seen.insert(plugin.module_name().to_string()) {
                return Err(ScibotError::InvalidPlugin {
                    name: plugin.name.clone(),
                    reason: format!("duplicate module name {:?}", plugin.module_name()),
                });
            }
        }
        Ok(())
    }

    /// Plugins in declaration (dependency) order.
    pub fn iter(&self) -> impl Iterator<Item = &PluginSpec> {
        self.plugins.iter()
    }

    pub fn get(&self, module: &str) -> Option<&PluginSpec> {
        self.plugins.iter().find(|p| p.module_name() == module)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
