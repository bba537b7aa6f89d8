//! Master configuration for the orchestration.
//!
//! One [`Settings`] value is constructed at startup (from a JSON file or
//! [`Settings::default`]) and passed by reference to every factory and
//! builder function. Nothing in this crate reads ambient global state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use crate::error::{Result, ScibotError};

/// Builder directory name for the distribution itself.
pub const SCIPION_BUILD_ID: &str = "scipion";
/// Builder directory name for the Xmipp bundle.
pub const XMIPP_BUILD_ID: &str = "xmipp";

/// Build group a builder belongs to. Each group tracks its own branches
/// and gets its own orchestrator, install, test and cleanup builders.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuildGroup {
    /// Legacy 2.x support line.
    Support,
    /// Development line.
    Devel,
    /// Production line.
    Prod,
}

impl BuildGroup {
    pub const ALL: [BuildGroup; 3] = [BuildGroup::Support, BuildGroup::Devel, BuildGroup::Prod];

    pub fn id(self) -> &'static str {
        match self {
            BuildGroup::Support => "support",
            BuildGroup::Devel => "devel",
            BuildGroup::Prod => "prod",
        }
    }

    pub fn parse(id: &str) -> Result<Self> {
        match id {
            "support" => Ok(BuildGroup::Support),
            "devel" => Ok(BuildGroup::Devel),
            "prod" => Ok(BuildGroup::Prod),
            other => Err(ScibotError::UnknownGroup(other.to_string())),
        }
    }
}

impl fmt::Display for BuildGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Worker pool. The distribution builds run on the primary worker; the
/// bundle builds run on the secondary box.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workers {
    pub primary: String,
    pub secondary: String,
}

impl Default for Workers {
    fn default() -> Self {
        Self {
            primary: "einstein".to_string(),
            secondary: "scipionbox".to_string(),
        }
    }
}

/// Step timeouts in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timeouts {
    /// Quick housekeeping steps.
    pub short: u64,
    /// Installation and compilation steps.
    pub install: u64,
    /// Ordinary test stages.
    pub execute: u64,
    /// The handful of known multi-hour workflow tests.
    pub long_execute: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            short: 5 * 60,
            install: 60 * 60,
            execute: 5 * 60 * 60,
            long_execute: 20 * 60 * 60,
        }
    }
}

/// Builder-name prefixes. Builder names are `<prefix><group id>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Prefixes {
    pub install: String,
    pub tests: String,
    pub cleanup: String,
    pub force: String,
    pub xmipp_install: String,
    pub xmipp_tests: String,
    pub xmipp_bundle: String,
}

impl Default for Prefixes {
    fn default() -> Self {
        Self {
            install: "Install_Scipion_".to_string(),
            tests: "Test_Scipion_".to_string(),
            cleanup: "CleanUp_".to_string(),
            force: "Force_".to_string(),
            xmipp_install: "Install_Xmipp_".to_string(),
            xmipp_tests: "xmipp_".to_string(),
            xmipp_bundle: "xmipp_bundle_".to_string(),
        }
    }
}

/// Immutable orchestration configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub workers: Workers,
    pub timeouts: Timeouts,
    pub prefixes: Prefixes,

    /// Per group, the branch to check out for each build id
    /// (e.g. `devel -> { scipion -> "devel" }`). Plugin branches live in
    /// the plugin registry file instead.
    pub branches: BTreeMap<BuildGroup, BTreeMap<String, String>>,

    /// Distribution launcher, relative to the build workdir.
    pub scipion_cmd: String,

    /// Xmipp bundle launcher, relative to the bundle workdir.
    pub xmipp_cmd: String,

    pub git_repo_url: String,

    /// Per-user distribution config file patched by the install steps.
    pub local_config_path: String,

    /// Path of the plugin registry file handed to the workers.
    pub plugins_file: String,

    /// Conf variables enforced after `config --overwrite` regenerates the
    /// file (MPI paths and friends).
    pub conf_vars: BTreeMap<String, String>,

    /// Conf variables appended at the end of the file rather than
    /// substituted (third-party package homes).
    pub conf_appends: BTreeMap<String, String>,

    /// Multi-hour tests kept out of the regular test builders.
    pub long_tests: Vec<String>,

    /// Tests excluded from discovery on top of `long_tests`.
    pub test_blacklist: Vec<String>,

    /// Named environment pins referenced by stage env overrides,
    /// e.g. `eman212 -> { EMAN2DIR -> ... }`.
    pub env_pins: BTreeMap<String, BTreeMap<String, String>>,

    /// Notification channel per subsystem (carried as data only).
    pub scipion_channel: String,
    pub xmipp_channel: String,
}

impl Default for Settings {
    fn default() -> Self {
        let mut branches = BTreeMap::new();
        branches.insert(
            BuildGroup::Support,
            BTreeMap::from([(SCIPION_BUILD_ID.to_string(), "master".to_string())]),
        );
        branches.insert(
            BuildGroup::Devel,
            BTreeMap::from([(SCIPION_BUILD_ID.to_string(), "devel".to_string())]),
        );
        branches.insert(
            BuildGroup::Prod,
            BTreeMap::from([(SCIPION_BUILD_ID.to_string(), "master".to_string())]),
        );

        let long_tests = vec![
            "pyworkflow.tests.em.workflows.test_workflow_mixed_large.TestMixedRelionTutorial"
                .to_string(),
            "pyworkflow.tests.em.workflows.test_workflow_mixed_large.TestMixedFrealignClassify"
                .to_string(),
            "pyworkflow.tests.em.workflows.test_workflow_modeling.TestMolprobityValidation"
                .to_string(),
            "pyworkflow.tests.em.workflows.test_workflow_initialvolume.TestRibosome".to_string(),
            "pyworkflow.tests.em.workflows.test_workflow_initialvolume.TestBPV".to_string(),
            "pyworkflow.tests.em.workflows.test_workflow_xmipp_rct.TestXmippRCTWorkflow"
                .to_string(),
        ];

        let test_blacklist = vec![
            "pyworkflow.tests.em.workflows.test_parallel_gpu_queue.TestNoQueueSmall".to_string(),
            "pyworkflow.tests.em.workflows.test_parallel_gpu_queue.TestNoQueueALL".to_string(),
            "pyworkflow.tests.em.workflows.test_parallel_gpu_queue.TestQueueSmall".to_string(),
            "pyworkflow.tests.em.workflows.test_parallel_gpu_queue.TestQueueALL".to_string(),
            "pyworkflow.tests.em.workflows.test_parallel_gpu_queue.TestQueueSteps".to_string(),
            "pyworkflow.tests.em.workflows.test_workflow_existing.TestXmippWorkflow".to_string(),
        ];

        let mut conf_vars = BTreeMap::new();
        conf_vars.insert(
            "MPI_LIBDIR".to_string(),
            "/usr/lib/x86_64-linux-gnu/openmpi/lib".to_string(),
        );
        conf_vars.insert(
            "MPI_INCLUDE".to_string(),
            "/usr/lib/x86_64-linux-gnu/openmpi/include".to_string(),
        );
        conf_vars.insert("MPI_BINDIR".to_string(), "/usr/bin".to_string());

        let mut conf_appends = BTreeMap::new();
        conf_appends.insert(
            "MOTIONCORR_CUDA_LIB".to_string(),
            "/usr/local/cuda-10.2/lib64".to_string(),
        );
        conf_appends.insert("CCP4_HOME".to_string(), "/opt/xtal/ccp4-7.1".to_string());
        conf_appends.insert(
            "PHENIX_HOME".to_string(),
            "/usr/local/phenix-1.19.1-4122".to_string(),
        );

        let mut env_pins = BTreeMap::new();
        env_pins.insert(
            "eman212".to_string(),
            BTreeMap::from([(
                "EMAN2DIR".to_string(),
                "software/em/eman-2.12".to_string(),
            )]),
        );

        Self {
            workers: Workers::default(),
            timeouts: Timeouts::default(),
            prefixes: Prefixes::default(),
            branches,
            scipion_cmd: "./scipion".to_string(),
            xmipp_cmd: "./xmipp".to_string(),
            git_repo_url: "https://github.com/I2PC/scipion.git".to_string(),
            local_config_path: "$HOME/.config/scipion/scipion.conf".to_string(),
            plugins_file: "plugins.json".to_string(),
            conf_vars,
            conf_appends,
            long_tests,
            test_blacklist,
            env_pins,
            scipion_channel: "buildbot".to_string(),
            xmipp_channel: "xmipp".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. Absent fields fall back to the
    /// defaults, so a minimal site file only overrides what differs.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Branch checked out for `build_id` in `group`, when configured.
    pub fn branch(&self, group: BuildGroup, build_id: &str) -> Option<&str> {
        self.branches
            .get(&group)
            .and_then(|m| m.get(build_id))
            .map(String::as_str)
    }

    /// Full discovery blacklist: the long tests plus the explicit
    /// exclusions.
    pub fn blacklist(&self) -> BTreeSet<String> {
        self.long_tests
            .iter()
            .chain(self.test_blacklist.iter())
            .cloned()
            .collect()
    }

    /// Named env pin, empty when unknown.
    pub fn env_pin(&self, name: &str) -> BTreeMap<String, String> {
        self.env_pins.get(name).cloned().unwrap_or_default()
    }
}
