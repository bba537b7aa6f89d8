//! Test-stage discovery: turn the raw output of a `test --show` probe into
//! an ordered list of schedulable test identifiers.
//!
//! The probe prints one conceptual record per line. A structurally valid
//! line looks like
//!
//! ```text
//! scipion test pyworkflow.tests.TestFoo
//! ```
//!
//! where the first token is the invoking program, the second is the `test`
//! marker and the last is a fully-qualified test identifier whose leading
//! dotted segment names the module under test. Tests that fail to import
//! are reported as `Error loading the test <identifier>` lines; those are
//! accepted too so the failure surfaces downstream as a failing stage
//! instead of silently vanishing.
//!
//! Extraction is a pure function of the probe output and the
//! [`ExtractorConfig`]; it never fails and keeps no state across calls.
//! Duplicates are preserved in input order.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Result, ScibotError};

/// Default first token of a structurally valid probe line.
pub const DEFAULT_ROOT_NAME: &str = "scipion";

/// Marker emitted by the probe for tests that failed to import.
const IMPORT_ERROR_MARKER: &str = "Error loading the test";

/// Looser marker that relaxes the token-count requirement of the
/// three-token rule (error reports wrap the identifier in extra words).
const ERROR_MARKER: &str = "Error";

/// Line grammar accepted by structural classification.
///
/// The probe output format changed across distribution releases; both
/// shapes remain in the field, so the grammar is an explicit choice
/// rather than a guess.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Grammar {
    /// Three-token lines only, second token must be exactly `test`.
    #[default]
    Strict,

    /// Two- or three-token lines; `tests` is also a valid second token.
    Relaxed,
}

impl Grammar {
    fn accepts_two_tokens(self) -> bool {
        matches!(self, Grammar::Relaxed)
    }

    fn is_marker(self, token: &str) -> bool {
        match self {
            Grammar::Strict => token == "test",
            Grammar::Relaxed => token == "test" || token == "tests",
        }
    }
}

/// Configuration for one stage-discovery run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractorConfig {
    /// Namespace a discovered identifier must belong to (its leading
    /// dotted segment), e.g. `pyworkflow` or a plugin module name.
    pub target_test_set: String,

    /// Expected first token of a structural line. `None` means the
    /// distribution default.
    #[serde(default)]
    pub root_name: Option<String>,

    /// Fully-qualified identifiers that must never be scheduled.
    #[serde(default)]
    pub blacklist: BTreeSet<String>,

    /// Escape hatch: when set, any line matching this pattern (anchored at
    /// the start of the line) is accepted verbatim and the structural
    /// rules, blacklist and target filter are bypassed.
    #[serde(default)]
    pub pattern: Option<String>,

    /// Structural grammar variant.
    #[serde(default)]
    pub grammar: Grammar,
}

impl ExtractorConfig {
    pub fn new(target_test_set: impl Into<String>) -> Self {
        Self {
            target_test_set: target_test_set.into(),
            root_name: None,
            blacklist: BTreeSet::new(),
            pattern: None,
            grammar: Grammar::default(),
        }
    }

    pub fn with_root_name(mut self, root: impl Into<String>) -> Self {
        self.root_name = Some(root.into());
        self
    }

    pub fn with_blacklist<I, S>(mut self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist = identifiers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_grammar(mut self, grammar: Grammar) -> Self {
        self.grammar = grammar;
        self
    }

    /// Compile into a [`StageExtractor`], validating the pattern (if any)
    /// up front so a bad regex is a configuration error, not a silent
    /// no-match at discovery time.
    pub fn compile(&self) -> Result<StageExtractor> {
        let pattern = match &self.pattern {
            Some(p) => Some(Regex::new(p).map_err(|source| ScibotError::InvalidPattern {
                pattern: p.clone(),
                source,
            })?),
            None => None,
        };

        Ok(StageExtractor {
            target_test_set: self.target_test_set.clone(),
            root_name: self
                .root_name
                .clone()
                .unwrap_or_else(|| DEFAULT_ROOT_NAME.to_string()),
            blacklist: self.blacklist.clone(),
            pattern,
            grammar: self.grammar,
        })
    }
}

/// Compiled line classifier. Build one via [`ExtractorConfig::compile`].
#[derive(Debug)]
pub struct StageExtractor {
    target_test_set: String,
    root_name: String,
    blacklist: BTreeSet<String>,
    pattern: Option<Regex>,
    grammar: Grammar,
}

impl StageExtractor {
    /// Classify every line of `stdout` and return the accepted test
    /// identifiers in input order, duplicates included.
    ///
    /// An empty result is a valid outcome; whether it is fatal is the
    /// caller's decision (see [`StageDiscovery::allow_empty`]).
    ///
    /// [`StageDiscovery::allow_empty`]: crate::factory::StageDiscovery
    pub fn extract(&self, stdout: &str) -> Vec<String> {
        let mut stages = Vec::new();

        for raw in stdout.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            // Pattern mode replaces structural classification entirely.
            if let Some(re) = &self.pattern {
                if re.find(line).is_some_and(|m| m.start() == 0) {
                    stages.push(line.to_string());
                }
                continue;
            }

            let tokens: Vec<&str> = line.split(' ').collect();
            let last = tokens[tokens.len() - 1];

            // Blacklist membership is checked against the fully-qualified
            // identifier only, never prefixes.
            if self.blacklist.contains(last) {
                continue;
            }

            // Import failures are scheduled anyway: the broken test must
            // show up as a failed stage, not disappear.
            if line.contains(IMPORT_ERROR_MARKER) {
                stages.push(last.to_string());
                continue;
            }

            if !self.in_target(last) {
                continue;
            }

            if self.grammar.accepts_two_tokens() && tokens.len() == 2 {
                stages.push(last.to_string());
                continue;
            }

            if (tokens.len() == 3 || line.contains(ERROR_MARKER))
                && tokens.len() >= 2
                && tokens[0] == self.root_name
                && self.grammar.is_marker(tokens[1])
            {
                stages.push(last.to_string());
            }
        }

        stages
    }

    /// Leading dotted segment of `identifier` equals the target test set.
    fn in_target(&self, identifier: &str) -> bool {
        let prefix = identifier.split('.').next().unwrap_or(identifier);
        prefix == self.target_test_set
    }
}
