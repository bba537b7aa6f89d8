//! scibot - Scipion CI master command line
//!
//! ## Commands
//!
//! - `validate`: load and validate the settings and plugin registry
//! - `plan`: print the builder/scheduler plan for a build group
//! - `discover`: run (or replay) a test probe and print the stage list
//! - `run`: execute one builder's factory locally

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, Level};

use scibot_core::{
    builders_for_group, init_tracing, plan_digest, schedulers_for, BuildGroup, BuilderConfig,
    ExtractorConfig, FactoryStep, Grammar, Pipeline, PluginRegistry, Settings, ShellStep,
    StepRunner,
};

#[derive(Parser)]
#[command(name = "scibot")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CI orchestration for the Scipion distribution", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Settings file (JSON); defaults apply when omitted
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Plugin registry file (JSON array)
    #[arg(long, global = true)]
    plugins: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration, then print a summary
    Validate,

    /// Print the builder and scheduler plan for a build group
    Plan {
        /// Build group (support, devel, prod)
        #[arg(short, long, default_value = "devel")]
        group: String,

        /// Print the plan as JSON instead of text
        #[arg(long)]
        json_plan: bool,
    },

    /// Discover test stages from a probe command or captured output
    Discover {
        /// Target test set (namespace prefix), e.g. pyworkflow
        #[arg(short, long)]
        target: String,

        /// Expected root program name (defaults to the distribution
        /// command)
        #[arg(long)]
        root: Option<String>,

        /// Line grammar: strict or relaxed
        #[arg(long, default_value = "strict")]
        grammar: String,

        /// Regex accepted verbatim instead of structural classification
        #[arg(long)]
        pattern: Option<String>,

        /// Blacklisted identifiers (repeatable)
        #[arg(long = "exclude")]
        blacklist: Vec<String>,

        /// Probe command run through `bash -c`
        #[arg(long, conflicts_with = "input")]
        probe: Option<String>,

        /// Read probe output from this file instead of running a probe
        /// (use `-` for stdin)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Treat an empty stage list as success
        #[arg(long)]
        allow_empty: bool,
    },

    /// Execute one builder's factory locally
    Run {
        /// Builder name, e.g. Test_Scipion_devel
        builder: String,

        /// Build group the builder belongs to
        #[arg(short, long, default_value = "devel")]
        group: String,

        /// Directory to run the factory in (defaults to the factory's
        /// configured workdir, relative to the current directory)
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let settings = load_settings(cli.settings.as_deref())?;
    let registry = load_registry(cli.plugins.as_deref())?;

    match cli.command {
        Commands::Validate => cmd_validate(&settings, &registry),
        Commands::Plan { group, json_plan } => cmd_plan(&settings, &registry, &group, json_plan),
        Commands::Discover {
            target,
            root,
            grammar,
            pattern,
            blacklist,
            probe,
            input,
            allow_empty,
        } => {
            cmd_discover(
                &settings,
                &target,
                root.as_deref(),
                &grammar,
                pattern.as_deref(),
                blacklist,
                probe.as_deref(),
                input.as_deref(),
                allow_empty,
            )
            .await
        }
        Commands::Run {
            builder,
            group,
            workdir,
        } => cmd_run(&settings, &registry, &builder, &group, workdir.as_deref()).await,
    }
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(p) => Settings::load(p).with_context(|| format!("Failed to load settings from {}", p.display())),
        None => Ok(Settings::default()),
    }
}

fn load_registry(path: Option<&Path>) -> Result<PluginRegistry> {
    match path {
        Some(p) => PluginRegistry::load(p)
            .with_context(|| format!("Failed to load plugin registry from {}", p.display())),
        None => Ok(PluginRegistry::default()),
    }
}

fn cmd_validate(settings: &Settings, registry: &PluginRegistry) -> Result<()> {
    // Loading already validated both files; compiling every discovery
    // extractor catches bad patterns too.
    let mut builders = 0usize;
    let mut discoveries = 0usize;
    for group in BuildGroup::ALL {
        for builder in builders_for_group(settings, registry, group)? {
            builders += 1;
            for step in builder.factory.steps() {
                if let FactoryStep::Discovery(d) = step {
                    d.extractor
                        .compile()
                        .with_context(|| format!("Builder {:?}", builder.name))?;
                    discoveries += 1;
                }
            }
        }
    }

    println!(
        "OK: {} plugins, {} builders, {} discovery steps across {} groups",
        registry.len(),
        builders,
        discoveries,
        BuildGroup::ALL.len()
    );
    Ok(())
}

fn cmd_plan(
    settings: &Settings,
    registry: &PluginRegistry,
    group: &str,
    json_plan: bool,
) -> Result<()> {
    let group = BuildGroup::parse(group)?;
    let builders = builders_for_group(settings, registry, group)?;
    let schedulers = schedulers_for(settings, &builders);

    if json_plan {
        let plan = serde_json::json!({
            "group": group.id(),
            "digest": plan_digest(&builders),
            "builders": builders,
            "schedulers": schedulers,
        });
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("Plan for group {group} (digest {})", &plan_digest(&builders)[..12]);
    for builder in &builders {
        println!("\nbuilder {} [{}]", builder.name, builder.workers.join(", "));
        for step in builder.factory.steps() {
            match step {
                FactoryStep::Shell(s) => println!("  step      {}", s.name),
                FactoryStep::Discovery(d) => println!("  discovery {}", d.name),
            }
        }
    }
    println!("\n{} schedulers", schedulers.len());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_discover(
    settings: &Settings,
    target: &str,
    root: Option<&str>,
    grammar: &str,
    pattern: Option<&str>,
    blacklist: Vec<String>,
    probe: Option<&str>,
    input: Option<&Path>,
    allow_empty: bool,
) -> Result<()> {
    let grammar = match grammar {
        "strict" => Grammar::Strict,
        "relaxed" => Grammar::Relaxed,
        other => bail!("Unknown grammar {other:?} (expected strict or relaxed)"),
    };

    let mut config = ExtractorConfig::new(target)
        .with_grammar(grammar)
        .with_blacklist(blacklist);
    if let Some(root) = root {
        config = config.with_root_name(root);
    }
    if let Some(pattern) = pattern {
        config = config.with_pattern(pattern);
    }
    let extractor = config.compile()?;

    let output = match (input, probe) {
        (Some(path), _) => read_input(path).await?,
        (None, Some(script)) => {
            let step = ShellStep::bash("probe", script, settings.timeouts.execute);
            let result = StepRunner::execute(&step, None, &BTreeMap::new()).await?;
            if !result.passed() {
                bail!(
                    "Probe command failed with exit code {}: {}",
                    result.exit_code,
                    result.stderr.trim()
                );
            }
            result.stdout
        }
        (None, None) => bail!("Either --probe or --input is required"),
    };

    let stages = extractor.extract(&output);
    info!(stages = stages.len(), "Discovered test stages");

    if stages.is_empty() && !allow_empty {
        bail!("No test stages discovered (pass --allow-empty to tolerate)");
    }
    for stage in stages {
        println!("{stage}");
    }
    Ok(())
}

async fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        use tokio::io::AsyncReadExt;
        let mut buffer = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buffer)
            .await
            .context("Failed to read stdin")?;
        Ok(buffer)
    } else {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }
}

async fn cmd_run(
    settings: &Settings,
    registry: &PluginRegistry,
    builder_name: &str,
    group: &str,
    workdir: Option<&Path>,
) -> Result<()> {
    let group = BuildGroup::parse(group)?;
    let builders = builders_for_group(settings, registry, group)?;
    let builder: &BuilderConfig = builders
        .iter()
        .find(|b| b.name == builder_name)
        .ok_or_else(|| {
            let known: Vec<&str> = builders.iter().map(|b| b.name.as_str()).collect();
            anyhow::anyhow!(
                "Unknown builder {builder_name:?} in group {group} (known: {})",
                known.join(", ")
            )
        })?;

    let result = Pipeline::run(builder, workdir).await?;

    println!(
        "run {} builder {}: {} ({} passed, {} failed, {} ms)",
        result.run_id,
        result.builder,
        if result.success { "PASSED" } else { "FAILED" },
        result.passed_count(),
        result.failed_count(),
        result.duration_ms,
    );
    for step in &result.steps {
        let status = if step.passed() { "ok  " } else { "FAIL" };
        println!("  [{status}] {} ({} ms)", step.step_name, step.duration_ms);
    }

    if !result.success {
        bail!("Builder {} failed", result.builder);
    }
    Ok(())
}
