//! Tracing initialisation for scibot binaries.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored
//! (the global subscriber can only be installed once per process).

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence when set. Otherwise the scibot crates log
/// at `level` while dependencies stay at `warn`, so a `--verbose` run
/// shows step execution without drowning it in runtime internals. With
/// `json` the subscriber emits newline-delimited JSON records for log
/// shipping.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        registry
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

/// `warn` globally, the requested level for the scibot crates.
fn default_directives(level: Level) -> String {
    let level = level.as_str().to_lowercase();
    format!("warn,scibot_core={level},scibot={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_quiet_dependencies() {
        assert_eq!(
            default_directives(Level::DEBUG),
            "warn,scibot_core=debug,scibot=debug"
        );
        assert_eq!(
            default_directives(Level::INFO),
            "warn,scibot_core=info,scibot=info"
        );
    }
}
