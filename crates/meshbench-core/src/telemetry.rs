//! Log output for the `meshbench` binary.
//!
//! A batch runs for hours, so the default is one compact text line per event.
//! `--json` switches to newline-delimited JSON with event fields flattened to
//! the top level, which is what log stores index. `RUST_LOG` overrides the
//! level picked on the command line. The HTTP stack used by the load client
//! is held at `warn` unless `RUST_LOG` says otherwise.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn default_directives(level: Level) -> String {
    format!(
        "{},hyper=warn,reqwest=warn",
        level.as_str().to_ascii_lowercase()
    )
}

/// Install the global subscriber. Only the first call in a process has an effect.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let text = (!json).then(|| fmt::layer().with_target(false).compact());
    let structured = json.then(|| {
        fmt::layer()
            .with_target(false)
            .json()
            .flatten_event(true)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(structured)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_quiet_http_stack() {
        assert_eq!(
            default_directives(Level::DEBUG),
            "debug,hyper=warn,reqwest=warn"
        );
    }

    #[test]
    fn test_second_init_is_ignored() {
        init_tracing(false, Level::DEBUG);
        init_tracing(true, Level::INFO);
    }
}
