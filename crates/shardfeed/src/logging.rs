use tracing::warn;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Environment variable that switches logs to one JSON object per line.
pub const LOG_JSON_ENV: &str = "SHARDFEED_LOG_JSON";

/// Initializes logging.
///
/// The level defaults to `INFO` and can be overridden with `RUST_LOG`.  With
/// `SHARDFEED_LOG_JSON` set, every event is written as a JSON object that
/// carries the fields of its enclosing span (e.g. `shard` and `table` for a
/// table worker).
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_JSON_ENV)
        .map(|value| is_enabled(&value))
        .unwrap_or(false);

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .try_init()
    };

    if result.is_err() {
        warn!("Unable to initialize logging -- has it already been initialized?")
    }
}

fn is_enabled(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod test {
    use super::is_enabled;

    #[test]
    fn json_switch_values() {
        for value in ["1", "true", "TRUE", " yes ", "On"] {
            assert!(is_enabled(value), "{value}");
        }
        for value in ["", "0", "false", "off", "json"] {
            assert!(!is_enabled(value), "{value}");
        }
    }
}
