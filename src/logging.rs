use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log targets owned by this package: the library (shared with the CLI
/// binary's crate name) and the HTTP server binary.
const TARGETS: [&str; 2] = ["meter_readings", "meter_server"];

/// Filter directive used when `RUST_LOG` is unset
fn default_directive(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise both binaries and the library log at
/// info, or debug with `verbose`. Calling this twice is a no-op.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_covers_server_target() {
        assert_eq!(
            default_directive(false),
            "meter_readings=info,meter_server=info"
        );
        assert_eq!(
            default_directive(true),
            "meter_readings=debug,meter_server=debug"
        );
    }

    #[test]
    fn test_default_directive_parses() {
        for verbose in [false, true] {
            assert!(EnvFilter::try_new(default_directive(verbose)).is_ok());
        }
    }
}
