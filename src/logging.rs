//! Logger bootstrap and re-exports. Components take a parent logger as
//! `Into<Option<&Logger>>` and fall back to `Discard`, so library code can run
//! silently in tests and fully instrumented in applications.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the default terminal logger used by applications and example code.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("default logging config must parse");

    config.build_logger().expect("terminal logger must build")
}
