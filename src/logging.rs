//! Tracing subscriber setup for the command-line tool

use anyhow::Result;
use std::io::{self, IsTerminal};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default filter directive for a verbosity level
pub fn default_directive(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbosity {
        0 => "hurricore=info,warn",
        1 => "hurricore=debug,info",
        2 => "hurricore=trace,debug",
        _ => "trace",
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the verbosity flags.
pub fn init_logging(verbosity: u8, quiet: bool, json_output: bool) -> Result<()> {
    let env_filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !quiet => EnvFilter::try_new(directives)?,
        _ => EnvFilter::try_new(default_directive(verbosity, quiet))?,
    };

    if json_output {
        // JSON output for machine parsing
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).try_init()?;
    } else {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_thread_names(true)
            .with_ansi(io::stderr().is_terminal())
            .with_writer(io::stderr)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(fmt_layer).try_init()?;
    }

    Ok(())
}
