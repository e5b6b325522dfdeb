//! Tracing configuration and initialization.

use std::io::IsTerminal;

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

const LOG_ENV_VAR: &str = "DOCFS_LOG";

fn force_color() -> bool {
    std::env::var_os("FORCE_COLOR").is_some_and(|v| !v.is_empty())
}

fn no_color() -> bool {
    std::env::var_os("NO_COLOR").is_some_and(|v| !v.is_empty())
}

/// Whether output written to `stream` should carry ANSI colors.
pub fn should_use_color<T: IsTerminal>(stream: &T) -> bool {
    force_color() || (stream.is_terminal() && !no_color())
}

enum TrcMode {
    /// Spinners and compact output for an interactive terminal.
    Pretty,
    /// Plain `fmt` output with span enter/close events.
    Plain,
    /// Plain output into the daemon's log file.
    Daemon,
}

pub struct Trc {
    mode: TrcMode,
    env_filter: EnvFilter,
}

impl Default for Trc {
    fn default() -> Self {
        match user_env_filter() {
            // Someone who sets a filter wants to read the logs, not watch spinners.
            Some(env_filter) => Self {
                mode: TrcMode::Plain,
                env_filter,
            },
            None => Self {
                mode: TrcMode::Pretty,
                env_filter: EnvFilter::new("info"),
            },
        }
    }
}

fn user_env_filter() -> Option<EnvFilter> {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .ok()
}

impl Trc {
    /// Logging for a backgrounded daemon whose stderr is its log file.
    pub fn daemon() -> Self {
        Self {
            mode: TrcMode::Daemon,
            env_filter: user_env_filter().unwrap_or_else(|| EnvFilter::new("info")),
        }
    }

    pub fn init(self) -> Result<(), TryInitError> {
        match self.mode {
            TrcMode::Pretty => self.init_pretty_mode(),
            TrcMode::Plain => self.init_plain_mode(should_use_color(&std::io::stderr())),
            TrcMode::Daemon => self.init_plain_mode(force_color()),
        }
    }

    fn init_plain_mode(self, ansi: bool) -> Result<(), TryInitError> {
        tracing_subscriber::fmt()
            .with_env_filter(self.env_filter)
            .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
            .with_ansi(ansi)
            .with_writer(std::io::stderr)
            .finish()
            .try_init()
    }

    fn init_pretty_mode(self) -> Result<(), TryInitError> {
        let indicatif_layer = IndicatifLayer::new();
        tracing_subscriber::registry()
            .with(self.env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(indicatif_layer.get_stderr_writer())
                    .with_target(false)
                    .without_time()
                    .compact(),
            )
            .with(indicatif_layer)
            .try_init()
    }
}
