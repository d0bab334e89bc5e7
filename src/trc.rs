//! Tracing configuration and initialization.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// Tracing setup for the daemon.
///
/// The filter is taken from `METAD_LOG`, then from the standard `RUST_LOG`
/// variable, and defaults to `info` when neither is set.
pub struct Trc {
    env_filter: EnvFilter,
    span_events: bool,
}

impl Default for Trc {
    fn default() -> Self {
        let maybe_env_filter =
            EnvFilter::try_from_env("METAD_LOG").or_else(|_| EnvFilter::try_from_default_env());

        match maybe_env_filter {
            Ok(env_filter) => Self {
                // A user-provided filter usually means someone is debugging,
                // so include span enter/close events.
                env_filter,
                span_events: true,
            },
            Err(_) => Self {
                env_filter: EnvFilter::new("info"),
                span_events: false,
            },
        }
    }
}

impl Trc {
    pub fn init(self) -> Result<(), TryInitError> {
        let span_events = if self.span_events {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        tracing_subscriber::registry()
            .with(self.env_filter)
            .with(tracing_subscriber::fmt::layer().with_span_events(span_events))
            .try_init()
    }
}
