//! Logging setup built on `tracing`.
//!
//! One builder, initialised once per process. Lines are level-filtered,
//! timestamped in UTC RFC-3339 and serialised by the subscriber; the five
//! operator-facing levels map onto tracing filters through
//! [`LogLevel`](crate::config::LogLevel).

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Global flag to track if logging has been initialized.
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Span event configuration for logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpanEvents {
    /// Log when a span is created.
    pub new: bool,
    /// Log when a span is closed.
    pub close: bool,
}

impl SpanEvents {
    /// No span events will be logged.
    pub const NONE: Self = Self {
        new: false,
        close: false,
    };

    /// Log span creation and close events, useful for following handler
    /// calls without enter/exit noise.
    pub const LIFECYCLE: Self = Self {
        new: true,
        close: true,
    };

    fn to_fmt_span(self) -> FmtSpan {
        let mut span = FmtSpan::NONE;
        if self.new {
            span |= FmtSpan::NEW;
        }
        if self.close {
            span |= FmtSpan::CLOSE;
        }
        span
    }
}

/// Builder for the process-wide tracing subscriber.
pub struct LoggingBuilder {
    filter: String,
    span_events: SpanEvents,
}

impl LoggingBuilder {
    /// Creates a builder with the default `info` filter.
    pub fn new() -> Self {
        Self {
            filter: "info".to_string(),
            span_events: SpanEvents::NONE,
        }
    }

    /// Sets the filter directive (e.g. `info`, `agora=debug`, `off`).
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Sets which span lifecycle events are logged.
    pub fn with_span_events(mut self, span_events: SpanEvents) -> Self {
        self.span_events = span_events;
        self
    }

    /// Installs the subscriber. Only the first call per process takes
    /// effect; later calls are no-ops.
    pub fn init(self) {
        if LOGGING_INITIALIZED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.filter))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_timer(UtcTime::rfc_3339())
                    .with_span_events(self.span_events.to_fmt_span()),
            )
            .try_init();
    }

    /// Whether logging has already been initialised.
    pub fn is_initialized() -> bool {
        LOGGING_INITIALIZED.load(Ordering::SeqCst)
    }
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}
