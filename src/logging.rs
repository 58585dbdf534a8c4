//! Process-wide, replaceable log sink
//!
//! The engine logs through `tracing`. [`SinkLayer`] forwards every event to the
//! sink registered with [`set_log_sink`]. The binaries install it through
//! [`init`]. A host that registers a sink without any global subscriber gets a
//! sink-only subscriber installed on first registration, filtered by
//! `RUST_LOG` or [`SINK_ONLY_DIRECTIVE`]. A host with its own subscriber adds
//! [`SinkLayer`] to it.
//!
//! Emitters hold a read lock on the sink for the duration of the callback.
//! Replacing or clearing the sink takes the write lock, so once
//! `set_log_sink` returns no thread is still inside the previous sink.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::fmt::{self, Write as _};
use std::sync::{Arc, Once};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as fmt_layer, EnvFilter};

/// Severity handed to the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<&Level> for LogLevel {
    fn from(level: &Level) -> Self {
        match *level {
            Level::TRACE => LogLevel::Trace,
            Level::DEBUG => LogLevel::Debug,
            Level::INFO => LogLevel::Info,
            Level::WARN => LogLevel::Warn,
            Level::ERROR => LogLevel::Error,
        }
    }
}

/// Callback receiving `(level, message)`
pub type LogSink = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Filter of the subscriber installed by [`set_log_sink`] when none exists
pub const SINK_ONLY_DIRECTIVE: &str = "info,crab_mitm=debug";

static SINK: Lazy<RwLock<Option<LogSink>>> = Lazy::new(|| RwLock::new(None));
static SINK_ONLY_SUBSCRIBER: Once = Once::new();

/// Register a new sink, or clear it with `None`
///
/// The first registration installs a global subscriber carrying only
/// [`SinkLayer`] unless one is already set.
pub fn set_log_sink(sink: Option<LogSink>) {
    if sink.is_some() {
        SINK_ONLY_SUBSCRIBER.call_once(|| {
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(SINK_ONLY_DIRECTIVE));
            let _ = tracing_subscriber::registry().with(filter).with(SinkLayer).try_init();
        });
    }

    let previous = std::mem::replace(&mut *SINK.write(), sink);
    // Dropped outside the lock so a sink that logs on drop cannot deadlock.
    drop(previous);
}

/// Whether a sink is currently registered
pub fn has_log_sink() -> bool {
    SINK.read_recursive().is_some()
}

/// `tracing` layer forwarding events to the registered sink
#[derive(Debug, Default, Clone, Copy)]
pub struct SinkLayer;

impl<S: Subscriber> Layer<S> for SinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let guard = SINK.read_recursive();
        let Some(sink) = guard.as_ref() else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        sink(LogLevel::from(event.metadata().level()), &visitor.finish());
    }
}

/// Flattens an event into `message key=value ...`
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            self.message + &self.fields
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Install the global subscriber used by the binaries
///
/// `RUST_LOG` wins over `default_directive` when set. Calling this twice is
/// harmless; the second call is ignored.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer::layer().with_target(false).compact())
        .with(SinkLayer)
        .try_init();
}
