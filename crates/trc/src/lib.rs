//! Structured logging facade.
//!
//! The upstream mail server generates its event vocabulary from a proc-macro
//! because it has thousands of distinct event kinds. This daemon's
//! vocabulary is small and fixed, so it is written out by hand instead of
//! generated - same facade shape (a closed event enum plus a handful of
//! dispatch functions), no code generation.

use std::fmt;
use std::sync::OnceLock;

use parking_lot::Mutex;

/// One of the fixed events this daemon ever logs.
#[derive(Debug, Clone)]
pub enum Event {
    ListenerBound { endpoint: String },
    ConnectionAccepted { endpoint: String, peer: String },
    ConnectionClosed { endpoint: String, peer: String },
    RewriteForward { sender: String, rewritten: String },
    RewriteReverse { recipient: String, rewritten: String },
    RewriteRejected { address: String, reason: String },
    StoreError { backend: &'static str, error: String },
    PrivilegeDropped { user: String, chroot: String },
    Daemonized { pid: u32 },
    ShuttingDown,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::ListenerBound { endpoint } => write!(f, "listening on {endpoint}"),
            Event::ConnectionAccepted { endpoint, peer } => {
                write!(f, "{endpoint}: accepted connection from {peer}")
            }
            Event::ConnectionClosed { endpoint, peer } => {
                write!(f, "{endpoint}: connection from {peer} closed")
            }
            Event::RewriteForward { sender, rewritten } => {
                write!(f, "forward {sender} -> {rewritten}")
            }
            Event::RewriteReverse { recipient, rewritten } => {
                write!(f, "reverse {recipient} -> {rewritten}")
            }
            Event::RewriteRejected { address, reason } => {
                write!(f, "rejected {address}: {reason}")
            }
            Event::StoreError { backend, error } => write!(f, "{backend} store error: {error}"),
            Event::PrivilegeDropped { user, chroot } => {
                write!(f, "dropped privileges to {user}, chroot {chroot}")
            }
            Event::Daemonized { pid } => write!(f, "daemonized, pid {pid}"),
            Event::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

/// Severity, kept separate from the event itself so one event kind can be
/// logged at different levels depending on context (a rejected rewrite is a
/// `Debug` during normal operation but would be `Warn` if it started
/// happening at volume - callers decide, the facade just carries it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

static SYSLOG_WRITER: OnceLock<Mutex<syslog::Logger<syslog::LoggerBackend, syslog::Formatter3164>>> =
    OnceLock::new();

/// Initializes the `tracing` subscriber and, if requested, a syslog sink.
///
/// Mirrors the original daemon's behavior of always logging to stderr and
/// optionally also logging to syslog when enabled in the configuration.
pub fn init(verbose: bool, use_syslog: bool) {
    let filter = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .try_init();

    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: "postsrsd".into(),
            pid: std::process::id(),
        };
        match syslog::unix(formatter) {
            Ok(writer) => {
                let _ = SYSLOG_WRITER.set(Mutex::new(writer));
            }
            Err(e) => {
                tracing::warn!("failed to open syslog connection: {e}");
            }
        }
    }
}

/// Emits an event at the given level, to `tracing` always and to syslog when
/// configured.
pub fn log(level: Level, event: Event) {
    let message = event.to_string();
    match level {
        Level::Debug => tracing::debug!("{message}"),
        Level::Info => tracing::info!("{message}"),
        Level::Warn => tracing::warn!("{message}"),
        Level::Error => tracing::error!("{message}"),
    }
    if let Some(writer) = SYSLOG_WRITER.get() {
        let mut writer = writer.lock();
        let result = match level {
            Level::Debug | Level::Info => writer.info(&message),
            Level::Warn => writer.warning(&message),
            Level::Error => writer.err(&message),
        };
        if let Err(e) = result {
            tracing::warn!("failed to write to syslog: {e}");
        }
    }
}

#[macro_export]
macro_rules! event {
    ($level:expr, $event:expr) => {
        $crate::log($level, $event)
    };
}
