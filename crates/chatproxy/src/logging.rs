//! Tracing setup shared by the host library and the worker binary.
//!
//! `RUST_LOG` wins when set. Otherwise the level comes from the explicit
//! argument, then `CHATPROXY_LOG`, defaulting to `info`. `LOG_FORMAT=json`
//! switches to JSON lines. Output goes to stderr or, when a path is given, is
//! appended to that file; never to stdout, which carries the protocol.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing::Subscriber;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, fmt};

pub const LOG_ENV: &str = "CHATPROXY_LOG";

/// Normalize a level name; unknown names fall back to `info`.
pub fn base_level(raw: Option<&str>) -> &'static str {
    match raw.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directives(level: &str) -> String {
    format!("chatproxy={level},chatproxy_worker={level}")
}

pub fn env_filter(level: Option<&str>) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let env_level = std::env::var(LOG_ENV).ok();
    let level = base_level(level.or(env_level.as_deref()));
    EnvFilter::new(filter_directives(level))
}

fn make_writer(log_path: Option<&Path>) -> std::io::Result<BoxMakeWriter> {
    match log_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Ok(BoxMakeWriter::new(Mutex::new(file)))
        }
        None => Ok(BoxMakeWriter::new(std::io::stderr)),
    }
}

fn build_subscriber(
    filter: EnvFilter,
    json: bool,
    writer: BoxMakeWriter,
    ansi: bool,
) -> Box<dyn Subscriber + Send + Sync> {
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        Box::new(registry.with(fmt::layer().json().with_writer(writer)))
    } else {
        Box::new(registry.with(fmt::layer().with_ansi(ansi).with_writer(writer)))
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_tracing(level: Option<&str>, log_path: Option<&Path>) -> std::io::Result<()> {
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    let writer = make_writer(log_path)?;
    let subscriber = build_subscriber(env_filter(level), use_json, writer, log_path.is_none());
    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(())
}
