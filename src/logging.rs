//! Logger sinks used by the mesh node
//!
//! The node reports lifecycle events through the narrow [`Logger`] trait so
//! that embedders can route them anywhere. [`LogLogger`] forwards to the
//! `log` facade and is the default.

use std::error::Error;

/// Sink for node lifecycle messages
pub trait Logger: Send + Sync {
    fn message(&self, text: &str);

    fn warning(&self, text: &str);

    fn error(&self, text: &str, cause: &dyn Error);
}

/// Forwards to the `log` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct LogLogger;

impl Logger for LogLogger {
    fn message(&self, text: &str) {
        log::info!("{}", text);
    }

    fn warning(&self, text: &str) {
        log::warn!("{}", text);
    }

    fn error(&self, text: &str, cause: &dyn Error) {
        log::error!("{}: {}", text, format_cause(cause));
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentLogger;

impl Logger for SilentLogger {
    fn message(&self, _text: &str) {}

    fn warning(&self, _text: &str) {}

    fn error(&self, _text: &str, _cause: &dyn Error) {}
}

/// Render an error with its source chain
pub fn format_cause(cause: &dyn Error) -> String {
    let mut out = cause.to_string();
    let mut next = cause.source();
    while let Some(inner) = next {
        out.push_str(" <- ");
        out.push_str(&inner.to_string());
        next = inner.source();
    }
    out
}
