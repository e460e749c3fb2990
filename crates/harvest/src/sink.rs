//! Job-scoped progress sink.
//!
//! Every stage of one acquisition job receives the same `Arc<dyn LogSink>` and
//! reports human-readable progress through it. Internal diagnostics still go
//! through `tracing`; the sink is what a front-end shows to its user.

use std::sync::Arc;

use tracing::info;

pub trait LogSink: Send + Sync {
    fn emit(&self, message: &str);
}

impl<F> LogSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn emit(&self, message: &str) {
        self(message)
    }
}

/// Forwards job messages to `tracing` under the `harvest::job` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, message: &str) {
        info!(target: "harvest::job", "{message}");
    }
}

/// Discards every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn emit(&self, _message: &str) {}
}

pub type SharedSink = Arc<dyn LogSink>;
