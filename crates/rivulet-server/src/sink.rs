//! Session sink writing envelopes to stdout, one per line.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use rivulet_core::session::{SessionError, SessionId, SessionSink};

pub struct StdoutSink {
    id: SessionId,
    scope: String,
    open: AtomicBool,
}

impl StdoutSink {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            id: SessionId::generate(),
            scope: scope.into(),
            open: AtomicBool::new(true),
        }
    }

    pub fn render(&self, text: &str) -> String {
        format!("[{}] {text}", self.scope)
    }
}

impl SessionSink for StdoutSink {
    fn id(&self) -> SessionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, text: &str) -> Result<(), SessionError> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", self.render(text))
            .and_then(|()| out.flush())
            .map_err(|e| SessionError::Send {
                id: self.id,
                reason: e.to_string(),
            })
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}
