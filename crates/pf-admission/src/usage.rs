use std::sync::Mutex;

use pf_core::types::UsageLog;

/// Sink for per-release usage records.
///
/// Implementations must not block for long: the engine calls `record` on
/// the release path. Persistent sinks should hand the record off to a
/// background writer.
pub trait UsageRecorder: Send + Sync {
    fn record(&self, log: UsageLog);
}

/// In-memory recorder used by tests and as a safe default.
#[derive(Default)]
pub struct MemoryUsageRecorder {
    logs: Mutex<Vec<UsageLog>>,
}

impl MemoryUsageRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn snapshot(&self) -> Vec<UsageLog> {
        self.logs
            .lock()
            .expect("usage recorder lock poisoned")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.logs.lock().expect("usage recorder lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UsageRecorder for MemoryUsageRecorder {
    fn record(&self, log: UsageLog) {
        self.logs
            .lock()
            .expect("usage recorder lock poisoned")
            .push(log);
    }
}
