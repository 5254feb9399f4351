use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;

/// What a reconciliation cycle decided to do about one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Enroll,
    TryConnect,
    UpdateStatus,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    /// Unix milliseconds, strictly increasing within one action.
    pub timestamp: u64,
    pub severity: Severity,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub entries: usize,
    pub terminal: bool,
}

#[derive(Default)]
struct Journal {
    entries: Vec<LogEntry>,
    terminal: bool,
}

/// Supervised execution log of one reconciliation decision for one device.
///
/// Entries are append-only; once terminal the log is frozen. Subscribers are
/// woken on every append and on completion.
pub struct Action {
    kind: ActionType,
    journal: Mutex<Journal>,
    progress: watch::Sender<Progress>,
}

impl Action {
    pub fn new(kind: ActionType) -> Arc<Self> {
        let (progress, _) = watch::channel(Progress::default());
        Arc::new(Self { kind, journal: Mutex::new(Journal::default()), progress })
    }

    pub fn kind(&self) -> ActionType {
        self.kind
    }

    pub fn info(&self, text: impl Into<String>) {
        self.push(Severity::Info, text.into(), false);
    }

    /// Record the terminal error entry and close the log.
    pub fn fail(&self, text: impl Into<String>) {
        self.push(Severity::Error, text.into(), true);
    }

    /// Close the log without an error.
    pub fn finish(&self) {
        let mut journal = self.journal.lock().unwrap_or_else(|e| e.into_inner());
        if journal.terminal {
            return;
        }
        journal.terminal = true;
        self.progress.send_replace(Progress { entries: journal.entries.len(), terminal: true });
    }

    fn push(&self, severity: Severity, text: String, terminal: bool) {
        let mut journal = self.journal.lock().unwrap_or_else(|e| e.into_inner());
        if journal.terminal {
            return;
        }
        let now = common::now_millis();
        let timestamp = match journal.entries.last() {
            Some(last) if last.timestamp >= now => last.timestamp + 1,
            _ => now,
        };
        journal.entries.push(LogEntry { timestamp, severity, text });
        journal.terminal = terminal;
        self.progress.send_replace(Progress { entries: journal.entries.len(), terminal });
    }

    pub fn is_terminal(&self) -> bool {
        self.journal.lock().unwrap_or_else(|e| e.into_inner()).terminal
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.journal.lock().unwrap_or_else(|e| e.into_inner()).entries.clone()
    }

    pub fn last_entry(&self) -> Option<LogEntry> {
        self.journal.lock().unwrap_or_else(|e| e.into_inner()).entries.last().cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub async fn wait_terminal(&self) {
        let mut rx = self.subscribe();
        // the sender lives as long as self, so this only returns once terminal
        let _ = rx.wait_for(|p| p.terminal).await;
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("kind", &self.kind)
            .field("terminal", &self.is_terminal())
            .finish()
    }
}
