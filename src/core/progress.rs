//! Event payloads pushed from the run worker to whoever consumes the run.
//!
//! Events are ordered and delivered over a bounded channel. The consumer owns
//! any marshalling onto its own execution context.

use std::fmt;

use crate::core::orchestrator::{RunState, RunSummary};

/// Kind of work a [`BackupActionItem`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Copy,
    Hash,
    Purge,
    Skip,
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Copy => "Copying",
            Self::Hash => "Hashing",
            Self::Purge => "Purging",
            Self::Skip => "Skipping",
        }
    }
}

/// One reported unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupActionItem {
    pub path: String,
    pub kind: ActionKind,
    /// Backend the action targets; `None` for catalog-level actions.
    pub backend: Option<String>,
    pub percentage: u8,
}

impl BackupActionItem {
    pub fn new(kind: ActionKind, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            backend: None,
            percentage: 100,
        }
    }

    pub fn on_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn at(mut self, percentage: u8) -> Self {
        self.percentage = percentage;
        self
    }
}

/// Advisory per-run log line: `<label> <path> <pct>% [backend]`.
impl fmt::Display for BackupActionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}%", self.kind.label(), self.path, self.percentage)?;
        if let Some(backend) = &self.backend {
            write!(f, " [{}]", backend)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum RunEvent {
    State(RunState),
    Action(BackupActionItem),
    Warning { path: String, message: String },
    Finished(RunSummary),
}

impl RunEvent {
    pub fn as_action(&self) -> Option<&BackupActionItem> {
        match self {
            Self::Action(item) => Some(item),
            _ => None,
        }
    }
}

/// Integer percentage, clamped to 0..=100. An empty total counts as done.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as f64 / total as f64) * 100.0) as u8
}
