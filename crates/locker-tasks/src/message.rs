//! Events sent from task workers back to the dispatch side.

use std::fmt;

/// Unique identifier for a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Lifecycle and progress of a background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// A worker picked the task up
    Started { task_id: TaskId, name: String },
    /// Throttled progress report (items processed so far)
    Progress { task_id: TaskId, items: u64 },
    /// Task finished successfully
    Completed { task_id: TaskId, detail: String },
    /// Task failed with a reportable reason
    Failed { task_id: TaskId, error: String },
    /// Task observed its cancellation token and abandoned its work
    Cancelled { task_id: TaskId },
    /// Task panicked; the worker survived
    Panicked { task_id: TaskId, error: String },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Started { task_id, .. }
            | Self::Progress { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::Cancelled { task_id }
            | Self::Panicked { task_id, .. } => *task_id,
        }
    }

    /// No further events follow a terminal event for the same task.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started { .. } | Self::Progress { .. })
    }
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { task_id, name } => write!(f, "{} started: {}", task_id, name),
            Self::Progress { task_id, items } => write!(f, "{} progress: {} items", task_id, items),
            Self::Completed { task_id, detail } => write!(f, "{} completed: {}", task_id, detail),
            Self::Failed { task_id, error } => write!(f, "{} failed: {}", task_id, error),
            Self::Cancelled { task_id } => write!(f, "{} cancelled", task_id),
            Self::Panicked { task_id, error } => write!(f, "{} panicked: {}", task_id, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        let id = TaskId::new(7);

        assert!(!TaskEvent::Progress { task_id: id, items: 3 }.is_terminal());
        assert!(TaskEvent::Cancelled { task_id: id }.is_terminal());
        assert_eq!(TaskEvent::Cancelled { task_id: id }.task_id(), id);
        assert_eq!(id.to_string(), "Task(7)");
    }
}
