//! Identifiers for tasks and sockets.
//!
//! Ids are dense indices into a [`crate::TaskGraph`]; they stay valid for the
//! lifetime of the graph because tasks are never removed from it.

use serde::{Deserialize, Serialize};

/// Task identifier - index of a task inside its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u32);

impl TaskId {
    /// Create from a raw index
    #[must_use]
    pub const fn from_raw(index: u32) -> Self {
        Self(index)
    }

    /// Get as a `usize` index
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task_{}", self.0)
    }
}

/// Reference to one socket of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SocketRef {
    /// Owning task
    pub task: TaskId,
    /// Position of the socket in the task's socket list
    pub socket: usize,
}

impl SocketRef {
    /// Create a new socket reference
    #[must_use]
    pub const fn new(task: TaskId, socket: usize) -> Self {
        Self { task, socket }
    }
}

impl std::fmt::Display for SocketRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.s{}", self.task, self.socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_display() {
        let id = TaskId::from_raw(3);
        assert_eq!(id.to_string(), "task_3");
        assert_eq!(id.index(), 3);
    }

    #[test]
    fn test_socket_ref_display() {
        let sref = SocketRef::new(TaskId::from_raw(2), 1);
        assert_eq!(sref.to_string(), "task_2.s1");
    }

    #[test]
    fn test_ordering() {
        assert!(TaskId::from_raw(1) < TaskId::from_raw(2));
        let a = SocketRef::new(TaskId::from_raw(1), 5);
        let b = SocketRef::new(TaskId::from_raw(2), 0);
        assert!(a < b);
    }
}
