//! Per-request cleanup stack and resource tracker
//!
//! Cleanup tasks are registered with a priority and executed in descending
//! priority order on every terminal outcome, success or failure. Each task
//! runs inside its own error boundary so one failing task cannot skip the
//! rest. The tracker is plain per-request bookkeeping: it guarantees the
//! terminal log line can say what was allocated and confirms everything was
//! visited exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;
use tracing::{debug, warn};

type CleanupFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

struct CleanupTask {
    name: &'static str,
    priority: u8,
    action: Box<dyn FnOnce() -> CleanupFuture + Send>,
}

/// Deferred actions, run highest priority first.
#[derive(Default)]
pub struct CleanupStack {
    tasks: Vec<CleanupTask>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: &'static str, priority: u8, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.tasks.push(CleanupTask {
            name,
            priority,
            action: Box::new(move || Box::pin(action())),
        });
    }

    /// Run every registered task once. Returns how many reported an error.
    pub async fn run_all(&mut self) -> usize {
        let mut tasks = std::mem::take(&mut self.tasks);
        // Descending priority; registration order breaks ties (stable sort).
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut errors = 0;
        for task in tasks {
            match (task.action)().await {
                Ok(()) => debug!(task = task.name, "cleanup task done"),
                Err(e) => {
                    errors += 1;
                    warn!(task = task.name, error = %e, "cleanup task failed");
                }
            }
        }
        errors
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// What a tracked resource is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer,
    Socket,
    TempFile,
    Task,
}

impl ResourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Buffer => "buffer",
            ResourceKind::Socket => "socket",
            ResourceKind::TempFile => "temp_file",
            ResourceKind::Task => "task",
        }
    }
}

#[derive(Debug)]
struct ResourceEntry {
    kind: ResourceKind,
    created_at: Instant,
    last_access: Instant,
    size: u64,
}

/// Aggregate tracker statistics for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    pub active: usize,
    pub released: usize,
    pub peak_memory: u64,
}

/// Registry of resources owned by one request.
#[derive(Default)]
pub struct ResourceTracker {
    entries: HashMap<u64, ResourceEntry>,
    next_id: u64,
    released: usize,
    peak_memory: u64,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ResourceKind, size: u64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let now = Instant::now();
        self.entries.insert(
            id,
            ResourceEntry {
                kind,
                created_at: now,
                last_access: now,
                size,
            },
        );
        self.update_peak();
        id
    }

    /// Record activity and the current size of a resource.
    pub fn touch(&mut self, id: u64, size: u64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.last_access = Instant::now();
            entry.size = size;
        }
        self.update_peak();
    }

    pub fn release(&mut self, id: u64) {
        if let Some(entry) = self.entries.remove(&id) {
            debug!(
                kind = entry.kind.label(),
                held_ms = entry.created_at.elapsed().as_millis() as u64,
                "resource released"
            );
            self.released += 1;
        }
    }

    /// Release everything still registered; returns how many were left over.
    pub fn release_all(&mut self) -> usize {
        let leftover = self.entries.len();
        self.released += leftover;
        self.entries.clear();
        leftover
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            active: self.entries.len(),
            released: self.released,
            peak_memory: self.peak_memory,
        }
    }

    fn update_peak(&mut self) {
        let current: u64 = self
            .entries
            .values()
            .filter(|e| matches!(e.kind, ResourceKind::Buffer))
            .map(|e| e.size)
            .sum();
        self.peak_memory = self.peak_memory.max(current);
    }
}
