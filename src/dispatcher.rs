use std::sync::Arc;

use crate::breakpoint::BreakpointInfo;
use crate::error::Error;
use crate::task::DownloadTask;

/// Observer of a task's lifecycle. Calls are fire-and-forget and must not block.
pub trait DownloadListener: Send + Sync {
    fn task_start(&self, _task: &DownloadTask) {}

    /// The task picks up a stored layout instead of negotiating a new one.
    fn resume_from_breakpoint(&self, _task: &DownloadTask, _info: &BreakpointInfo) {}

    /// Block 0 has settled the block layout.
    fn split_block_end(&self, _task: &DownloadTask, _info: &BreakpointInfo) {}

    fn fetch_progress(&self, _task: &DownloadTask, _block_index: usize, _bytes: u64) {}

    fn task_end(&self, _task: &DownloadTask, _error: Option<&Error>) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl DownloadListener for NoopListener {}

#[derive(Clone)]
pub struct CallbackDispatcher {
    listeners: Vec<Arc<dyn DownloadListener>>,
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        Self { listeners: vec![] }
    }

    pub fn with_listener(mut self, listener: Arc<dyn DownloadListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn task_start(&self, task: &DownloadTask) {
        self.listeners.iter().for_each(|l| l.task_start(task));
    }

    pub fn resume_from_breakpoint(&self, task: &DownloadTask, info: &BreakpointInfo) {
        self.listeners
            .iter()
            .for_each(|l| l.resume_from_breakpoint(task, info));
    }

    pub fn split_block_end(&self, task: &DownloadTask, info: &BreakpointInfo) {
        self.listeners.iter().for_each(|l| l.split_block_end(task, info));
    }

    pub fn fetch_progress(&self, task: &DownloadTask, block_index: usize, bytes: u64) {
        self.listeners
            .iter()
            .for_each(|l| l.fetch_progress(task, block_index, bytes));
    }

    pub fn task_end(&self, task: &DownloadTask, error: Option<&Error>) {
        self.listeners.iter().for_each(|l| l.task_end(task, error));
    }
}

impl Default for CallbackDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
