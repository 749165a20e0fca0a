//! Fan-out of independent per-item jobs with per-job failure capture.
//!
//! Both execution modes run every job, capture its error (or panic) as the
//! job's result, and return outcomes in submission order.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    Parallel { workers: usize },
}

#[derive(Debug)]
pub struct JobOutcome<T, R> {
    pub item: T,
    pub result: Result<R, PipelineError>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn of<T, R>(outcomes: &[JobOutcome<T, R>]) -> Self {
        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        BatchSummary {
            succeeded: outcomes.len() - failed,
            failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    mode: ExecutionMode,
    show_progress: bool,
}

impl Coordinator {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            show_progress: false,
        }
    }

    pub fn sequential() -> Self {
        Self::new(ExecutionMode::Sequential)
    }

    pub fn parallel(workers: usize) -> Self {
        Self::new(ExecutionMode::Parallel {
            workers: workers.max(1),
        })
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Runs `job` once per item. A failing or panicking job is reported and
    /// recorded in its outcome; the remaining jobs still run to completion.
    pub fn run<T, R, F>(&self, label: &str, items: Vec<T>, job: F) -> Vec<JobOutcome<T, R>>
    where
        T: Send + std::fmt::Debug,
        R: Send,
        F: Fn(&T) -> Result<R, PipelineError> + Sync,
    {
        let progress = self.progress_bar(label, items.len());
        let execute = |item: T| {
            let result = run_isolated(&job, &item);
            if let Err(err) = &result {
                warn!(job = label, item = ?item, error = %err, "job failed");
            }
            progress.inc(1);
            JobOutcome { item, result }
        };

        let outcomes: Vec<JobOutcome<T, R>> = match self.mode {
            ExecutionMode::Sequential => items.into_iter().map(execute).collect(),
            ExecutionMode::Parallel { workers } => {
                match ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .thread_name(|i| format!("cohort-worker-{i}"))
                    .build()
                {
                    Ok(pool) => {
                        debug!(job = label, workers, "running on worker pool");
                        pool.install(|| items.into_par_iter().map(execute).collect())
                    }
                    Err(err) => {
                        warn!(error = %err, "worker pool unavailable, running sequentially");
                        items.into_iter().map(execute).collect()
                    }
                }
            }
        };

        progress.finish_and_clear();
        outcomes
    }

    fn progress_bar(&self, label: &str, len: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message(label.to_string());
        pb
    }
}

fn run_isolated<T, R, F>(job: &F, item: &T) -> Result<R, PipelineError>
where
    F: Fn(&T) -> Result<R, PipelineError>,
{
    panic::catch_unwind(AssertUnwindSafe(|| job(item)))
        .unwrap_or_else(|payload| Err(PipelineError::JobPanicked(panic_message(payload))))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
