//! Microtask queue for Boa's promise jobs
//!
//! A worker runs one Boa context on one thread, so jobs are kept in plain
//! `RefCell` queues and drained synchronously whenever control returns to
//! Rust: after a request's synchronous phase and after every timer callback.
//! Timers are not Boa jobs here; they are driven by the worker's tokio event
//! loop (see [`super::timers`]).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use boa_engine::context::Context;
use boa_engine::job::{GenericJob, Job, JobExecutor, PromiseJob};

/// Upper bound on drain passes, so a promise chain that keeps re-queueing
/// itself cannot wedge the worker inside a single drain.
const MAX_DRAIN_PASSES: usize = 10_000;

pub struct LocalJobExecutor {
    /// Promise reactions (then/catch handlers)
    promise_jobs: RefCell<VecDeque<PromiseJob>>,
    /// General-purpose jobs
    generic_jobs: RefCell<VecDeque<GenericJob>>,
}

impl LocalJobExecutor {
    pub fn new() -> Self {
        Self {
            promise_jobs: RefCell::default(),
            generic_jobs: RefCell::default(),
        }
    }

    pub fn has_pending_jobs(&self) -> bool {
        !self.promise_jobs.borrow().is_empty() || !self.generic_jobs.borrow().is_empty()
    }

    /// Runs queued jobs until both queues are empty.
    ///
    /// Errors thrown by a job are logged and do not stop the drain; a
    /// rejected promise nobody handles is not fatal to the worker.
    pub fn drain(&self, context: &mut Context) {
        let mut passes = 0;
        while self.has_pending_jobs() {
            passes += 1;
            if passes > MAX_DRAIN_PASSES {
                tracing::warn!("Job queue still busy after {} passes, deferring", MAX_DRAIN_PASSES);
                break;
            }

            let jobs = std::mem::take(&mut *self.promise_jobs.borrow_mut());
            for job in jobs {
                if let Err(e) = job.call(context) {
                    tracing::error!("Uncaught error in promise job: {e}");
                }
            }

            let generic = self.generic_jobs.borrow_mut().pop_front();
            if let Some(generic) = generic {
                if let Err(err) = generic.call(context) {
                    tracing::error!("Uncaught error in generic job: {err}");
                }
            }
        }

        context.clear_kept_objects();
    }
}

impl Default for LocalJobExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl JobExecutor for LocalJobExecutor {
    fn enqueue_job(self: Rc<Self>, job: Job, _context: &mut Context) {
        match job {
            Job::PromiseJob(job) => self.promise_jobs.borrow_mut().push_back(job),
            Job::GenericJob(g) => self.generic_jobs.borrow_mut().push_back(g),
            _ => {
                tracing::warn!("Unsupported job type enqueued, ignoring");
            }
        }
    }

    fn run_jobs(self: Rc<Self>, context: &mut Context) -> boa_engine::JsResult<()> {
        self.drain(context);
        Ok(())
    }
}
