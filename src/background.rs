//! Background job accounting.
//!
//! Clone writes and prefetches run on their own threads. Each one holds a
//! [`JobToken`] from the owning cachefile's [`BackgroundJobs`] so that
//! `end_checkpoint` and `close_cachefile` can wait for them to drain.

use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub(crate) struct BackgroundJobs {
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl BackgroundJobs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(self: &Arc<Self>) -> JobToken {
        *self.outstanding.lock() += 1;
        JobToken {
            jobs: Arc::clone(self),
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.outstanding.lock()
    }

    pub fn wait_idle(&self) {
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            self.idle.wait(&mut outstanding);
        }
    }
}

/// Counts one outstanding job until dropped.
#[derive(Debug)]
pub(crate) struct JobToken {
    jobs: Arc<BackgroundJobs>,
}

impl Drop for JobToken {
    fn drop(&mut self) {
        let mut outstanding = self.jobs.outstanding.lock();
        *outstanding -= 1;
        if *outstanding == 0 {
            self.jobs.idle.notify_all();
        }
    }
}

/// Runs `job` on a named thread. If the thread cannot be spawned the job and
/// its token are dropped before returning the error.
pub(crate) fn spawn_job<F>(name: String, token: JobToken, job: F) -> std::io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            let _token = token;
            job();
        })
        .map(|_| ())
}
