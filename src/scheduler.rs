// =============================================================================
// Scheduler — named, periodic jobs with overlap protection
// =============================================================================
//
// Replaces the ad-hoc `tokio::spawn` + `tokio::time::interval` loops that used
// to live directly in main.rs. Every job is registered once with a name and a
// period; the scheduler owns the task and guarantees a job never overlaps
// itself — if a tick is still running when the next one is due, the tick is
// skipped and counted rather than run concurrently.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type JobFactory = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Runtime statistics for a single registered job.
#[derive(Debug, Default)]
pub struct JobStats {
    pub ticks_run: AtomicU64,
    pub ticks_skipped_overlap: AtomicU64,
}

struct Job {
    name: String,
    period_millis: AtomicU64,
    factory: JobFactory,
    running: Arc<AtomicBool>,
    stats: Arc<JobStats>,
}

/// Owns every scheduled job and coordinates graceful shutdown.
pub struct Scheduler {
    jobs: Mutex<HashMap<String, Arc<Job>>>,
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a named job with the given period. `make_tick` is called
    /// once per tick to build the future that runs the job body; it must
    /// not capture any `&mut` state, only `Arc`/`Clone` handles.
    pub fn register<F, Fut>(&self, name: impl Into<String>, period: Duration, make_tick: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let factory: JobFactory = Arc::new(move || Box::pin(make_tick()));
        let job = Arc::new(Job {
            name: name.clone(),
            period_millis: AtomicU64::new(period.as_millis() as u64),
            factory,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(JobStats::default()),
        });
        self.jobs.lock().insert(name, job);
    }

    /// Change a registered job's period. Takes effect from the job's next
    /// tick onward.
    pub fn reschedule(&self, name: &str, period: Duration) -> bool {
        let jobs = self.jobs.lock();
        if let Some(job) = jobs.get(name) {
            job.period_millis
                .store(period.as_millis() as u64, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Fetch the stats for a given job name, if registered.
    pub fn stats(&self, name: &str) -> Option<Arc<JobStats>> {
        self.jobs.lock().get(name).map(|j| j.stats.clone())
    }

    /// Spawn every registered job as a `tokio::spawn`'d loop.
    pub fn start(&self) {
        let jobs: Vec<Arc<Job>> = self.jobs.lock().values().cloned().collect();
        let mut handles = self.handles.lock();
        for job in jobs {
            let shutdown = self.shutdown.clone();
            let handle = tokio::spawn(async move {
                run_job_loop(job, shutdown).await;
            });
            handles.push(handle);
        }
        info!(job_count = handles.len(), "scheduler started");
    }

    /// Signal every job loop to stop after its current tick, then wait up to
    /// `drain_deadline` for them to finish.
    pub async fn shutdown(&self, drain_deadline: Duration) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let all = futures_util::future::join_all(handles);
        match tokio::time::timeout(drain_deadline, all).await {
            Ok(_) => info!("scheduler drained cleanly"),
            Err(_) => warn!("scheduler drain deadline exceeded — jobs may still be running"),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_job_loop(job: Arc<Job>, shutdown: Arc<AtomicBool>) {
    loop {
        let period = Duration::from_millis(job.period_millis.load(Ordering::SeqCst));
        tokio::time::sleep(period).await;
        if shutdown.load(Ordering::SeqCst) {
            info!(job = %job.name, "job loop stopping for shutdown");
            return;
        }

        if job
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            job.stats.ticks_skipped_overlap.fetch_add(1, Ordering::Relaxed);
            warn!(job = %job.name, "tick skipped — previous run still in flight");
            continue;
        }

        let running = job.running.clone();
        let stats = job.stats.clone();
        let fut = (job.factory)();
        fut.await;
        stats.ticks_run.fetch_add(1, Ordering::Relaxed);
        running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn runs_job_on_its_period() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        scheduler.register("tick", Duration::from_millis(20), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(90)).await;
        scheduler.shutdown(Duration::from_millis(100)).await;
        assert!(counter.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped_and_counted() {
        let scheduler = Scheduler::new();
        scheduler.register("slow", Duration::from_millis(10), || async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let stats = scheduler.stats("slow").unwrap();
        scheduler.shutdown(Duration::from_millis(200)).await;
        assert!(stats.ticks_skipped_overlap.load(Ordering::SeqCst) >= 1);
    }
}
