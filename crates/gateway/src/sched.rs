//! Periodic jobs: retention purge (cron), time-sync broadcast and link
//! health sampling (intervals).
//!
//! Jobs are plain spawned loops. Shutdown aborts them without waiting,
//! matching the rest of the stop sequence which must never block on a
//! sleeping job.

use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use cron::Schedule;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};

/// Facade view of one registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub schedule: String,
    pub next_run: Option<DateTime<Utc>>,
}

struct Job {
    id: String,
    schedule: String,
    next_run: Arc<StdMutex<Option<DateTime<Utc>>>>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<Vec<Job>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job on a 6-field cron expression evaluated in local time.
    pub async fn add_cron_job<F, Fut>(&self, id: &str, expr: &str, job: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let schedule = Schedule::from_str(expr)
            .map_err(|err| GatewayError::config(format!("invalid cron '{}': {}", expr, err)))?;
        let next_run = Arc::new(StdMutex::new(None));
        let tracker = Arc::clone(&next_run);
        let job_id = id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Local).next() else {
                    warn!("cron job {} has no future fire time, exiting", job_id);
                    break;
                };
                *tracker.lock().expect("next_run mutex poisoned") =
                    Some(next.with_timezone(&Utc));
                let wait = (next - Local::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                debug!("cron job {} firing", job_id);
                job().await;
            }
        });
        self.jobs.lock().await.push(Job {
            id: id.to_string(),
            schedule: format!("cron[{}]", expr),
            next_run,
            handle,
        });
        info!("scheduled cron job {} ({})", id, expr);
        Ok(())
    }

    /// Register a fixed-interval job; the first run is one period from now.
    pub async fn add_interval_job<F, Fut>(&self, id: &str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let next_run = Arc::new(StdMutex::new(None));
        let tracker = Arc::clone(&next_run);
        let job_id = id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                *tracker.lock().expect("next_run mutex poisoned") =
                    Some(Utc::now() + chrono::Duration::from_std(period).unwrap_or_default());
                tokio::time::sleep(period).await;
                debug!("interval job {} firing", job_id);
                job().await;
            }
        });
        self.jobs.lock().await.push(Job {
            id: id.to_string(),
            schedule: format!("every {:?}", period),
            next_run,
            handle,
        });
        info!("scheduled interval job {} (every {:?})", id, period);
    }

    pub async fn jobs(&self) -> Vec<JobInfo> {
        self.jobs
            .lock()
            .await
            .iter()
            .map(|job| JobInfo {
                id: job.id.clone(),
                schedule: job.schedule.clone(),
                next_run: *job.next_run.lock().expect("next_run mutex poisoned"),
            })
            .collect()
    }

    /// Abort every job without waiting for in-flight runs.
    pub async fn shutdown(&self) {
        let mut jobs = self.jobs.lock().await;
        for job in jobs.drain(..) {
            job.handle.abort();
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn interval_job_fires_and_is_listed() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        scheduler
            .add_interval_job("tick", Duration::from_millis(10), move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fired.load(Ordering::SeqCst) >= 2);

        let jobs = scheduler.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "tick");
        assert!(jobs[0].next_run.is_some());

        scheduler.shutdown().await;
        let after = fired.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), after, "aborted jobs stop firing");
    }

    #[tokio::test]
    async fn cron_job_reports_next_run() {
        let scheduler = Scheduler::new();
        scheduler
            .add_cron_job("purge", "0 0 3 * * *", || async {})
            .await
            .unwrap();
        // Give the job loop a moment to compute its first fire time.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let jobs = scheduler.jobs().await;
        let next = jobs[0].next_run.expect("next run computed");
        assert!(next > Utc::now());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn bad_cron_expression_is_rejected() {
        let scheduler = Scheduler::new();
        assert!(scheduler
            .add_cron_job("broken", "not a cron", || async {})
            .await
            .is_err());
    }
}
