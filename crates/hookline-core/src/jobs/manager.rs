//! Job Manager - In-memory registry of background jobs
//!
//! Jobs live only as long as the process. Every mutation takes the job's own
//! lock, and once a job reaches a terminal state further mutations are
//! ignored.

use crate::token::random_token;
use chrono::{DateTime, Utc};
use hookline_common::types::UserId;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Length of generated job ids
const JOB_ID_LENGTH: usize = 8;

/// Kind of background job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Import,
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    total: u64,
    processed: u64,
    errors: Vec<String>,
    result: String,
    updated_at: DateTime<Utc>,
}

/// Point-in-time copy of a job, as returned to API callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub status: JobStatus,
    pub total: u64,
    pub processed: u64,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub result: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A background job
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub user_id: UserId,
    pub kind: JobKind,
    pub created_at: DateTime<Utc>,
    state: Mutex<JobState>,
}

impl Job {
    fn new(id: String, user_id: UserId, kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            kind,
            created_at: now,
            state: Mutex::new(JobState {
                status: JobStatus::Pending,
                total: 0,
                processed: 0,
                errors: Vec::new(),
                result: String::new(),
                updated_at: now,
            }),
        }
    }

    /// Record progress and move the job to `processing`. A zero `total`
    /// keeps the previous total.
    pub async fn update_progress(&self, processed: u64, total: u64) {
        let mut state = self.state.lock().await;
        if state.status.is_terminal() {
            return;
        }
        state.processed = processed;
        if total > 0 {
            state.total = total;
        }
        state.status = JobStatus::Processing;
        state.updated_at = Utc::now();
    }

    /// Append a soft error
    pub async fn add_error(&self, error: impl Into<String>) {
        let mut state = self.state.lock().await;
        if state.status.is_terminal() {
            return;
        }
        state.errors.push(error.into());
        state.updated_at = Utc::now();
    }

    pub async fn complete(&self, result: impl Into<String>) {
        let mut state = self.state.lock().await;
        if state.status.is_terminal() {
            return;
        }
        state.status = JobStatus::Completed;
        state.result = result.into();
        state.updated_at = Utc::now();
    }

    pub async fn fail(&self, error: impl Into<String>) {
        let mut state = self.state.lock().await;
        if state.status.is_terminal() {
            return;
        }
        state.status = JobStatus::Failed;
        state.errors.push(error.into());
        state.updated_at = Utc::now();
    }

    /// Request cancellation. Only pending or processing jobs can be
    /// cancelled; returns whether this call cancelled the job.
    pub async fn cancel(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.status.is_terminal() {
            return false;
        }
        state.status = JobStatus::Cancelled;
        state.updated_at = Utc::now();
        true
    }

    pub async fn is_cancelled(&self) -> bool {
        self.state.lock().await.status == JobStatus::Cancelled
    }

    pub async fn status(&self) -> JobStatus {
        self.state.lock().await.status
    }

    pub async fn snapshot(&self) -> JobSnapshot {
        let state = self.state.lock().await;
        JobSnapshot {
            id: self.id.clone(),
            user_id: self.user_id,
            kind: self.kind,
            status: state.status,
            total: state.total,
            processed: state.processed,
            errors: state.errors.clone(),
            result: state.result.clone(),
            created_at: self.created_at,
            updated_at: state.updated_at,
        }
    }
}

/// Registry of jobs, owned by whoever starts them
#[derive(Debug, Default)]
pub struct JobManager {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending job
    pub async fn create_job(&self, user_id: UserId, kind: JobKind) -> Arc<Job> {
        let mut jobs = self.jobs.write().await;
        let mut id = random_token(JOB_ID_LENGTH);
        while jobs.contains_key(&id) {
            id = random_token(JOB_ID_LENGTH);
        }

        let job = Arc::new(Job::new(id.clone(), user_id, kind));
        jobs.insert(id, job.clone());
        debug!(job_id = %job.id, "Job registered");
        job
    }

    pub async fn get_job(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.read().await.get(id).cloned()
    }

    /// Cancel a job by id. `None` if there is no such job.
    pub async fn cancel(&self, id: &str) -> Option<bool> {
        let job = self.get_job(id).await?;
        Some(job.cancel().await)
    }

    /// Every job of a user, newest first
    pub async fn list_jobs(&self, user_id: UserId) -> Vec<JobSnapshot> {
        let jobs: Vec<Arc<Job>> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();

        let mut snapshots = Vec::with_capacity(jobs.len());
        for job in jobs {
            snapshots.push(job.snapshot().await);
        }
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }

    /// Pending and processing jobs of a user
    pub async fn get_active_jobs(&self, user_id: UserId) -> Vec<JobSnapshot> {
        self.list_jobs(user_id)
            .await
            .into_iter()
            .filter(|j| j.status.is_active())
            .collect()
    }
}
