//! 任务与任务注册表
//!
//! 状态机：`Pending → Processing → {Completed, Failed}`，终态不再变化。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::JobError;
use crate::models::JobStatus;

/// 一次批量匹配任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub process_id: String,
    pub session_id: String,
    pub tracker_id: String,
    pub total_batches: usize,
    pub total_items: usize,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn new(
        process_id: &str,
        session_id: &str,
        tracker_id: &str,
        total_batches: usize,
        total_items: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            process_id: process_id.to_string(),
            session_id: session_id.to_string(),
            tracker_id: tracker_id.to_string(),
            total_batches,
            total_items,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 任务注册表
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, job: Job) {
        self.lock().insert(job.process_id.clone(), job);
    }

    pub fn get(&self, process_id: &str) -> Result<Job, JobError> {
        self.lock()
            .get(process_id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(process_id.to_string()))
    }

    /// 状态迁移，非法迁移返回 `InvalidTransition`
    pub fn transition(&self, process_id: &str, next: JobStatus, error: Option<String>) -> Result<Job, JobError> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(process_id)
            .ok_or_else(|| JobError::NotFound(process_id.to_string()))?;

        if !job.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                process_id: process_id.to_string(),
                from: job.status.to_string(),
                to: next.to_string(),
            });
        }

        job.status = next;
        job.updated_at = Utc::now();
        if error.is_some() {
            job.error = error;
        }
        Ok(job.clone())
    }

    /// 全部任务，按创建时间排序
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.process_id.cmp(&b.process_id)));
        jobs
    }

    /// 清理任务
    pub fn remove(&self, process_id: &str) -> Result<Job, JobError> {
        self.lock()
            .remove(process_id)
            .ok_or_else(|| JobError::NotFound(process_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let registry = JobRegistry::new();
        registry.insert(Job::new("p1", "s1", "t1", 3, 125));

        registry.transition("p1", JobStatus::Processing, None).unwrap();
        let job = registry
            .transition("p1", JobStatus::Failed, Some("deadline exceeded".into()))
            .unwrap();
        assert!(job.is_terminal());
        assert_eq!(job.error.as_deref(), Some("deadline exceeded"));

        let err = registry.transition("p1", JobStatus::Completed, None).unwrap_err();
        assert_eq!(
            err,
            JobError::InvalidTransition {
                process_id: "p1".into(),
                from: "failed".into(),
                to: "completed".into(),
            }
        );
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        let registry = JobRegistry::new();
        registry.insert(Job::new("p1", "s1", "t1", 0, 0));
        assert!(registry.transition("p1", JobStatus::Completed, None).is_err());
        assert_eq!(registry.get("p1").unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn test_list_and_remove() {
        let registry = JobRegistry::new();
        registry.insert(Job::new("a", "s", "t", 1, 1));
        registry.insert(Job::new("b", "s", "t", 1, 1));
        assert_eq!(registry.list().len(), 2);

        registry.remove("a").unwrap();
        assert!(matches!(registry.get("a"), Err(JobError::NotFound(_))));
        assert!(registry.remove("a").is_err());
        assert_eq!(registry.list().len(), 1);
    }
}
