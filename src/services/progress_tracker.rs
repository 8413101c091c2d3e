//! 进度跟踪：每个任务一个 tracker，快照只追加不修改

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

use crate::error::TrackerError;
use crate::models::{progress_percentage, JobStatus, MatchOutcome, ProgressSnapshot};

#[derive(Debug)]
struct TrackerState {
    process_id: String,
    total_batches: usize,
    total_items: usize,
    current_batch: usize,
    items_processed: usize,
    found_items: usize,
    not_found_items: usize,
    status: JobStatus,
    error: Option<String>,
    history: Vec<ProgressSnapshot>,
}

impl TrackerState {
    fn push_snapshot(&mut self, tracker_id: &str, message: String) -> ProgressSnapshot {
        let snapshot = ProgressSnapshot {
            tracker_id: tracker_id.to_string(),
            process_id: self.process_id.clone(),
            sequence: self.history.len(),
            timestamp: Utc::now(),
            status: self.status,
            message,
            progress_percentage: progress_percentage(self.current_batch, self.total_batches),
            current_batch: self.current_batch,
            total_batches: self.total_batches,
            items_processed: self.items_processed,
            total_items: self.total_items,
            found_items: self.found_items,
            not_found_items: self.not_found_items,
            error: self.error.clone(),
        };
        self.history.push(snapshot.clone());
        snapshot
    }

    fn ensure_open(&self, tracker_id: &str) -> Result<(), TrackerError> {
        if self.status.is_terminal() {
            return Err(TrackerError::Terminal {
                tracker_id: tracker_id.to_string(),
                status: self.status.to_string(),
            });
        }
        Ok(())
    }
}

/// 进度跟踪器存储
#[derive(Debug, Default)]
pub struct ProgressTracker {
    trackers: Mutex<HashMap<String, TrackerState>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrackerState>> {
        self.trackers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 创建 tracker，返回 tracker_id
    pub fn create_tracker(&self, process_id: &str, total_batches: usize, total_items: usize) -> String {
        let tracker_id = Uuid::new_v4().to_string();
        let mut state = TrackerState {
            process_id: process_id.to_string(),
            total_batches,
            total_items,
            current_batch: 0,
            items_processed: 0,
            found_items: 0,
            not_found_items: 0,
            status: JobStatus::Pending,
            error: None,
            history: Vec::new(),
        };
        state.push_snapshot(&tracker_id, format!("Created tracker for {} batches", total_batches));

        debug!("[任务 {}] 创建进度跟踪器 {}", process_id, tracker_id);
        self.lock().insert(tracker_id.clone(), state);
        tracker_id
    }

    /// 记录一个批次的结果
    ///
    /// `current_batch` 只会前进（batch_index+1 大于当前值时才更新），其余计数累加。
    pub fn update(
        &self,
        tracker_id: &str,
        batch_index: usize,
        outcomes: &[MatchOutcome],
        status: JobStatus,
        error: Option<String>,
    ) -> Result<ProgressSnapshot, TrackerError> {
        let mut trackers = self.lock();
        let state = trackers
            .get_mut(tracker_id)
            .ok_or_else(|| TrackerError::NotFound(tracker_id.to_string()))?;
        state.ensure_open(tracker_id)?;

        state.current_batch = state.current_batch.max(batch_index + 1);
        state.items_processed += outcomes.len();
        let found = outcomes.iter().filter(|o| o.found).count();
        state.found_items += found;
        state.not_found_items += outcomes.len() - found;
        state.status = status;
        if error.is_some() {
            state.error = error;
        }

        let message = format!("Processed batch {}/{}", batch_index + 1, state.total_batches);
        Ok(state.push_snapshot(tracker_id, message))
    }

    /// 只更新状态（开始、完成、失败）
    pub fn set_status(
        &self,
        tracker_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<ProgressSnapshot, TrackerError> {
        let mut trackers = self.lock();
        let state = trackers
            .get_mut(tracker_id)
            .ok_or_else(|| TrackerError::NotFound(tracker_id.to_string()))?;
        state.ensure_open(tracker_id)?;

        state.status = status;
        if error.is_some() {
            state.error = error;
        }

        let message = match (status, state.error.as_deref()) {
            (JobStatus::Failed, Some(err)) => format!("Job failed: {}", err),
            _ => format!("Job {}", status),
        };
        Ok(state.push_snapshot(tracker_id, message))
    }

    /// 最新快照
    pub fn get(&self, tracker_id: &str) -> Result<ProgressSnapshot, TrackerError> {
        self.lock()
            .get(tracker_id)
            .and_then(|state| state.history.last().cloned())
            .ok_or_else(|| TrackerError::NotFound(tracker_id.to_string()))
    }

    /// 全部快照，按写入顺序
    pub fn history(&self, tracker_id: &str) -> Result<Vec<ProgressSnapshot>, TrackerError> {
        self.lock()
            .get(tracker_id)
            .map(|state| state.history.clone())
            .ok_or_else(|| TrackerError::NotFound(tracker_id.to_string()))
    }

    /// 清理 tracker
    pub fn remove(&self, tracker_id: &str) -> Result<(), TrackerError> {
        self.lock()
            .remove(tracker_id)
            .map(|_| ())
            .ok_or_else(|| TrackerError::NotFound(tracker_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Confidence;

    fn outcomes(found: usize, not_found: usize) -> Vec<MatchOutcome> {
        let mut all = Vec::new();
        for i in 0..found {
            let mut o = MatchOutcome::fallback(i as u32 + 1, "x");
            o.found = true;
            o.confidence = Confidence::High;
            all.push(o);
        }
        for i in 0..not_found {
            all.push(MatchOutcome::fallback((found + i) as u32 + 1, "x"));
        }
        all
    }

    #[test]
    fn test_create_and_get() {
        let tracker = ProgressTracker::new();
        let id = tracker.create_tracker("p1", 3, 125);

        let snapshot = tracker.get(&id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Pending);
        assert_eq!(snapshot.progress_percentage, 0.0);
        assert_eq!(snapshot.total_items, 125);
        assert_eq!(snapshot.sequence, 0);
    }

    #[test]
    fn test_unknown_tracker_is_not_found() {
        let tracker = ProgressTracker::new();
        assert_eq!(
            tracker.get("missing"),
            Err(TrackerError::NotFound("missing".to_string()))
        );
        assert!(matches!(
            tracker.update("missing", 0, &[], JobStatus::Processing, None),
            Err(TrackerError::NotFound(_))
        ));
    }

    #[test]
    fn test_out_of_order_updates_are_monotonic() {
        let tracker = ProgressTracker::new();
        let id = tracker.create_tracker("p1", 3, 125);

        let s1 = tracker.update(&id, 2, &outcomes(10, 15), JobStatus::Processing, None).unwrap();
        assert_eq!(s1.current_batch, 3);
        assert_eq!(s1.message, "Processed batch 3/3");

        let s2 = tracker.update(&id, 0, &outcomes(20, 30), JobStatus::Processing, None).unwrap();
        assert_eq!(s2.current_batch, 3);
        assert_eq!(s2.items_processed, 75);
        assert!(s2.items_processed >= s1.items_processed);

        let s3 = tracker.update(&id, 1, &outcomes(50, 0), JobStatus::Processing, None).unwrap();
        assert_eq!(s3.items_processed, 125);
        assert_eq!(s3.found_items, 80);
        assert_eq!(s3.not_found_items, 45);
        assert_eq!(s3.progress_percentage, 100.0);
    }

    #[test]
    fn test_terminal_tracker_rejects_updates() {
        let tracker = ProgressTracker::new();
        let id = tracker.create_tracker("p1", 1, 2);
        tracker.set_status(&id, JobStatus::Processing, None).unwrap();
        tracker.update(&id, 0, &outcomes(1, 1), JobStatus::Processing, None).unwrap();
        tracker.set_status(&id, JobStatus::Completed, None).unwrap();

        let err = tracker.update(&id, 0, &outcomes(1, 0), JobStatus::Processing, None);
        assert!(matches!(err, Err(TrackerError::Terminal { .. })));
        assert!(tracker.set_status(&id, JobStatus::Failed, None).is_err());
        assert_eq!(tracker.get(&id).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_history_and_remove() {
        let tracker = ProgressTracker::new();
        let id = tracker.create_tracker("p1", 2, 4);
        tracker.update(&id, 0, &outcomes(1, 1), JobStatus::Processing, None).unwrap();
        tracker
            .set_status(&id, JobStatus::Failed, Some("deadline exceeded".into()))
            .unwrap();

        let history = tracker.history(&id).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert_eq!(history[2].message, "Job failed: deadline exceeded");
        assert_eq!(history[2].error.as_deref(), Some("deadline exceeded"));

        tracker.remove(&id).unwrap();
        assert!(tracker.is_empty());
        assert!(matches!(tracker.history(&id), Err(TrackerError::NotFound(_))));
    }

    #[test]
    fn test_zero_batches_reports_zero_percent() {
        let tracker = ProgressTracker::new();
        let id = tracker.create_tracker("p1", 0, 0);
        let snapshot = tracker.set_status(&id, JobStatus::Processing, None).unwrap();
        assert_eq!(snapshot.progress_percentage, 0.0);
    }
}
