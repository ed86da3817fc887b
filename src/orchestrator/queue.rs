// =============================================================================
// Job Queue (C10 collaborator) — in-memory FIFO
// =============================================================================
//
// The only coupling to a potential durable queue later is this trait; the
// in-memory implementation below is the default and, for now, the only one.
// =============================================================================

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;

use crate::types::{Job, JobStatus};

#[derive(Debug, Clone, Serialize, Default)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub stopped: u64,
    pub failed: u64,
    pub crashed: u64,
    pub total: u64,
}

pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: Job);
    fn dequeue(&self) -> Option<Job>;
    fn peek(&self) -> Option<Job>;
    fn remove(&self, job_id: &str) -> Option<Job>;
    fn update_status(&self, job_id: &str, status: JobStatus) -> bool;
    fn get_job(&self, job_id: &str) -> Option<Job>;
    fn get_user_jobs(&self, user_id: &str) -> Vec<Job>;
    fn get_all_jobs(&self) -> Vec<Job>;
    fn get_stats(&self) -> QueueStats;
    fn clear(&self);
}

#[derive(Default)]
pub struct InMemoryJobQueue {
    jobs: RwLock<VecDeque<Job>>,
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: Job) {
        self.jobs.write().push_back(job);
    }

    fn dequeue(&self) -> Option<Job> {
        self.jobs.write().pop_front()
    }

    fn peek(&self) -> Option<Job> {
        self.jobs.read().front().cloned()
    }

    fn remove(&self, job_id: &str) -> Option<Job> {
        let mut jobs = self.jobs.write();
        let index = jobs.iter().position(|j| j.job_id == job_id)?;
        jobs.remove(index)
    }

    fn update_status(&self, job_id: &str, status: JobStatus) -> bool {
        let mut jobs = self.jobs.write();
        if let Some(job) = jobs.iter_mut().find(|j| j.job_id == job_id) {
            job.status = status;
            true
        } else {
            false
        }
    }

    fn get_job(&self, job_id: &str) -> Option<Job> {
        self.jobs.read().iter().find(|j| j.job_id == job_id).cloned()
    }

    fn get_user_jobs(&self, user_id: &str) -> Vec<Job> {
        self.jobs.read().iter().filter(|j| j.user_id == user_id).cloned().collect()
    }

    fn get_all_jobs(&self) -> Vec<Job> {
        self.jobs.read().iter().cloned().collect()
    }

    fn get_stats(&self) -> QueueStats {
        let jobs = self.jobs.read();
        let mut stats = QueueStats { total: jobs.len() as u64, ..Default::default() };
        for job in jobs.iter() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Stopped => stats.stopped += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Crashed => stats.crashed += 1,
            }
        }
        stats
    }

    fn clear(&self) {
        self.jobs.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn job(id: &str, user: &str, status: JobStatus) -> Job {
        Job {
            job_id: id.to_string(),
            user_id: user.to_string(),
            strategy_id: "momentum".to_string(),
            broker_id: "default".to_string(),
            config_snapshot: json!({}),
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let q = InMemoryJobQueue::default();
        q.enqueue(job("1", "u1", JobStatus::Queued));
        q.enqueue(job("2", "u1", JobStatus::Queued));
        assert_eq!(q.dequeue().unwrap().job_id, "1");
        assert_eq!(q.dequeue().unwrap().job_id, "2");
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn update_status_and_stats_reflect_changes() {
        let q = InMemoryJobQueue::default();
        q.enqueue(job("1", "u1", JobStatus::Queued));
        assert!(q.update_status("1", JobStatus::Running));
        let stats = q.get_stats();
        assert_eq!(stats.running, 1);
        assert_eq!(stats.queued, 0);
    }

    #[test]
    fn remove_drops_job_from_queue() {
        let q = InMemoryJobQueue::default();
        q.enqueue(job("1", "u1", JobStatus::Queued));
        let removed = q.remove("1").unwrap();
        assert_eq!(removed.job_id, "1");
        assert!(q.get_job("1").is_none());
    }

    #[test]
    fn get_user_jobs_filters_by_owner() {
        let q = InMemoryJobQueue::default();
        q.enqueue(job("1", "u1", JobStatus::Queued));
        q.enqueue(job("2", "u2", JobStatus::Queued));
        assert_eq!(q.get_user_jobs("u1").len(), 1);
    }
}
