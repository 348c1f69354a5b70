//! Per-track priority queues and category routing
//!
//! Each track owns three FIFO queues. Dequeue order is resume, then retry,
//! then main; within a queue, arrival order. A feature id sits in at most
//! one queue across all tracks and is removed before its session starts.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::config::TrackDefinition;
use crate::features::{Feature, FeatureStatus};

/// One queued unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub feature_id: u64,
    pub is_retry: bool,
    pub is_resume: bool,
    pub extra_context: Option<String>,
    pub previous_session_id: Option<String>,
}

impl QueueItem {
    fn fresh(feature_id: u64) -> Self {
        Self {
            feature_id,
            is_retry: false,
            is_resume: false,
            extra_context: None,
            previous_session_id: None,
        }
    }
}

#[derive(Debug, Default)]
struct TrackQueues {
    resume: VecDeque<QueueItem>,
    retry: VecDeque<QueueItem>,
    main: VecDeque<QueueItem>,
}

/// Counts for one track's queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatus {
    pub main: usize,
    pub retry: usize,
    pub resume: usize,
}

impl QueueStatus {
    pub fn total(&self) -> usize {
        self.main + self.retry + self.resume
    }
}

/// Three-tier queues for every track, plus category routing
#[derive(Debug)]
pub struct QueueManager {
    tracks: Vec<TrackDefinition>,
    queues: Mutex<HashMap<String, TrackQueues>>,
}

impl QueueManager {
    pub fn new(tracks: Vec<TrackDefinition>) -> Self {
        let queues = tracks
            .iter()
            .map(|t| (t.name.clone(), TrackQueues::default()))
            .collect();
        Self {
            tracks,
            queues: Mutex::new(queues),
        }
    }

    pub fn tracks(&self) -> &[TrackDefinition] {
        &self.tracks
    }

    /// Route a feature to a track: first track listing the feature's
    /// category, else the default track, else the first track
    pub fn route(&self, feature: &Feature) -> &TrackDefinition {
        self.tracks
            .iter()
            .find(|t| t.categories.iter().any(|c| c == &feature.category))
            .or_else(|| self.tracks.iter().find(|t| t.is_default))
            .unwrap_or(&self.tracks[0])
    }

    /// Clear all queues and enqueue every open feature, ascending by id
    pub fn initialize_queues(&self, features: &[Feature]) {
        let mut sorted: Vec<&Feature> = features
            .iter()
            .filter(|f| f.status == FeatureStatus::Open)
            .collect();
        sorted.sort_by_key(|f| f.id);

        let mut queues = self.queues.lock().expect("queue lock poisoned");
        for q in queues.values_mut() {
            *q = TrackQueues::default();
        }
        for feature in sorted {
            let track = self.route(feature).name.clone();
            if let Some(q) = queues.get_mut(&track) {
                q.main.push_back(QueueItem::fresh(feature.id));
            }
        }
    }

    /// Pop the next item for a track: resume, then retry, then main
    pub fn dequeue(&self, track: &str) -> Option<QueueItem> {
        let mut queues = self.queues.lock().expect("queue lock poisoned");
        let q = queues.get_mut(track)?;
        q.resume
            .pop_front()
            .or_else(|| q.retry.pop_front())
            .or_else(|| q.main.pop_front())
    }

    pub fn enqueue_retry(
        &self,
        feature_id: u64,
        track: &str,
        extra_context: Option<String>,
        previous_session_id: Option<String>,
    ) {
        let mut queues = self.queues.lock().expect("queue lock poisoned");
        if let Some(q) = queues.get_mut(track) {
            q.retry.push_back(QueueItem {
                feature_id,
                is_retry: true,
                is_resume: false,
                extra_context,
                previous_session_id,
            });
        }
    }

    pub fn enqueue_resume(
        &self,
        feature_id: u64,
        track: &str,
        extra_context: Option<String>,
        previous_session_id: Option<String>,
    ) {
        let mut queues = self.queues.lock().expect("queue lock poisoned");
        if let Some(q) = queues.get_mut(track) {
            q.resume.push_back(QueueItem {
                feature_id,
                is_retry: false,
                is_resume: true,
                extra_context,
                previous_session_id,
            });
        }
    }

    pub fn queue_status(&self, track: &str) -> QueueStatus {
        let queues = self.queues.lock().expect("queue lock poisoned");
        queues
            .get(track)
            .map(|q| QueueStatus {
                main: q.main.len(),
                retry: q.retry.len(),
                resume: q.resume.len(),
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(name: &str, categories: &[&str], is_default: bool) -> TrackDefinition {
        TrackDefinition {
            name: name.to_string(),
            categories: categories.iter().map(|c| c.to_string()).collect(),
            color: None,
            is_default,
        }
    }

    fn feature(id: u64, category: &str, status: FeatureStatus) -> Feature {
        Feature {
            id,
            category: category.to_string(),
            name: format!("f{}", id),
            description: String::new(),
            steps: vec![],
            status,
            failure_reason: None,
            failure_kind: None,
            progress: None,
        }
    }

    fn manager() -> QueueManager {
        QueueManager::new(vec![
            track("api", &["api", "db"], false),
            track("ui", &["ui"], true),
        ])
    }

    #[test]
    fn test_routing() {
        let qm = manager();

        let by_category = feature(1, "db", FeatureStatus::Open);
        assert_eq!(qm.route(&by_category).name, "api");

        let unrouted = feature(2, "infra", FeatureStatus::Open);
        assert_eq!(qm.route(&unrouted).name, "ui"); // default track
    }

    #[test]
    fn test_routing_falls_back_to_first_track() {
        let qm = QueueManager::new(vec![
            track("api", &["api"], false),
            track("ui", &["ui"], false),
        ]);
        let unrouted = feature(1, "infra", FeatureStatus::Open);
        assert_eq!(qm.route(&unrouted).name, "api");
    }

    #[test]
    fn test_initialize_only_open_sorted_by_id() {
        let qm = manager();
        qm.initialize_queues(&[
            feature(9, "api", FeatureStatus::Open),
            feature(2, "api", FeatureStatus::Passed),
            feature(4, "api", FeatureStatus::Open),
            feature(1, "api", FeatureStatus::Failed),
        ]);

        assert_eq!(qm.queue_status("api").main, 2);
        assert_eq!(qm.dequeue("api").unwrap().feature_id, 4);
        assert_eq!(qm.dequeue("api").unwrap().feature_id, 9);
        assert!(qm.dequeue("api").is_none());
    }

    #[test]
    fn test_initialize_clears_previous_state() {
        let qm = manager();
        qm.enqueue_retry(7, "api", None, None);
        qm.initialize_queues(&[feature(1, "api", FeatureStatus::Open)]);

        let status = qm.queue_status("api");
        assert_eq!(status.retry, 0);
        assert_eq!(status.main, 1);
    }

    #[test]
    fn test_priority_resume_retry_main() {
        let qm = manager();
        qm.initialize_queues(&[feature(1, "ui", FeatureStatus::Open)]);
        qm.enqueue_retry(2, "ui", Some("try again".to_string()), None);
        qm.enqueue_resume(3, "ui", None, Some("s-prev".to_string()));

        let first = qm.dequeue("ui").unwrap();
        assert_eq!(first.feature_id, 3);
        assert!(first.is_resume);
        assert_eq!(first.previous_session_id.as_deref(), Some("s-prev"));

        let second = qm.dequeue("ui").unwrap();
        assert_eq!(second.feature_id, 2);
        assert!(second.is_retry);
        assert_eq!(second.extra_context.as_deref(), Some("try again"));

        assert_eq!(qm.dequeue("ui").unwrap().feature_id, 1);
    }

    #[test]
    fn test_fifo_within_queue() {
        let qm = manager();
        qm.enqueue_retry(10, "ui", None, None);
        qm.enqueue_retry(11, "ui", None, None);
        qm.enqueue_retry(12, "ui", None, None);

        assert_eq!(qm.dequeue("ui").unwrap().feature_id, 10);
        assert_eq!(qm.dequeue("ui").unwrap().feature_id, 11);
        assert_eq!(qm.dequeue("ui").unwrap().feature_id, 12);
    }

    #[test]
    fn test_feature_never_in_two_queues() {
        let qm = manager();
        qm.initialize_queues(&[
            feature(1, "api", FeatureStatus::Open),
            feature(2, "ui", FeatureStatus::Open),
            feature(3, "infra", FeatureStatus::Open),
        ]);

        let mut seen = Vec::new();
        for track in ["api", "ui"] {
            while let Some(item) = qm.dequeue(track) {
                seen.push(item.feature_id);
            }
        }
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_unknown_track() {
        let qm = manager();
        assert!(qm.dequeue("ghost").is_none());
        assert_eq!(qm.queue_status("ghost").total(), 0);
    }
}
