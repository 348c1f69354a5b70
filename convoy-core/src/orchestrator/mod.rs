//! The scheduler
//!
//! One loop per track pulls features through the implementation → merge →
//! verification → fix pipeline. The orchestrator owns every other component
//! by plain composition; nothing here is a singleton, so tests can run many
//! orchestrators side by side.

mod analysis;
mod track;
mod verify;

pub use analysis::{analyze_failure, AnalyzedKind, FailureAnalysis};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use convoy_db::{SessionLog, SessionStatus, SessionUpdate};

use crate::agent::{AgentExecutor, AgentMessage, ExecutionResult, StopSignal};
use crate::config::{ProjectConfig, TrackDefinition};
use crate::events::{Event, EventBus};
use crate::features::{FailureKind, FeatureStatus, FeatureStore};
use crate::git::GitWorkspace;
use crate::lock::FifoMutex;
use crate::queue::QueueManager;
use crate::{Error, Result};

/// Scheduler lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Stopped,
    /// Features loaded, awaiting track configuration
    Setup,
    Running,
    Stopping,
}

/// Read-only runtime status of one track
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackStatus {
    pub track: String,
    pub current_feature: Option<u64>,
    pub current_session: Option<String>,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TrackStatus {
    fn new(track: impl Into<String>) -> Self {
        Self {
            track: track.into(),
            current_feature: None,
            current_session: None,
            queued: 0,
            completed: 0,
            failed: 0,
        }
    }
}

/// Singleton request that prioritizes one feature and stalls other tracks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub feature_id: u64,
    pub track: String,
    pub requested_at: DateTime<Utc>,
}

/// Snapshot returned by [`Orchestrator::get_status`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: RunState,
    pub tracks: Vec<TrackStatus>,
    pub resume: Option<ResumeRequest>,
}

pub(crate) struct OrchestratorInner {
    pub project_root: PathBuf,
    pub config: Arc<ProjectConfig>,
    pub features: FeatureStore,
    pub sessions: SessionLog,
    pub workspace: GitWorkspace,
    pub executor: AgentExecutor,
    pub events: EventBus,

    tracks: StdMutex<Vec<TrackDefinition>>,
    tracks_configured: AtomicBool,
    pub queues: StdMutex<Option<Arc<QueueManager>>>,
    state: StdMutex<RunState>,
    stop_flag: AtomicBool,
    pub resume: StdMutex<Option<ResumeRequest>>,
    track_status: StdMutex<HashMap<String, TrackStatus>>,
    pub verification_mutex: FifoMutex,
    setup_notify: Notify,
    active_tracks: AtomicUsize,
}

/// The scheduler
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Compose an orchestrator over an already-opened session log
    pub fn new(
        project_root: impl Into<PathBuf>,
        config: ProjectConfig,
        sessions: SessionLog,
    ) -> Result<Self> {
        let project_root = project_root.into();
        let config = Arc::new(config);

        let features = FeatureStore::new(project_root.join(&config.features_path));
        let workspace = GitWorkspace::new(
            &project_root,
            config.base_branch.clone(),
            config.workspace.clone(),
        )?;
        let executor = AgentExecutor::new(Arc::clone(&config), &project_root);

        let tracks_configured = config.tracks_configured && !config.tracks.is_empty();

        Ok(Self {
            inner: Arc::new(OrchestratorInner {
                project_root,
                tracks: StdMutex::new(config.tracks.clone()),
                tracks_configured: AtomicBool::new(tracks_configured),
                features,
                sessions,
                workspace,
                executor,
                events: EventBus::new(),
                config,
                queues: StdMutex::new(None),
                state: StdMutex::new(RunState::Stopped),
                stop_flag: AtomicBool::new(false),
                resume: StdMutex::new(None),
                track_status: StdMutex::new(HashMap::new()),
                verification_mutex: FifoMutex::new(),
                setup_notify: Notify::new(),
                active_tracks: AtomicUsize::new(0),
            }),
            handles: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn features(&self) -> &FeatureStore {
        &self.inner.features
    }

    pub fn sessions(&self) -> &SessionLog {
        &self.inner.sessions
    }

    pub fn state(&self) -> RunState {
        self.inner.state()
    }

    /// Start the scheduler
    ///
    /// Prepares the repository, loads features, and launches one loop per
    /// track. When no tracks are configured yet this blocks in the setup
    /// state until [`configure_tracks`](Self::configure_tracks) is called or
    /// the orchestrator is stopped.
    pub async fn start(&self) -> Result<()> {
        if self.inner.state() != RunState::Stopped {
            return Err(Error::Config("orchestrator is already running".to_string()));
        }
        self.inner.stop_flag.store(false, Ordering::SeqCst);

        self.inner.workspace.init().await?;

        let features = self.inner.features.load_features()?;
        let mut categories: Vec<String> =
            features.iter().map(|f| f.category.clone()).collect();
        categories.sort();
        categories.dedup();

        if !self.inner.tracks_configured.load(Ordering::SeqCst) {
            tracing::info!(?categories, "no tracks configured; awaiting setup");
            self.inner.set_state(RunState::Setup);
            self.inner.events.publish(Event::NewCategories {
                categories: categories.clone(),
            });
            self.inner.publish_status();

            loop {
                if self.inner.stop_flag.load(Ordering::SeqCst) {
                    self.inner.set_state(RunState::Stopped);
                    self.inner.publish_status();
                    return Ok(());
                }
                if self.inner.tracks_configured.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = self.inner.setup_notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
            }
        } else {
            let tracks = self.inner.tracks();
            let uncovered: Vec<String> = categories
                .iter()
                .filter(|c| !tracks.iter().any(|t| t.categories.contains(c)))
                .cloned()
                .collect();
            if !uncovered.is_empty() {
                tracing::info!(?uncovered, "categories routed to the default track");
                self.inner.events.publish(Event::NewCategories {
                    categories: uncovered,
                });
            }
        }

        let tracks = self.inner.tracks();
        let queues = Arc::new(QueueManager::new(tracks.clone()));
        queues.initialize_queues(&features);

        {
            let mut status = self
                .inner
                .track_status
                .lock()
                .expect("track status lock poisoned");
            status.clear();
            for t in &tracks {
                let mut s = TrackStatus::new(&t.name);
                s.queued = queues.queue_status(&t.name).total();
                status.insert(t.name.clone(), s);
            }
        }
        *self.inner.queues.lock().expect("queues lock poisoned") = Some(Arc::clone(&queues));

        self.inner.set_state(RunState::Running);
        self.inner.publish_status();

        self.inner
            .active_tracks
            .store(tracks.len(), Ordering::SeqCst);
        let mut handles = self.handles.lock().await;
        for t in tracks {
            let inner = Arc::clone(&self.inner);
            handles.push(tokio::spawn(track::run_track_loop(inner, t)));
        }

        Ok(())
    }

    /// Request a stop; track loops exit between features
    pub fn stop(&self) {
        self.inner.initiate_stop();
    }

    /// Wait for all track loops to exit
    pub async fn join(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }

    /// Supply the track configuration during the setup handshake
    ///
    /// Accepts 1 to 5 definitions with unique non-empty names and exactly
    /// one default. Valid only in the setup state; the accepted
    /// configuration is persisted to the project config file.
    pub fn configure_tracks(&self, tracks: Vec<TrackDefinition>) -> Result<()> {
        if self.inner.state() != RunState::Setup {
            return Err(Error::Config(
                "tracks can only be configured during setup".to_string(),
            ));
        }
        validate_tracks(&tracks)?;

        let mut config = (*self.inner.config).clone();
        config.tracks = tracks.clone();
        config.tracks_configured = true;
        config.save(&self.inner.project_root)?;

        *self.inner.tracks.lock().expect("tracks lock poisoned") = tracks;
        self.inner.tracks_configured.store(true, Ordering::SeqCst);
        self.inner.setup_notify.notify_waiters();
        Ok(())
    }

    /// Reset a feature to open and queue it on its track's retry queue
    pub async fn retry_feature(&self, id: u64, note: Option<String>) -> Result<()> {
        self.reschedule(id, note, false).await
    }

    /// Like retry, but with resume priority: every other track stalls until
    /// this feature completes
    pub async fn resume_feature(&self, id: u64, note: Option<String>) -> Result<()> {
        self.reschedule(id, note, true).await
    }

    async fn reschedule(&self, id: u64, note: Option<String>, resume: bool) -> Result<()> {
        if self.inner.state() != RunState::Running {
            return Err(Error::Config(
                "orchestrator is not running".to_string(),
            ));
        }
        let queues = self
            .inner
            .queue_manager()
            .ok_or_else(|| Error::Config("queues are not initialized".to_string()))?;

        let feature = self
            .inner
            .features
            .get_feature(id)?
            .ok_or(Error::FeatureNotFound(id))?;

        let updated =
            self.inner
                .features
                .update_feature_status(id, FeatureStatus::Open, None, None, None)?;
        self.inner
            .events
            .publish(Event::FeatureUpdated { feature: updated });

        let previous = self.inner.sessions.latest_for_feature(id as i64).await?;
        let context = build_reschedule_context(note.as_deref(), previous.as_ref());
        let previous_id = previous.map(|s| s.id);
        let track = queues.route(&feature).name.clone();

        if resume {
            queues.enqueue_resume(id, &track, Some(context), previous_id);
            *self.inner.resume.lock().expect("resume lock poisoned") = Some(ResumeRequest {
                feature_id: id,
                track: track.clone(),
                requested_at: Utc::now(),
            });
        } else {
            queues.enqueue_retry(id, &track, Some(context), previous_id);
        }

        self.inner.refresh_queued_counts();
        self.inner.publish_status();
        Ok(())
    }

    pub fn get_status(&self) -> StatusSnapshot {
        self.inner.status_snapshot()
    }
}

impl OrchestratorInner {
    pub fn state(&self) -> RunState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn set_state(&self, state: RunState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    pub fn running(&self) -> bool {
        self.state() == RunState::Running && !self.stop_flag.load(Ordering::SeqCst)
    }

    /// Begin a stop: track loops observe the flag between features
    pub fn initiate_stop(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if matches!(*state, RunState::Running | RunState::Setup) {
            *state = RunState::Stopping;
        }
        drop(state);
        self.stop_flag.store(true, Ordering::SeqCst);
        self.setup_notify.notify_waiters();
        tracing::info!("orchestrator stop requested");
    }

    /// The stop predicate handed to the agent executor
    pub fn stop_signal(self: &Arc<Self>) -> StopSignal {
        let inner = Arc::clone(self);
        Arc::new(move || inner.stop_flag.load(Ordering::SeqCst))
    }

    pub fn tracks(&self) -> Vec<TrackDefinition> {
        self.tracks.lock().expect("tracks lock poisoned").clone()
    }

    pub fn queue_manager(&self) -> Option<Arc<QueueManager>> {
        self.queues.lock().expect("queues lock poisoned").clone()
    }

    /// A track loop exited; the last one out flips the state to stopped
    pub fn track_loop_finished(&self) {
        if self.active_tracks.fetch_sub(1, Ordering::SeqCst) == 1
            && self.stop_flag.load(Ordering::SeqCst)
        {
            self.set_state(RunState::Stopped);
            tracing::info!("all track loops drained; orchestrator stopped");
        }
        self.publish_status();
    }

    pub fn resume_target(&self) -> Option<ResumeRequest> {
        self.resume.lock().expect("resume lock poisoned").clone()
    }

    pub fn clear_resume(&self, feature_id: u64) {
        let mut resume = self.resume.lock().expect("resume lock poisoned");
        if resume.as_ref().is_some_and(|r| r.feature_id == feature_id) {
            *resume = None;
        }
    }

    pub fn update_track<F: FnOnce(&mut TrackStatus)>(&self, track: &str, f: F) {
        let mut status = self
            .track_status
            .lock()
            .expect("track status lock poisoned");
        if let Some(s) = status.get_mut(track) {
            f(s);
        }
    }

    pub fn refresh_queued_counts(&self) {
        let Some(queues) = self.queue_manager() else {
            return;
        };
        let mut status = self
            .track_status
            .lock()
            .expect("track status lock poisoned");
        for (name, s) in status.iter_mut() {
            s.queued = queues.queue_status(name).total();
        }
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        let mut tracks: Vec<TrackStatus> = self
            .track_status
            .lock()
            .expect("track status lock poisoned")
            .values()
            .cloned()
            .collect();
        tracks.sort_by(|a, b| a.track.cmp(&b.track));
        StatusSnapshot {
            state: self.state(),
            tracks,
            resume: self.resume_target(),
        }
    }

    pub fn publish_status(&self) {
        let snapshot = self.status_snapshot();
        self.events.publish(Event::OrchestratorStatus {
            state: snapshot.state,
            tracks: snapshot.tracks,
        });
    }

    /// Mark a feature failed and publish the update
    pub fn mark_feature_failed(&self, id: u64, reason: &str, kind: FailureKind) {
        match self
            .features
            .update_feature_status(id, FeatureStatus::Failed, Some(reason), Some(kind), None)
        {
            Ok(feature) => self.events.publish(Event::FeatureUpdated { feature }),
            Err(e) => tracing::error!(feature = id, "failed to record failure: {}", e),
        }
    }

    /// Write a session's terminal state exactly once
    pub async fn finish_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        result: &ExecutionResult,
        started_at: DateTime<Utc>,
    ) {
        let finished = Utc::now();
        let update = SessionUpdate {
            status: Some(status),
            finished_at: Some(finished),
            duration_ms: Some((finished - started_at).num_milliseconds()),
            output: Some(result.output.clone()),
            messages_json: serde_json::to_string(&result.messages).ok(),
            error: result.error.clone(),
            agent_used: Some(result.agent_used.to_string()),
        };
        if let Err(e) = self.sessions.update_session(session_id, &update).await {
            tracing::error!(session = session_id, "failed to update session: {}", e);
        }
    }

    /// Sleep in small steps, returning early once a stop is requested
    pub async fn sleep_polled(&self, duration: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < duration && !self.stop_flag.load(Ordering::SeqCst) {
            let step = Duration::from_millis(250).min(duration - elapsed);
            tokio::time::sleep(step).await;
            elapsed += step;
        }
    }

    /// Append a system message to a session's message log
    pub async fn append_session_note(&self, session_id: &str, note: &str) {
        let message = AgentMessage::system(note);
        if let Ok(Some(session)) = self.sessions.get_session(session_id).await {
            let mut messages: Vec<AgentMessage> =
                serde_json::from_str(&session.messages_json).unwrap_or_default();
            messages.push(message.clone());
            let update = SessionUpdate {
                messages_json: serde_json::to_string(&messages).ok(),
                ..Default::default()
            };
            let _ = self.sessions.update_session(session_id, &update).await;
        }
        self.events
            .publish_output(crate::events::AgentOutput {
                session_id: session_id.to_string(),
                message,
            });
    }
}

/// Validate a proposed track configuration: 1 to 5 tracks, unique non-empty
/// names, exactly one default
pub fn validate_tracks(tracks: &[TrackDefinition]) -> Result<()> {
    if tracks.is_empty() || tracks.len() > 5 {
        return Err(Error::Config(format!(
            "expected between 1 and 5 tracks, got {}",
            tracks.len()
        )));
    }
    let mut names = std::collections::HashSet::new();
    for t in tracks {
        if t.name.trim().is_empty() {
            return Err(Error::Config("track names must be non-empty".to_string()));
        }
        if !names.insert(t.name.as_str()) {
            return Err(Error::Config(format!("duplicate track name: {}", t.name)));
        }
    }
    let defaults = tracks.iter().filter(|t| t.is_default).count();
    if defaults != 1 {
        return Err(Error::Config(format!(
            "exactly one track must be the default, got {}",
            defaults
        )));
    }
    Ok(())
}

/// Context string for a retried or resumed feature: the operator's note plus
/// a tail of the previous session
fn build_reschedule_context(
    note: Option<&str>,
    previous: Option<&convoy_db::SessionRecord>,
) -> String {
    let mut parts = Vec::new();
    if let Some(note) = note {
        if !note.trim().is_empty() {
            parts.push(note.trim().to_string());
        }
    }

    if let Some(session) = previous {
        let messages: Vec<AgentMessage> =
            serde_json::from_str(&session.messages_json).unwrap_or_default();
        let tail: Vec<&str> = messages
            .iter()
            .rev()
            .filter_map(|m| m.content.as_deref())
            .take(5)
            .collect();

        let summary = if tail.is_empty() {
            let output = session.output.trim();
            let chars = output.chars().count();
            if chars == 0 {
                String::new()
            } else {
                output
                    .chars()
                    .skip(chars.saturating_sub(1500))
                    .collect::<String>()
            }
        } else {
            tail.into_iter().rev().collect::<Vec<_>>().join("\n")
        };

        if !summary.is_empty() {
            parts.push(format!("Tail of the previous attempt:\n{}", summary));
        }
    }

    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(name: &str, is_default: bool) -> TrackDefinition {
        TrackDefinition {
            name: name.to_string(),
            categories: vec![],
            color: None,
            is_default,
        }
    }

    #[test]
    fn test_validate_tracks_happy() {
        assert!(validate_tracks(&[track("a", true), track("b", false)]).is_ok());
    }

    #[test]
    fn test_validate_tracks_bounds() {
        assert!(validate_tracks(&[]).is_err());
        let six: Vec<_> = (0..6).map(|i| track(&format!("t{}", i), i == 0)).collect();
        assert!(validate_tracks(&six).is_err());
    }

    #[test]
    fn test_validate_tracks_default_count() {
        assert!(validate_tracks(&[track("a", false)]).is_err());
        assert!(validate_tracks(&[track("a", true), track("b", true)]).is_err());
    }

    #[test]
    fn test_validate_tracks_names() {
        assert!(validate_tracks(&[track("", true)]).is_err());
        assert!(validate_tracks(&[track("a", true), track("a", false)]).is_err());
    }

    #[test]
    fn test_reschedule_context_with_note_only() {
        let context = build_reschedule_context(Some("try harder"), None);
        assert_eq!(context, "try harder");
    }

    #[test]
    fn test_reschedule_context_with_session_messages() {
        let messages = vec![
            AgentMessage::assistant_text("first"),
            AgentMessage::assistant_text("second"),
        ];
        let session = convoy_db::SessionRecord {
            id: "s-1".to_string(),
            feature_id: 1,
            track: "ui".to_string(),
            branch: "feature/1-x".to_string(),
            status: SessionStatus::Failed,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            prompt: String::new(),
            extra_context: None,
            output: "raw output".to_string(),
            messages_json: serde_json::to_string(&messages).unwrap(),
            error: None,
            agent_used: Some("claude".to_string()),
        };

        let context = build_reschedule_context(Some("note"), Some(&session));
        assert!(context.starts_with("note"));
        assert!(context.contains("first\nsecond"));
    }

    #[test]
    fn test_reschedule_context_falls_back_to_output() {
        let session = convoy_db::SessionRecord {
            id: "s-1".to_string(),
            feature_id: 1,
            track: "ui".to_string(),
            branch: "b".to_string(),
            status: SessionStatus::Failed,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            prompt: String::new(),
            extra_context: None,
            output: "only raw output here".to_string(),
            messages_json: "[]".to_string(),
            error: None,
            agent_used: None,
        };
        let context = build_reschedule_context(None, Some(&session));
        assert!(context.contains("only raw output here"));
    }

    #[test]
    fn test_run_state_serde() {
        assert_eq!(
            serde_json::to_string(&RunState::Running).unwrap(),
            "\"running\""
        );
    }
}
