//! The per-track scheduling loop

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use convoy_db::{NewSession, SessionStatus};

use super::analysis::{analyze_failure, AnalyzedKind};
use super::{verify, OrchestratorInner};
use crate::agent::{build_prompt, ExecutionResult, PromptContext, PromptPhase};
use crate::config::TrackDefinition;
use crate::events::{AgentOutput, Event};
use crate::features::{FailureKind, Feature};
use crate::queue::QueueItem;

const IDLE_POLL: Duration = Duration::from_millis(500);
const RESUME_POLL: Duration = Duration::from_millis(250);
/// A feature that fails faster than this gets a pause before the next one
const FAST_FAIL_WINDOW: Duration = Duration::from_secs(10);
const FAST_FAIL_PAUSE: Duration = Duration::from_secs(5);
/// Consecutive critical failures that pause the track
const CRITICAL_FAILURE_LIMIT: u32 = 2;

/// Outcome of one feature on a track
enum FeatureOutcome {
    Passed,
    Failed { critical: bool },
    /// Left open and rescheduled; not counted either way
    RateLimited,
}

pub(crate) async fn run_track_loop(inner: Arc<OrchestratorInner>, track: TrackDefinition) {
    tracing::info!(track = %track.name, "track loop started");
    let mut consecutive_critical = 0u32;

    loop {
        if !inner.running() {
            break;
        }

        // A resume request parks every track except its target.
        if let Some(request) = inner.resume_target() {
            if request.track != track.name {
                tokio::time::sleep(RESUME_POLL).await;
                continue;
            }
        }

        let Some(queues) = inner.queue_manager() else {
            break;
        };
        let Some(item) = queues.dequeue(&track.name) else {
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        };

        let feature = match inner.features.get_feature(item.feature_id) {
            Ok(Some(feature)) => feature,
            Ok(None) => {
                tracing::warn!(feature = item.feature_id, "queued feature no longer exists");
                continue;
            }
            Err(e) => {
                tracing::warn!(feature = item.feature_id, "feature store error: {}", e);
                continue;
            }
        };

        inner.update_track(&track.name, |s| {
            s.current_feature = Some(feature.id);
            s.current_session = None;
        });
        inner.refresh_queued_counts();
        inner.publish_status();

        let started = Instant::now();
        let outcome = process_feature(&inner, &track, &item, &feature).await;

        if item.is_resume && !matches!(outcome, FeatureOutcome::RateLimited) {
            inner.clear_resume(feature.id);
        }

        let failed = matches!(outcome, FeatureOutcome::Failed { .. });
        match outcome {
            FeatureOutcome::Passed => inner.update_track(&track.name, |s| s.completed += 1),
            FeatureOutcome::Failed { .. } => inner.update_track(&track.name, |s| s.failed += 1),
            FeatureOutcome::RateLimited => {}
        }

        if let Err(e) = inner.workspace.cleanup_worktree(&track.name).await {
            tracing::warn!(track = %track.name, "worktree cleanup failed: {}", e);
        }
        inner.update_track(&track.name, |s| {
            s.current_feature = None;
            s.current_session = None;
        });
        inner.refresh_queued_counts();
        inner.publish_status();

        if let FeatureOutcome::Failed { critical: true } = outcome {
            consecutive_critical += 1;
            if consecutive_critical >= CRITICAL_FAILURE_LIMIT {
                let reason = format!(
                    "{} consecutive critical infrastructure failures",
                    consecutive_critical
                );
                tracing::error!(track = %track.name, "{}; pausing track until restart", reason);
                inner.events.publish(Event::TrackCriticalFailure {
                    track: track.name.clone(),
                    reason,
                });
                break;
            }
        } else {
            consecutive_critical = 0;
        }

        if failed && started.elapsed() < FAST_FAIL_WINDOW {
            tokio::time::sleep(FAST_FAIL_PAUSE).await;
        }
    }

    tracing::info!(track = %track.name, "track loop exited");
    inner.track_loop_finished();
}

async fn process_feature(
    inner: &Arc<OrchestratorInner>,
    track: &TrackDefinition,
    item: &QueueItem,
    feature: &Feature,
) -> FeatureOutcome {
    let (branch, worktree) = match inner
        .workspace
        .prepare_branch(&track.name, feature.id, &feature.name, item.is_retry)
        .await
    {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(feature = feature.id, "could not prepare worktree: {}", e);
            inner.mark_feature_failed(
                feature.id,
                &format!("could not prepare worktree: {}", e),
                FailureKind::Environment,
            );
            return FeatureOutcome::Failed { critical: false };
        }
    };

    let prompt = build_prompt(
        PromptPhase::Implementation,
        &PromptContext {
            feature,
            workdir: &worktree,
            project_root: &inner.project_root,
            config: &inner.config,
            extra_context: item.extra_context.as_deref(),
            verification_tail: None,
        },
    );

    let session_id = uuid::Uuid::new_v4().to_string();
    let started_at = Utc::now();
    let new_session = NewSession {
        id: session_id.clone(),
        feature_id: feature.id as i64,
        track: track.name.clone(),
        branch: branch.clone(),
        prompt: prompt.clone(),
        extra_context: item.extra_context.clone(),
    };
    if let Err(e) = inner.sessions.create_session(&new_session).await {
        tracing::error!(feature = feature.id, "session log unavailable: {}", e);
        inner.mark_feature_failed(
            feature.id,
            &format!("session log unavailable: {}", e),
            FailureKind::Environment,
        );
        return FeatureOutcome::Failed { critical: false };
    }
    inner.update_track(&track.name, |s| s.current_session = Some(session_id.clone()));
    inner.events.publish(Event::SessionStarted {
        session_id: session_id.clone(),
        feature_id: feature.id,
        track: track.name.clone(),
    });
    inner.publish_status();

    let result = {
        let events = inner.events.clone();
        let sid = session_id.clone();
        inner
            .executor
            .execute_session(&worktree, &prompt, inner.stop_signal(), move |message| {
                events.publish_output(AgentOutput {
                    session_id: sid.clone(),
                    message: message.clone(),
                });
            })
            .await
    };

    if !result.success {
        let combined = combined_failure_text(&result);
        let analysis = analyze_failure(&combined, &inner.config.critical_patterns);

        inner
            .finish_session(&session_id, SessionStatus::Failed, &result, started_at)
            .await;
        inner.events.publish(Event::SessionFinished {
            session_id: session_id.clone(),
            feature_id: feature.id,
            track: track.name.clone(),
            success: false,
        });

        if analysis.kind == AnalyzedKind::RateLimit {
            // The feature stays open; it goes back with resume priority and
            // this track sleeps out the limit.
            tracing::warn!(feature = feature.id, "rate-limited; rescheduling");
            if let Some(queues) = inner.queue_manager() {
                queues.enqueue_resume(
                    feature.id,
                    &track.name,
                    item.extra_context.clone(),
                    Some(session_id),
                );
            }
            inner
                .sleep_polled(Duration::from_millis(inner.config.agent.rate_limit_wait_ms))
                .await;
            return FeatureOutcome::RateLimited;
        }

        inner.mark_feature_failed(feature.id, &analysis.reason, analysis.persisted_kind());
        return FeatureOutcome::Failed {
            critical: analysis.is_critical,
        };
    }

    // Commit whatever the agent left in the tree.
    let commit_message = format!("feature {}: {}", feature.id, feature.name);
    if let Err(e) = inner.workspace.commit_all_if_dirty(&worktree, &commit_message) {
        inner
            .append_session_note(&session_id, &format!("auto-commit failed: {}", e))
            .await;
        inner
            .finish_session(&session_id, SessionStatus::Error, &result, started_at)
            .await;
        inner.events.publish(Event::SessionFinished {
            session_id: session_id.clone(),
            feature_id: feature.id,
            track: track.name.clone(),
            success: false,
        });
        inner.mark_feature_failed(
            feature.id,
            &format!("auto-commit failed: {}", e),
            FailureKind::Environment,
        );
        return FeatureOutcome::Failed { critical: false };
    }

    let branch_status = match inner.workspace.branch_status(&branch, &worktree) {
        Ok(status) => status,
        Err(e) => {
            inner
                .finish_session(&session_id, SessionStatus::Error, &result, started_at)
                .await;
            inner.events.publish(Event::SessionFinished {
                session_id: session_id.clone(),
                feature_id: feature.id,
                track: track.name.clone(),
                success: false,
            });
            inner.mark_feature_failed(
                feature.id,
                &format!("could not inspect feature branch: {}", e),
                FailureKind::Environment,
            );
            return FeatureOutcome::Failed { critical: false };
        }
    };

    if branch_status.ahead_count == 0 {
        // A "successful" run that changed nothing would loop forever if the
        // scheduler kept going; stop and let the operator look.
        inner
            .append_session_note(&session_id, "agent finished without producing any commits")
            .await;
        inner
            .finish_session(&session_id, SessionStatus::Failed, &result, started_at)
            .await;
        inner.events.publish(Event::SessionFinished {
            session_id: session_id.clone(),
            feature_id: feature.id,
            track: track.name.clone(),
            success: false,
        });
        inner.mark_feature_failed(
            feature.id,
            "agent run produced no commits",
            FailureKind::Implementation,
        );
        inner.initiate_stop();
        return FeatureOutcome::Failed { critical: false };
    }

    inner
        .finish_session(&session_id, SessionStatus::Passed, &result, started_at)
        .await;
    inner.events.publish(Event::SessionFinished {
        session_id: session_id.clone(),
        feature_id: feature.id,
        track: track.name.clone(),
        success: true,
    });

    let passed =
        verify::verify_and_merge(inner, track, feature, &branch, &worktree, &session_id).await;

    if passed {
        FeatureOutcome::Passed
    } else {
        FeatureOutcome::Failed { critical: false }
    }
}

/// Text handed to failure analysis: after a fallback sequence the refined
/// fields carry the last attempt, which is the one that matters
fn combined_failure_text(result: &ExecutionResult) -> String {
    let output = result
        .refined_output
        .as_deref()
        .unwrap_or(&result.output);
    let error_text = result
        .refined_error
        .clone()
        .unwrap_or_else(|| {
            let mut text = result.stderr_tail.clone();
            if let Some(error) = &result.error {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(error);
            }
            text
        });
    format!("{}\n{}", output, error_text)
}
