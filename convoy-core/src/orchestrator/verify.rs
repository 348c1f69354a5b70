//! Merge and verification subflow
//!
//! Entered only when the feature branch carries commits. The whole window
//! runs under the orchestrator's verification mutex so at most one track
//! merges and verifies at a time. Merged code stays on the base branch even
//! when verification never passes: later features must build on it rather
//! than re-implement it.

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;

use convoy_db::{NewSession, SessionStatus};

use super::OrchestratorInner;
use crate::agent::{build_prompt, PromptContext, PromptPhase};
use crate::config::TrackDefinition;
use crate::events::{AgentOutput, Event};
use crate::features::{FailureKind, Feature, FeatureStatus};

/// Synthetic track names for non-implementation sessions
const VERIFICATION_TRACK: &str = "verification";
const FIX_TRACK: &str = "fix";

pub(crate) async fn verify_and_merge(
    inner: &Arc<OrchestratorInner>,
    track: &TrackDefinition,
    feature: &Feature,
    branch: &str,
    worktree: &Path,
    impl_session_id: &str,
) -> bool {
    let _window = inner.verification_mutex.lock().await;

    let vcfg = &inner.config.verification;
    let max_attempts = if vcfg.disabled {
        1
    } else {
        vcfg.max_attempts.max(1)
    };
    let mut last_failure = String::new();

    for attempt in 1..=max_attempts {
        // Refresh the feature branch from base first; a failure here is not
        // fatal, the merge below may still go through.
        if let Err(e) = inner.workspace.update_feature_branch(worktree).await {
            inner
                .append_session_note(
                    impl_session_id,
                    &format!("could not refresh {} from base: {}", branch, e),
                )
                .await;
        }

        let merged = match inner.workspace.merge_locally(branch).await {
            Ok(pre_merge) => inner.workspace.push_base_branch().await.map(|_| pre_merge),
            Err(e) => Err(e),
        };
        if let Err(e) = merged {
            // The base branch cannot be trusted anymore; nothing else can
            // safely merge after this.
            tracing::error!(feature = feature.id, "merge/push to base failed: {}", e);
            inner.mark_feature_failed(
                feature.id,
                &format!("merge to base failed: {}", e),
                FailureKind::Verification,
            );
            inner.initiate_stop();
            return false;
        }

        if vcfg.disabled {
            set_passed(inner, feature, "merged; verification disabled");
            return true;
        }

        match inner.features.update_feature_status(
            feature.id,
            FeatureStatus::Verifying,
            None,
            None,
            None,
        ) {
            Ok(updated) => inner.events.publish(Event::FeatureUpdated { feature: updated }),
            Err(e) => tracing::error!(feature = feature.id, "could not mark verifying: {}", e),
        }

        // Give a dev server time to pick up the merged code.
        inner
            .sleep_polled(Duration::from_millis(vcfg.delay_ms))
            .await;

        let verification_prompt = build_prompt(
            PromptPhase::Verification,
            &PromptContext {
                feature,
                workdir: &inner.project_root,
                project_root: &inner.project_root,
                config: &inner.config,
                extra_context: None,
                verification_tail: None,
            },
        );

        let session_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let created = inner
            .sessions
            .create_session(&NewSession {
                id: session_id.clone(),
                feature_id: feature.id as i64,
                track: VERIFICATION_TRACK.to_string(),
                branch: branch.to_string(),
                prompt: verification_prompt.clone(),
                extra_context: None,
            })
            .await;
        if let Err(e) = created {
            tracing::error!("could not record verification session: {}", e);
        } else {
            inner.events.publish(Event::SessionStarted {
                session_id: session_id.clone(),
                feature_id: feature.id,
                track: VERIFICATION_TRACK.to_string(),
            });
        }

        let result = {
            let events = inner.events.clone();
            let sid = session_id.clone();
            inner
                .executor
                .execute_verification(&verification_prompt, inner.stop_signal(), move |message| {
                    events.publish_output(AgentOutput {
                        session_id: sid.clone(),
                        message: message.clone(),
                    });
                })
                .await
        };

        // A zero exit is not enough: the verifier reports step results in
        // its output, and any FAIL there is a failure.
        let failed_markers = has_failure_markers(&result.output);
        let verification_passed = result.success && !failed_markers;

        inner
            .finish_session(
                &session_id,
                if verification_passed {
                    SessionStatus::Passed
                } else {
                    SessionStatus::Failed
                },
                &result,
                started_at,
            )
            .await;
        inner.events.publish(Event::SessionFinished {
            session_id: session_id.clone(),
            feature_id: feature.id,
            track: VERIFICATION_TRACK.to_string(),
            success: verification_passed,
        });

        if verification_passed {
            set_passed(
                inner,
                feature,
                &format!("all acceptance steps verified (attempt {})", attempt),
            );
            return true;
        }

        last_failure = failure_tail(&result.output, result.error.as_deref());
        tracing::warn!(
            feature = feature.id,
            attempt,
            "verification failed: {}",
            first_line(&last_failure)
        );

        if attempt < max_attempts && inner.running() {
            run_fix_agent(inner, track, feature, branch, worktree, &last_failure).await;

            // Whatever the fix agent managed, commit it before the next
            // merge; an uncommittable worktree stops the pipeline.
            let fix_message = format!("feature {}: fix after verification attempt {}", feature.id, attempt);
            if let Err(e) = inner.workspace.commit_all_if_dirty(worktree, &fix_message) {
                tracing::error!(feature = feature.id, "could not commit fix: {}", e);
                inner.mark_feature_failed(
                    feature.id,
                    &format!("could not commit fix: {}", e),
                    FailureKind::Verification,
                );
                inner.initiate_stop();
                return false;
            }
        }
    }

    inner.mark_feature_failed(
        feature.id,
        &format!(
            "verification did not pass after {} attempts: {}",
            max_attempts,
            first_line(&last_failure)
        ),
        FailureKind::Verification,
    );
    false
}

async fn run_fix_agent(
    inner: &Arc<OrchestratorInner>,
    _track: &TrackDefinition,
    feature: &Feature,
    branch: &str,
    worktree: &Path,
    verification_tail: &str,
) {
    let fix_prompt = build_prompt(
        PromptPhase::Fix,
        &PromptContext {
            feature,
            workdir: worktree,
            project_root: &inner.project_root,
            config: &inner.config,
            extra_context: None,
            verification_tail: Some(verification_tail),
        },
    );

    let session_id = uuid::Uuid::new_v4().to_string();
    let started_at = Utc::now();
    let created = inner
        .sessions
        .create_session(&NewSession {
            id: session_id.clone(),
            feature_id: feature.id as i64,
            track: FIX_TRACK.to_string(),
            branch: branch.to_string(),
            prompt: fix_prompt.clone(),
            extra_context: None,
        })
        .await;
    if let Err(e) = created {
        tracing::error!("could not record fix session: {}", e);
    } else {
        inner.events.publish(Event::SessionStarted {
            session_id: session_id.clone(),
            feature_id: feature.id,
            track: FIX_TRACK.to_string(),
        });
    }

    let result = {
        let events = inner.events.clone();
        let sid = session_id.clone();
        inner
            .executor
            .execute_fix(worktree, &fix_prompt, inner.stop_signal(), move |message| {
                events.publish_output(AgentOutput {
                    session_id: sid.clone(),
                    message: message.clone(),
                });
            })
            .await
    };

    // The fix agent's own verdict does not matter; the next verification
    // attempt decides. Its session is still recorded faithfully.
    inner
        .finish_session(
            &session_id,
            if result.success {
                SessionStatus::Passed
            } else {
                SessionStatus::Failed
            },
            &result,
            started_at,
        )
        .await;
    inner.events.publish(Event::SessionFinished {
        session_id,
        feature_id: feature.id,
        track: FIX_TRACK.to_string(),
        success: result.success,
    });
}

fn set_passed(inner: &OrchestratorInner, feature: &Feature, progress: &str) {
    match inner.features.update_feature_status(
        feature.id,
        FeatureStatus::Passed,
        None,
        None,
        Some(progress),
    ) {
        Ok(updated) => inner.events.publish(Event::FeatureUpdated { feature: updated }),
        Err(e) => tracing::error!(feature = feature.id, "could not mark passed: {}", e),
    }
}

/// Whether the verifier's output contains a failing step or verdict
pub(crate) fn has_failure_markers(output: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(VERDICT:\s*FAIL|STEP\s+\d+:\s*FAIL)").expect("verdict regex")
    })
    .is_match(output)
}

/// The failing step lines when present, otherwise the output tail
fn failure_tail(output: &str, error: Option<&str>) -> String {
    let markers: Vec<&str> = output
        .lines()
        .filter(|l| has_failure_markers(l))
        .collect();
    if !markers.is_empty() {
        return markers.join("\n");
    }

    let trimmed = output.trim();
    let chars = trimmed.chars().count();
    let tail: String = trimmed.chars().skip(chars.saturating_sub(1500)).collect();
    if tail.is_empty() {
        error.unwrap_or("verification produced no output").to_string()
    } else {
        tail
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}
