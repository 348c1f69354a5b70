//! Agent subprocess execution
//!
//! Runs one implementation, verification, or fix invocation: spawns the
//! agent binary, streams stdout line-by-line into normalized messages,
//! classifies failures, and cycles through the configured fallback agents on
//! rate limits or missing binaries. Stdout is never buffered whole; each
//! line is parsed as it arrives.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};

use super::kinds::{looks_like_unavailable, AgentKind, PromptPhase};
use super::stream::{parse_line, AgentMessage};
use crate::config::ProjectConfig;

/// Polling cadence for the stop predicate while a subprocess runs
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Grace period between SIGTERM and a hard kill
const TERM_GRACE: Duration = Duration::from_secs(2);
/// How much output/stderr tail is carried into prompts and results
const TAIL_CHARS: usize = 2000;

/// Caller-supplied cancellation check, polled while the subprocess runs
///
/// Passed as an explicit value so this layer knows nothing about the
/// scheduler that owns it.
pub type StopSignal = Arc<dyn Fn() -> bool + Send + Sync>;

/// Outcome of one executor entry point
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    /// Concatenated stdout of every attempt
    pub output: String,
    /// Parsed messages of every attempt, plus fallback notices
    pub messages: Vec<AgentMessage>,
    pub error: Option<String>,
    pub stderr_tail: String,
    /// Last attempt's output, when a fallback sequence ran
    pub refined_output: Option<String>,
    /// Last attempt's error text, when a fallback sequence ran
    pub refined_error: Option<String>,
    /// The agent that actually ran last
    pub agent_used: AgentKind,
}

/// Result of a single spawn
struct RunAttempt {
    success: bool,
    output: String,
    messages: Vec<AgentMessage>,
    stderr: String,
    error: Option<String>,
    stopped: bool,
}

/// Executor for external agent processes
pub struct AgentExecutor {
    config: Arc<ProjectConfig>,
    project_root: PathBuf,
}

impl std::fmt::Debug for AgentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentExecutor")
            .field("project_root", &self.project_root)
            .field("preferred", &self.config.agent.preferred)
            .finish()
    }
}

impl AgentExecutor {
    pub fn new(config: Arc<ProjectConfig>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            project_root: project_root.into(),
        }
    }

    /// Implementation phase: full tool set, runs in the feature worktree
    pub async fn execute_session(
        &self,
        workdir: &Path,
        prompt: &str,
        stop: StopSignal,
        on_message: impl FnMut(&AgentMessage),
    ) -> ExecutionResult {
        self.execute(PromptPhase::Implementation, workdir, prompt, stop, on_message)
            .await
    }

    /// Verification phase: restricted tool set, runs in the project root
    pub async fn execute_verification(
        &self,
        prompt: &str,
        stop: StopSignal,
        on_message: impl FnMut(&AgentMessage),
    ) -> ExecutionResult {
        let root = self.project_root.clone();
        self.execute(PromptPhase::Verification, &root, prompt, stop, on_message)
            .await
    }

    /// Fix phase: full tool set, back in the feature worktree
    pub async fn execute_fix(
        &self,
        workdir: &Path,
        prompt: &str,
        stop: StopSignal,
        on_message: impl FnMut(&AgentMessage),
    ) -> ExecutionResult {
        self.execute(PromptPhase::Fix, workdir, prompt, stop, on_message)
            .await
    }

    /// Ordered agent list: preferred first, then valid fallbacks
    fn agent_order(&self) -> Vec<AgentKind> {
        let preferred = self.config.agent.preferred;
        let mut order = vec![preferred];
        for name in &self.config.agent.fallbacks {
            if let Some(kind) = AgentKind::parse(name) {
                if !order.contains(&kind) {
                    order.push(kind);
                }
            } else {
                tracing::warn!(name = %name, "ignoring unknown fallback agent");
            }
        }
        order
    }

    async fn execute(
        &self,
        phase: PromptPhase,
        workdir: &Path,
        prompt: &str,
        stop: StopSignal,
        mut on_message: impl FnMut(&AgentMessage),
    ) -> ExecutionResult {
        let order = self.agent_order();
        let mut rate_limited: HashSet<AgentKind> = HashSet::new();
        let mut current = order[0];
        let mut current_prompt = prompt.to_string();
        let mut attempts = 0usize;
        // One wait-and-reset cycle when every agent is rate-limited; a second
        // exhaustion surfaces as a rate-limit failure for the scheduler to
        // reschedule.
        let mut exhaustion_waits = 0u32;

        let mut all_output = String::new();
        let mut all_messages: Vec<AgentMessage> = Vec::new();

        loop {
            attempts += 1;
            tracing::debug!(agent = %current, phase = phase.as_str(), attempts, "spawning agent");

            let attempt = self
                .run_once(current, phase, &current_prompt, workdir, &stop, &mut on_message)
                .await;

            if !all_output.is_empty() && !attempt.output.is_empty() {
                all_output.push('\n');
            }
            all_output.push_str(&attempt.output);
            all_messages.extend(attempt.messages.iter().cloned());

            let refined = |attempt: &RunAttempt| {
                (
                    Some(attempt.output.clone()),
                    Some(combine_error_text(attempt)),
                )
            };

            if attempt.success {
                return ExecutionResult {
                    success: true,
                    output: all_output,
                    messages: all_messages,
                    error: None,
                    stderr_tail: tail(&attempt.stderr, TAIL_CHARS),
                    refined_output: (attempts > 1).then(|| attempt.output.clone()),
                    refined_error: None,
                    agent_used: current,
                };
            }

            if attempt.stopped || stop() {
                let (refined_output, refined_error) = refined(&attempt);
                return ExecutionResult {
                    success: false,
                    output: all_output,
                    messages: all_messages,
                    error: Some("stopped by orchestrator".to_string()),
                    stderr_tail: tail(&attempt.stderr, TAIL_CHARS),
                    refined_output,
                    refined_error,
                    agent_used: current,
                };
            }

            let combined = combine_failure_text(&attempt);

            if looks_like_unavailable(&combined) {
                let next = order
                    .iter()
                    .copied()
                    .skip_while(|a| *a != current)
                    .skip(1)
                    .find(|a| !rate_limited.contains(a));

                if let Some(next) = next {
                    let notice = AgentMessage::system(format!(
                        "{} is unavailable; switching to {}",
                        current, next
                    ));
                    on_message(&notice);
                    all_messages.push(notice);
                    current = next;
                    // Same prompt: nothing ran, there is no context to carry
                    continue;
                }

                if !rate_limited.is_empty() && exhaustion_waits == 0 {
                    exhaustion_waits += 1;
                    let notice = AgentMessage::system(format!(
                        "{} is unavailable and the remaining agents are rate-limited; waiting",
                        current
                    ));
                    on_message(&notice);
                    all_messages.push(notice);

                    if !self.wait_for_rate_limit(&stop).await {
                        let (refined_output, refined_error) = refined(&attempt);
                        return ExecutionResult {
                            success: false,
                            output: all_output,
                            messages: all_messages,
                            error: Some("stopped while waiting out a rate limit".to_string()),
                            stderr_tail: tail(&attempt.stderr, TAIL_CHARS),
                            refined_output,
                            refined_error,
                            agent_used: current,
                        };
                    }
                    rate_limited.clear();
                    current = order[0];
                    continue;
                }

                let (refined_output, refined_error) = refined(&attempt);
                return ExecutionResult {
                    success: false,
                    output: all_output,
                    messages: all_messages,
                    error: Some(format!("agent {} is unavailable: {}", current, tail(&combined, 400))),
                    stderr_tail: tail(&attempt.stderr, TAIL_CHARS),
                    refined_output,
                    refined_error,
                    agent_used: current,
                };
            }

            if current.looks_like_rate_limit(&combined) {
                rate_limited.insert(current);

                if let Some(next) = order.iter().copied().find(|a| !rate_limited.contains(a)) {
                    let notice = AgentMessage::system(format!(
                        "{} hit a rate limit; switching to {}",
                        current, next
                    ));
                    on_message(&notice);
                    all_messages.push(notice);

                    // The next agent starts cold; give it the tail of what
                    // happened plus where the repository stands.
                    current_prompt = self.augment_prompt(prompt, &attempt, workdir);
                    current = next;
                    continue;
                }

                if exhaustion_waits == 0 {
                    exhaustion_waits += 1;
                    let notice = AgentMessage::system(
                        "every configured agent is rate-limited; waiting before retrying"
                            .to_string(),
                    );
                    on_message(&notice);
                    all_messages.push(notice);

                    if !self.wait_for_rate_limit(&stop).await {
                        let (refined_output, refined_error) = refined(&attempt);
                        return ExecutionResult {
                            success: false,
                            output: all_output,
                            messages: all_messages,
                            error: Some("stopped while waiting out a rate limit".to_string()),
                            stderr_tail: tail(&attempt.stderr, TAIL_CHARS),
                            refined_output,
                            refined_error,
                            agent_used: current,
                        };
                    }
                    rate_limited.clear();
                    current = order[0];
                    continue;
                }

                let (refined_output, refined_error) = refined(&attempt);
                return ExecutionResult {
                    success: false,
                    output: all_output,
                    messages: all_messages,
                    error: Some("every configured agent is rate-limited".to_string()),
                    stderr_tail: tail(&attempt.stderr, TAIL_CHARS),
                    refined_output,
                    refined_error,
                    agent_used: current,
                };
            }

            // Any other failure surfaces immediately
            let (refined_output, refined_error) = refined(&attempt);
            return ExecutionResult {
                success: false,
                output: all_output,
                messages: all_messages,
                error: attempt.error.clone(),
                stderr_tail: tail(&attempt.stderr, TAIL_CHARS),
                refined_output: if attempts > 1 { refined_output } else { None },
                refined_error: if attempts > 1 { refined_error } else { None },
                agent_used: current,
            };
        }
    }

    async fn run_once(
        &self,
        agent: AgentKind,
        phase: PromptPhase,
        prompt: &str,
        workdir: &Path,
        stop: &StopSignal,
        on_message: &mut impl FnMut(&AgentMessage),
    ) -> RunAttempt {
        let (program, args) = agent.build_command(prompt, phase, &self.config.agent);

        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(workdir)
            .env("PATH", self.augmented_path(workdir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                // A NotFound here reads the same as a shell-level "command
                // not found", so the unavailability classifier catches it.
                return RunAttempt {
                    success: false,
                    output: String::new(),
                    messages: Vec::new(),
                    stderr: String::new(),
                    error: Some(format!("failed to spawn {}: {}", program, e)),
                    stopped: false,
                };
            }
        };

        let stderr_handle = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut output = String::new();
        let mut messages = Vec::new();
        let mut stopped = false;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            let mut poll = tokio::time::interval(STOP_POLL_INTERVAL);

            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            output.push_str(&line);
                            output.push('\n');
                            for msg in parse_line(&line, agent.id()) {
                                on_message(&msg);
                                messages.push(msg);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("agent stdout read error: {}", e);
                            break;
                        }
                    },
                    _ = poll.tick() => {
                        if stop() {
                            stopped = true;
                            terminate(&mut child).await;
                            break;
                        }
                    }
                }
            }
        }

        // Stdout is closed (or the run was cancelled); collect the exit.
        let status = {
            let mut poll = tokio::time::interval(STOP_POLL_INTERVAL);
            loop {
                tokio::select! {
                    status = child.wait() => break status,
                    _ = poll.tick() => {
                        if stop() && !stopped {
                            stopped = true;
                            terminate(&mut child).await;
                        }
                    }
                }
            }
        };

        let stderr = match stderr_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        match status {
            Ok(status) if status.success() && !stopped => RunAttempt {
                success: true,
                output,
                messages,
                stderr,
                error: None,
                stopped,
            },
            Ok(status) => RunAttempt {
                success: false,
                output,
                messages,
                stderr,
                error: Some(format!("agent {} exited with {}", agent, status)),
                stopped,
            },
            Err(e) => RunAttempt {
                success: false,
                output,
                messages,
                stderr,
                error: Some(format!("failed waiting for agent {}: {}", agent, e)),
                stopped,
            },
        }
    }

    /// Sleep out the configured rate-limit delay, polling the stop predicate
    ///
    /// Returns false when stopped before the delay elapsed.
    async fn wait_for_rate_limit(&self, stop: &StopSignal) -> bool {
        let total = Duration::from_millis(self.config.agent.rate_limit_wait_ms);
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            if stop() {
                return false;
            }
            let step = STOP_POLL_INTERVAL.min(total - elapsed);
            tokio::time::sleep(step).await;
            elapsed += step;
        }
        !stop()
    }

    /// PATH with the bin directories of every dependency dir prepended,
    /// resolved against both the worktree and the project root
    fn augmented_path(&self, workdir: &Path) -> std::ffi::OsString {
        let mut entries: Vec<PathBuf> = Vec::new();

        for dir in &self.config.workspace.symlink_dirs {
            for root in [workdir, self.project_root.as_path()] {
                for bin in [".bin", "bin"] {
                    let candidate = root.join(dir).join(bin);
                    if candidate.is_dir() && !entries.contains(&candidate) {
                        entries.push(candidate);
                    }
                }
            }
        }

        let existing = std::env::var_os("PATH").unwrap_or_default();
        entries.extend(std::env::split_paths(&existing));
        std::env::join_paths(entries).unwrap_or(existing)
    }

    /// Context section appended to the prompt when switching agents after a
    /// rate limit: recent output, recent errors, and where the repo stands
    fn augment_prompt(&self, original: &str, attempt: &RunAttempt, workdir: &Path) -> String {
        let mut sections = vec![original.to_string()];

        let mut handoff = String::from("## Handoff from a previous agent\n\n");
        handoff.push_str(
            "Another agent started this task and was cut off by a rate limit. \
             Pick up where it left off.\n",
        );

        let output_tail = tail(&attempt.output, TAIL_CHARS);
        if !output_tail.is_empty() {
            handoff.push_str(&format!("\n### Its recent output\n```\n{}\n```\n", output_tail));
        }
        let error_tail = tail(&combine_error_text(attempt), 500);
        if !error_tail.is_empty() {
            handoff.push_str(&format!("\n### Its errors\n```\n{}\n```\n", error_tail));
        }

        let snapshot = repo_snapshot(workdir);
        if !snapshot.is_empty() {
            handoff.push_str(&format!("\n### Repository state\n```\n{}\n```\n", snapshot));
        }

        sections.push(handoff);
        sections.join("\n")
    }
}

/// Graceful terminate: SIGTERM, a short grace period, then a hard kill
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(nix::Error::ESRCH) => {}
            Err(e) => tracing::warn!("failed to send SIGTERM: {}", e),
        }

        tokio::time::sleep(TERM_GRACE).await;
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
    }

    if let Err(e) = child.kill().await {
        tracing::warn!("failed to kill agent process: {}", e);
    }
}

fn combine_error_text(attempt: &RunAttempt) -> String {
    let mut parts = Vec::new();
    if !attempt.stderr.is_empty() {
        parts.push(attempt.stderr.clone());
    }
    if let Some(error) = &attempt.error {
        parts.push(error.clone());
    }
    parts.join("\n")
}

fn combine_failure_text(attempt: &RunAttempt) -> String {
    let mut text = attempt.output.clone();
    text.push('\n');
    text.push_str(&combine_error_text(attempt));
    text
}

/// Last `chars` characters, on a char boundary
fn tail(text: &str, chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= chars {
        trimmed.to_string()
    } else {
        trimmed.chars().skip(count - chars).collect()
    }
}

/// Short porcelain status, diff summary, and last commit of a worktree
fn repo_snapshot(workdir: &Path) -> String {
    let run = |args: &[&str]| -> Option<String> {
        std::process::Command::new("git")
            .args(args)
            .current_dir(workdir)
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim_end().to_string())
            .filter(|s| !s.is_empty())
    };

    let mut sections = Vec::new();
    if let Some(status) = run(&["status", "--porcelain"]) {
        sections.push(format!("status:\n{}", tail(&status, 600)));
    }
    if let Some(diff) = run(&["diff", "--stat"]) {
        sections.push(format!("diff:\n{}", tail(&diff, 600)));
    }
    if let Some(last) = run(&["log", "-1", "--oneline"]) {
        sections.push(format!("last commit: {}", last));
    }
    sections.join("\n")
}
