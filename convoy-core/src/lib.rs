//! Convoy core - orchestration of parallel coding-agent pipelines
//!
//! Drives a list of feature specifications through an implementation →
//! merge → verification → fix pipeline. Features are routed by category
//! onto tracks; each track runs serially in its own git worktree while
//! tracks run concurrently, serializing only on the shared repository and
//! the merge-verify window.

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod features;
pub mod git;
pub mod lock;
pub mod orchestrator;
pub mod queue;

pub use agent::{
    AgentExecutor, AgentKind, AgentMessage, ExecutionResult, MessageKind, PromptPhase, StopSignal,
};
pub use config::{ProjectConfig, TrackDefinition, CONFIG_FILE};
pub use error::{Error, Result};
pub use events::{AgentOutput, Event, EventBus};
pub use features::{FailureKind, Feature, FeatureStatus, FeatureStore};
pub use git::{feature_branch_name, slugify, BranchStatus, GitWorkspace};
pub use lock::{FifoMutex, FileLock};
pub use orchestrator::{
    analyze_failure, Orchestrator, ResumeRequest, RunState, StatusSnapshot, TrackStatus,
};
pub use queue::{QueueItem, QueueManager, QueueStatus};
