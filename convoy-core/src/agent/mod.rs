//! Agent execution: prompt construction, subprocess spawning, event-stream
//! parsing, failure classification, and fallback between agents

mod executor;
mod kinds;
mod prompts;
mod stream;

pub use executor::{AgentExecutor, ExecutionResult, StopSignal};
pub use kinds::{looks_like_unavailable, AgentKind, PromptPhase};
pub use prompts::{build_prompt, builtin_template, resolve_template, PromptContext};
pub use stream::{assistant_text, parse_line, AgentId, AgentMessage, MessageKind};
