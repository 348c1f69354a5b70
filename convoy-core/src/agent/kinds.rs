//! Supported agent binaries
//!
//! Agent-specific behavior (command line, rate-limit heuristics) lives in a
//! closed enum so every match is exhaustive and adding an agent is a
//! compiler-guided change.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::stream::AgentId;
use crate::config::AgentSettings;

/// Which phase of the pipeline a prompt belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPhase {
    Implementation,
    Verification,
    Fix,
}

impl PromptPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implementation => "implementation",
            Self::Verification => "verification",
            Self::Fix => "fix",
        }
    }
}

/// One supported external agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::Claude, AgentKind::Codex, AgentKind::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }

    /// Parse a configured agent name; unknown names are rejected
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }

    pub fn id(&self) -> AgentId {
        match self {
            Self::Claude => AgentId::Claude,
            Self::Codex => AgentId::Codex,
            Self::Gemini => AgentId::Gemini,
        }
    }

    /// Default executable name
    pub fn default_command(&self) -> &'static str {
        self.as_str()
    }

    fn default_args(&self, phase: PromptPhase, settings: &AgentSettings) -> Vec<String> {
        match self {
            Self::Claude => {
                let mut args = vec![
                    "--print".to_string(),
                    "--verbose".to_string(),
                    "--output-format".to_string(),
                    "stream-json".to_string(),
                    "--dangerously-skip-permissions".to_string(),
                ];
                let (tools, turns) = match phase {
                    PromptPhase::Verification => (
                        &settings.verification_tools,
                        settings.verification_max_turns,
                    ),
                    _ => (
                        &settings.implementation_tools,
                        settings.implementation_max_turns,
                    ),
                };
                for tool in tools {
                    args.push("--allowed-tool".to_string());
                    args.push(tool.clone());
                }
                if let Some(turns) = turns {
                    args.push("--max-turns".to_string());
                    args.push(turns.to_string());
                }
                args
            }
            Self::Codex => vec![
                "exec".to_string(),
                "--json".to_string(),
                "--full-auto".to_string(),
            ],
            Self::Gemini => vec!["--yolo".to_string()],
        }
    }

    /// Build the command and argument vector for one invocation
    ///
    /// Custom args from configuration may carry a `{{PROMPT}}` placeholder;
    /// when absent the prompt is appended as the final argument.
    pub fn build_command(
        &self,
        prompt: &str,
        phase: PromptPhase,
        settings: &AgentSettings,
    ) -> (String, Vec<String>) {
        let override_cfg = settings.commands.get(self.as_str());

        let command = override_cfg
            .and_then(|c| c.command.clone())
            .unwrap_or_else(|| self.default_command().to_string());

        let mut args = match override_cfg.and_then(|c| c.args.clone()) {
            Some(custom) => {
                let mut substituted = false;
                let args: Vec<String> = custom
                    .into_iter()
                    .map(|arg| {
                        if arg.contains("{{PROMPT}}") {
                            substituted = true;
                            arg.replace("{{PROMPT}}", prompt)
                        } else {
                            arg
                        }
                    })
                    .collect();
                if substituted {
                    return (command, args);
                }
                args
            }
            None => self.default_args(phase, settings),
        };

        args.push(prompt.to_string());
        (command, args)
    }

    /// Whether the combined output looks like a rate limit for this agent
    ///
    /// For gemini a bare quota mention only counts when the text also names
    /// the tool, because "quota" shows up in ordinary coding output far too
    /// often.
    pub fn looks_like_rate_limit(&self, text: &str) -> bool {
        if common_rate_limit_re().is_match(text) {
            return true;
        }
        match self {
            Self::Gemini => {
                bare_quota_re().is_match(text) && gemini_token_re().is_match(text)
            }
            _ => bare_quota_re().is_match(text),
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn common_rate_limit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(rate.?limit|too many requests|\b429\b|quota exceeded|usage limit|usage exceeded|resource.?exhausted|overloaded|temporarily unavailable|capacity constraints)",
        )
        .expect("rate limit regex")
    })
}

fn bare_quota_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bquota\b").expect("quota regex"))
}

fn gemini_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(gemini|google|generativelanguage)").expect("gemini regex"))
}

/// Whether the combined output looks like a missing agent binary
pub fn looks_like_unavailable(text: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(command not found|no such file or directory|\bENOENT\b|not recognized as an internal|executable file not found)",
        )
        .expect("unavailable regex")
    })
    .is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentSettings;

    #[test]
    fn test_parse_names() {
        assert_eq!(AgentKind::parse("claude"), Some(AgentKind::Claude));
        assert_eq!(AgentKind::parse(" Codex "), Some(AgentKind::Codex));
        assert_eq!(AgentKind::parse("GEMINI"), Some(AgentKind::Gemini));
        assert_eq!(AgentKind::parse("cursor"), None);
    }

    #[test]
    fn test_claude_default_command() {
        let settings = AgentSettings::default();
        let (cmd, args) =
            AgentKind::Claude.build_command("do the thing", PromptPhase::Implementation, &settings);

        assert_eq!(cmd, "claude");
        assert!(args.contains(&"--output-format".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("do the thing"));
    }

    #[test]
    fn test_claude_verification_uses_restricted_tools() {
        let mut settings = AgentSettings::default();
        settings.implementation_tools = vec!["Bash".to_string(), "Edit".to_string()];
        settings.verification_tools = vec!["Bash".to_string()];
        settings.verification_max_turns = Some(30);

        let (_, args) =
            AgentKind::Claude.build_command("verify", PromptPhase::Verification, &settings);
        assert!(!args.contains(&"Edit".to_string()));
        assert!(args.contains(&"--max-turns".to_string()));
        assert!(args.contains(&"30".to_string()));
    }

    #[test]
    fn test_custom_args_prompt_placeholder() {
        let mut settings = AgentSettings::default();
        settings.commands.insert(
            "codex".to_string(),
            crate::config::AgentCommandOverride {
                command: Some("my-codex".to_string()),
                args: Some(vec!["run".to_string(), "{{PROMPT}}".to_string()]),
            },
        );

        let (cmd, args) =
            AgentKind::Codex.build_command("hello", PromptPhase::Implementation, &settings);
        assert_eq!(cmd, "my-codex");
        assert_eq!(args, vec!["run".to_string(), "hello".to_string()]);
    }

    #[test]
    fn test_custom_args_without_placeholder_appends() {
        let mut settings = AgentSettings::default();
        settings.commands.insert(
            "gemini".to_string(),
            crate::config::AgentCommandOverride {
                command: None,
                args: Some(vec!["--fast".to_string()]),
            },
        );

        let (cmd, args) =
            AgentKind::Gemini.build_command("hello", PromptPhase::Implementation, &settings);
        assert_eq!(cmd, "gemini");
        assert_eq!(args, vec!["--fast".to_string(), "hello".to_string()]);
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(AgentKind::Claude.looks_like_rate_limit("HTTP 429 Too Many Requests"));
        assert!(AgentKind::Claude.looks_like_rate_limit("you have hit your usage limit"));
        assert!(AgentKind::Codex.looks_like_rate_limit("Rate limit reached for requests"));
        assert!(!AgentKind::Claude.looks_like_rate_limit("all tests passed"));
    }

    #[test]
    fn test_gemini_quota_needs_cooccurrence() {
        // Bare "quota" in unrelated agent output must not trip gemini
        assert!(!AgentKind::Gemini.looks_like_rate_limit("added a disk quota feature"));
        assert!(AgentKind::Gemini
            .looks_like_rate_limit("Gemini API error: quota exhausted for project"));
        // The other agents accept a bare quota mention
        assert!(AgentKind::Claude.looks_like_rate_limit("quota will reset at midnight"));
    }

    #[test]
    fn test_unavailable_detection() {
        assert!(looks_like_unavailable("zsh: command not found: codex"));
        assert!(looks_like_unavailable(
            "Error: spawn gemini ENOENT: no such file or directory"
        ));
        assert!(!looks_like_unavailable("TypeError: undefined is not a function"));
    }
}
