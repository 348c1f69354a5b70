//! Project configuration
//!
//! One JSON file at the project root (`convoy.json`). Every field has a
//! default so a minimal file stays minimal; the file is rewritten
//! pretty-printed when saved. A missing file is a fatal startup error that
//! points the operator at the initialization collaborator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agent::AgentKind;
use crate::{Error, Result};

/// File name of the project configuration
pub const CONFIG_FILE: &str = "convoy.json";

/// One scheduling lane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDefinition {
    pub name: String,
    /// Feature categories routed to this track
    #[serde(default)]
    pub categories: Vec<String>,
    /// Display color for the dashboard
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Receives features whose category no track lists
    #[serde(default)]
    pub is_default: bool,
}

/// Worktree policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory under the project root holding one worktree per track
    pub worktrees_dir: String,
    /// Directories linked (relatively) from each worktree back to the
    /// project root; also searched for `bin` dirs when building agent PATHs
    pub symlink_dirs: Vec<String>,
    /// Files copied into each fresh worktree
    pub copy_files: Vec<String>,
    /// Files whose bytes survive every git operation
    pub preserve_files: Vec<String>,
    /// Name of the generated container setup script
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_script: Option<String>,
    /// Container image; setting this enables setup-script generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_workdir: Option<String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            worktrees_dir: ".worktrees".to_string(),
            symlink_dirs: vec!["node_modules".to_string()],
            copy_files: vec![".env".to_string()],
            preserve_files: vec!["features.json".to_string(), "PROGRESS.md".to_string()],
            setup_script: None,
            container_image: None,
            container_workdir: None,
        }
    }
}

/// A regex that marks an agent failure as environmental
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalPattern {
    pub pattern: String,
    pub label: String,
}

/// Inline prompt template overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

/// Per-agent command override
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCommandOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// May contain a `{{PROMPT}}` placeholder; otherwise the prompt is
    /// appended
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

/// Agent selection and invocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Agent tried first for every session
    pub preferred: AgentKind,
    /// Fallback order when the preferred agent is rate-limited or missing
    pub fallbacks: Vec<String>,
    /// Keyed by agent name
    pub commands: HashMap<String, AgentCommandOverride>,
    pub implementation_max_turns: Option<u32>,
    pub verification_max_turns: Option<u32>,
    pub implementation_tools: Vec<String>,
    /// Restricted set for verification (no source editing)
    pub verification_tools: Vec<String>,
    /// How long to wait before retrying rate-limited agents
    pub rate_limit_wait_ms: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            preferred: AgentKind::Claude,
            fallbacks: vec!["codex".to_string(), "gemini".to_string()],
            commands: HashMap::new(),
            implementation_max_turns: None,
            verification_max_turns: Some(40),
            implementation_tools: Vec::new(),
            verification_tools: vec!["Bash".to_string(), "Read".to_string(), "Grep".to_string()],
            rate_limit_wait_ms: 5 * 60 * 1000,
        }
    }
}

/// Merge-and-verify settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Verification attempts (each after a fresh merge) before giving up
    pub max_attempts: u32,
    /// Wait after push so a dev server can hot-reload before verifying
    pub delay_ms: u64,
    /// Skip verification entirely; merged features pass immediately
    pub disabled: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 5000,
            disabled: false,
        }
    }
}

/// Root project configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub project_name: String,
    pub base_branch: String,
    /// Feature list, relative to the project root
    pub features_path: String,
    /// Progress log, relative to the project root
    pub progress_log_path: String,
    /// Instructions document agents must follow
    pub instructions_path: String,
    /// Where the application under development is reachable
    pub app_url: String,
    pub tracks: Vec<TrackDefinition>,
    /// False until the operator has configured tracks at least once
    pub tracks_configured: bool,
    pub workspace: WorkspaceConfig,
    pub critical_patterns: Vec<CriticalPattern>,
    pub prompts: PromptOverrides,
    pub agent: AgentSettings,
    pub verification: VerificationConfig,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            project_name: "project".to_string(),
            base_branch: "main".to_string(),
            features_path: "features.json".to_string(),
            progress_log_path: "PROGRESS.md".to_string(),
            instructions_path: "AGENTS.md".to_string(),
            app_url: "http://localhost:3000".to_string(),
            tracks: Vec::new(),
            tracks_configured: false,
            workspace: WorkspaceConfig::default(),
            critical_patterns: Vec::new(),
            prompts: PromptOverrides::default(),
            agent: AgentSettings::default(),
            verification: VerificationConfig::default(),
        }
    }
}

impl ProjectConfig {
    /// Path of the configuration file inside a project
    pub fn path_in(project_root: &Path) -> PathBuf {
        project_root.join(CONFIG_FILE)
    }

    /// Load the configuration for a project
    ///
    /// A missing file is fatal: the project has not been initialized.
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = Self::path_in(project_root);
        let contents = std::fs::read_to_string(&path).map_err(|_| {
            Error::Config(format!(
                "no {} found in {}; run the init wizard to set up this project",
                CONFIG_FILE,
                project_root.display()
            ))
        })?;

        serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Save the configuration, pretty-printed
    pub fn save(&self, project_root: &Path) -> Result<()> {
        let path = Self::path_in(project_root);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, format!("{}\n", json))?;
        Ok(())
    }

    /// The single default track, when tracks are configured
    pub fn default_track(&self) -> Option<&TrackDefinition> {
        self.tracks.iter().find(|t| t.is_default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let config: ProjectConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.base_branch, "main");
        assert_eq!(config.features_path, "features.json");
        assert_eq!(config.agent.preferred, AgentKind::Claude);
        assert_eq!(config.agent.fallbacks, vec!["codex", "gemini"]);
        assert_eq!(config.verification.max_attempts, 3);
        assert!(!config.verification.disabled);
        assert!(!config.tracks_configured);
    }

    #[test]
    fn test_parse_partial() {
        let json = r#"{
            "project_name": "shop",
            "base_branch": "develop",
            "agent": { "preferred": "codex", "rate_limit_wait_ms": 1000 },
            "verification": { "disabled": true }
        }"#;
        let config: ProjectConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.project_name, "shop");
        assert_eq!(config.base_branch, "develop");
        assert_eq!(config.agent.preferred, AgentKind::Codex);
        assert_eq!(config.agent.rate_limit_wait_ms, 1000);
        assert!(config.verification.disabled);
        // Untouched sections keep their defaults
        assert_eq!(config.verification.max_attempts, 3);
        assert_eq!(config.workspace.worktrees_dir, ".worktrees");
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProjectConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("init"));
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{ nope").unwrap();
        let err = ProjectConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProjectConfig::default();
        config.project_name = "shop".to_string();
        config.tracks = vec![TrackDefinition {
            name: "ui".to_string(),
            categories: vec!["ui".to_string()],
            color: Some("#aa66ff".to_string()),
            is_default: true,
        }];
        config.tracks_configured = true;

        config.save(dir.path()).unwrap();
        let loaded = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.project_name, "shop");
        assert_eq!(loaded.tracks.len(), 1);
        assert!(loaded.tracks[0].is_default);

        // Saved form is pretty-printed
        let raw = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
        assert!(raw.contains("\n  "));
        assert!(raw.ends_with('\n'));
    }

    #[test]
    fn test_default_track_lookup() {
        let mut config = ProjectConfig::default();
        assert!(config.default_track().is_none());
        config.tracks = vec![
            TrackDefinition {
                name: "a".to_string(),
                categories: vec![],
                color: None,
                is_default: false,
            },
            TrackDefinition {
                name: "b".to_string(),
                categories: vec![],
                color: None,
                is_default: true,
            },
        ];
        assert_eq!(config.default_track().map(|t| t.name.as_str()), Some("b"));
    }
}
