//! Prompt construction for agent invocations
//!
//! Templates use `{{VARIABLE}}` placeholders. Resolution order for each
//! phase: a prompt file inside the project (`.convoy/prompts/<phase>.md`),
//! then an inline override from configuration, then the built-in default.

use std::path::Path;

use super::kinds::PromptPhase;
use crate::config::ProjectConfig;
use crate::features::Feature;

const IMPLEMENT_PROMPT: &str = include_str!("prompts/implement.md");
const VERIFY_PROMPT: &str = include_str!("prompts/verify.md");
const FIX_PROMPT: &str = include_str!("prompts/fix.md");

/// Built-in template for a phase
pub fn builtin_template(phase: PromptPhase) -> &'static str {
    match phase {
        PromptPhase::Implementation => IMPLEMENT_PROMPT,
        PromptPhase::Verification => VERIFY_PROMPT,
        PromptPhase::Fix => FIX_PROMPT,
    }
}

/// Resolve the template for a phase: project file, config override, built-in
pub fn resolve_template(
    phase: PromptPhase,
    project_root: &Path,
    config: &ProjectConfig,
) -> String {
    let file = project_root
        .join(".convoy")
        .join("prompts")
        .join(format!("{}.md", phase.as_str()));
    if let Ok(contents) = std::fs::read_to_string(&file) {
        return contents;
    }

    let inline = match phase {
        PromptPhase::Implementation => &config.prompts.implementation,
        PromptPhase::Verification => &config.prompts.verification,
        PromptPhase::Fix => &config.prompts.fix,
    };
    if let Some(template) = inline {
        return template.clone();
    }

    builtin_template(phase).to_string()
}

/// Variable set substituted into a template
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub feature: &'a Feature,
    pub workdir: &'a Path,
    pub project_root: &'a Path,
    pub config: &'a ProjectConfig,
    /// Extra context from a retry or resume, empty when absent
    pub extra_context: Option<&'a str>,
    /// Tail of the failing verification output (fix phase only)
    pub verification_tail: Option<&'a str>,
}

/// Build the complete prompt for one invocation
pub fn build_prompt(phase: PromptPhase, ctx: &PromptContext<'_>) -> String {
    let template = resolve_template(phase, ctx.project_root, ctx.config);

    let steps = numbered_steps(&ctx.feature.steps);
    let extra = match ctx.extra_context {
        Some(text) if !text.is_empty() => {
            format!("## Additional context\n\n{}", text)
        }
        _ => String::new(),
    };

    render(
        &template,
        &[
            ("FEATURE_NAME", ctx.feature.name.as_str()),
            ("FEATURE_ID", &ctx.feature.id.to_string()),
            ("FEATURE_DESCRIPTION", ctx.feature.description.as_str()),
            ("WORKDIR", &ctx.workdir.display().to_string()),
            ("PROJECT_ROOT", &ctx.project_root.display().to_string()),
            ("APP_URL", ctx.config.app_url.as_str()),
            ("BASE_BRANCH", ctx.config.base_branch.as_str()),
            ("STEPS", &steps),
            ("INSTRUCTIONS_PATH", ctx.config.instructions_path.as_str()),
            (
                "VERIFICATION_TAIL",
                ctx.verification_tail.unwrap_or("(no output captured)"),
            ),
            ("EXTRA_CONTEXT", &extra),
        ],
    )
}

/// Number the acceptance steps one per line
fn numbered_steps(steps: &[String]) -> String {
    if steps.is_empty() {
        return "1. The feature works as described.".to_string();
    }
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| format!("{}. {}", i + 1, step))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Substitute `{{KEY}}` placeholders; unknown uppercase placeholders are
/// replaced with a neutral marker so a typo in a custom template is visible
/// instead of silently shipped to the agent
fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("{{{{{}}}}}", key), value);
    }

    loop {
        let Some(start) = result.find("{{") else { break };
        let Some(len) = result[start..].find("}}") else { break };
        let inside = &result[start + 2..start + len];
        if !inside.is_empty()
            && inside
                .chars()
                .all(|c| c.is_ascii_uppercase() || c == '_')
        {
            let placeholder = result[start..start + len + 2].to_string();
            result = result.replacen(&placeholder, "(not specified)", 1);
        } else {
            break;
        }
    }

    result.trim_end().to_string() + "\n"
}
