//! Prompt templates and rendering

mod embedded;

use std::path::Path;

use handlebars::Handlebars;
use serde_json::json;

pub use embedded::{SCOPE_SYSTEM, STUCK_NOTE, SYNTHESIS_INSTRUCTION, SYSTEM_PROMPT};

/// Render the base system prompt.
pub fn render_system_prompt(working_dir: &Path, artifacts: &str) -> String {
    let handlebars = Handlebars::new();
    handlebars
        .render_template(
            SYSTEM_PROMPT,
            &json!({
                "working_dir": working_dir.display().to_string(),
                "artifacts": if artifacts.trim().is_empty() { None } else { Some(artifacts) },
            }),
        )
        .unwrap_or_else(|_| SYSTEM_PROMPT.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_working_dir() {
        let rendered = render_system_prompt(Path::new("/tmp/scope"), "");
        assert!(rendered.contains("/tmp/scope"));
        assert!(!rendered.contains("Prior session artifacts"));
    }

    #[test]
    fn test_render_includes_artifacts_when_present() {
        let rendered = render_system_prompt(Path::new("/tmp/scope"), "earlier trace summary");
        assert!(rendered.contains("Prior session artifacts"));
        assert!(rendered.contains("earlier trace summary"));
    }
}
