//! Embedded prompt templates (Handlebars)

/// Base system prompt for the main loop. The context builder appends the
/// workspace map, fact sheet and archive hint on every build.
pub const SYSTEM_PROMPT: &str = "\
You are an autonomous engineering agent working inside a bounded run.

Working directory: {{working_dir}}

Rules:
- Use tools to gather evidence before answering; claims need file paths or line references.
- Prefer reading wider windows over re-reading the same small slice.
- When the task is done, answer directly or call the report tool with a final summary.
- If searches keep coming back empty, say what was searched and what remains uncertain.
{{#if artifacts}}
Prior session artifacts:
{{artifacts}}
{{/if}}";

/// Terminal synthesis instruction, used when the budget ends while the
/// model still wants tools.
pub const SYNTHESIS_INSTRUCTION: &str = "\
The run is out of iterations. Stop investigating. Using only the evidence already \
gathered above, produce the best final answer you can: what was established, what was \
changed, and what remains uncertain. Do not request any tools.";

/// System prompt for the scope-narrowing call.
pub const SCOPE_SYSTEM: &str = "\
An agent is about to work on a task inside a workspace with several top-level \
directories. Pick the single directory the task most plausibly lives in, or answer \
\"none\" when the task spans the workspace or the mapping is unclear.";

/// Prefix for messages a run sends to its parent when stuck.
pub const STUCK_NOTE: &str = "Sub-agent made no progress for several iterations";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_nonempty() {
        for template in [SYSTEM_PROMPT, SYNTHESIS_INSTRUCTION, SCOPE_SYSTEM] {
            assert!(!template.trim().is_empty());
        }
    }
}
