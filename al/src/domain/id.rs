//! Run ID generation
//!
//! IDs read `{kind}_{slug}_{suffix}`: the kind, an underscore slug of the
//! title (capped), and an 8-hex uniqueness suffix taken from the random
//! tail of a v7 UUID. Example: `agent_find_class_foo_9c41d27b`.

/// Longest slug carried in an ID.
const MAX_SLUG_CHARS: usize = 40;

/// Hex digits of uniqueness suffix.
const SUFFIX_CHARS: usize = 8;

/// Generate an ID from kind and title.
pub fn generate_id(kind: &str, title: &str) -> String {
    let hex = uuid::Uuid::now_v7().simple().to_string();
    let suffix = &hex[hex.len() - SUFFIX_CHARS..];
    format!("{kind}_{}_{suffix}", slug_of(title))
}

/// Generate an agent id from the task text.
pub fn agent_id(task: &str) -> String {
    generate_id("agent", task)
}

/// Generate a subtask correlation id.
pub fn subtask_id(task: &str) -> String {
    generate_id("subtask", task)
}

/// Lowercased underscore slug of `title`, at most [`MAX_SLUG_CHARS`] long.
/// Runs of non-alphanumeric characters become a single underscore; an empty
/// result falls back to `task`.
fn slug_of(title: &str) -> String {
    let mut slug = String::new();
    let mut pending_gap = false;

    for c in title.chars() {
        if slug.len() >= MAX_SLUG_CHARS {
            break;
        }
        if c.is_alphanumeric() {
            if pending_gap && !slug.is_empty() {
                slug.push('_');
            }
            pending_gap = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_gap = true;
        }
    }

    if slug.is_empty() {
        slug.push_str("task");
    }
    slug
}
