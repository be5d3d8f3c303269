//! The `[AssignedGPU:<device>]` breadcrumb kept in a guest's free-text notes.
//!
//! Legacy hosts do not persist which GPU a partition came from, so the
//! assignment is recorded here. The tag is advisory only.

use std::sync::LazyLock;

use regex::Regex;

static ASSIGNMENT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[AssignedGPU:([^\]]+)\]").expect("static pattern"));

pub fn assignment_tag(device: &str) -> String {
    format!("[AssignedGPU:{device}]")
}

/// Replace any existing tags in `notes` with a single tag for `device`.
pub fn apply_assignment_tag(notes: &str, device: &str) -> String {
    let cleaned = strip_assignment_tag(notes);
    format!("{cleaned} {}", assignment_tag(device)).trim().to_string()
}

pub fn strip_assignment_tag(notes: &str) -> String {
    ASSIGNMENT_TAG.replace_all(notes, "").trim().to_string()
}

/// Device recorded by the most recent tag, if any.
pub fn parse_assignment_tag(notes: &str) -> Option<String> {
    ASSIGNMENT_TAG
        .captures_iter(notes)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|d| !d.is_empty())
}
