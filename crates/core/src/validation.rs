//! Guards for user-driven task transitions and user-supplied names.

use thiserror::Error;

use crate::model::TaskStatus;

/// Task actions a user can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    Stop,
    Restart,
    Complete,
    Delete,
}

/// A rejected transition; the text is shown to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Task is not in progress")]
    NotInProgress,
    #[error("Task must be stopped or failed to restart (current status: {0})")]
    NotRestartable(TaskStatus),
    #[error("Task is already completed")]
    AlreadyCompleted,
    #[error("Cannot delete a task that is in progress; stop it first")]
    DeleteWhileActive,
    #[error("Cannot delete a queued task; wait for admission or stop it first")]
    DeleteWhileQueued,
}

/// Checks whether `action` may be applied to a task in `status`.
pub fn check_transition(status: TaskStatus, action: TaskAction) -> Result<(), TransitionError> {
    use TaskStatus::*;
    match (action, status) {
        (TaskAction::Stop, InProgress) => Ok(()),
        (TaskAction::Stop, _) => Err(TransitionError::NotInProgress),
        (TaskAction::Restart, Stopped | Failed) => Ok(()),
        (TaskAction::Restart, other) => Err(TransitionError::NotRestartable(other)),
        (TaskAction::Complete, Completed) => Err(TransitionError::AlreadyCompleted),
        (TaskAction::Complete, _) => Ok(()),
        (TaskAction::Delete, Stopped | Failed | Completed) => Ok(()),
        (TaskAction::Delete, InProgress) => Err(TransitionError::DeleteWhileActive),
        (TaskAction::Delete, Queued) => Err(TransitionError::DeleteWhileQueued),
    }
}

/// Status a process exit moves an `in_progress` task to.
pub fn status_after_exit(exit_code: i32, killed: bool) -> TaskStatus {
    if killed {
        TaskStatus::Stopped
    } else if exit_code == 0 {
        TaskStatus::Completed
    } else {
        TaskStatus::Failed
    }
}

/// Rejected branch name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid branch name '{name}': {reason}")]
pub struct BranchNameError {
    pub name: String,
    pub reason: &'static str,
}

/// Validates a branch name against the rules of `git check-ref-format --branch`.
pub fn validate_branch_name(name: &str) -> Result<(), BranchNameError> {
    let fail = |reason| {
        Err(BranchNameError {
            name: name.to_string(),
            reason,
        })
    };
    if name.is_empty() {
        return fail("name is empty");
    }
    if name.starts_with('-') {
        return fail("name cannot start with '-'");
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return fail("misplaced '/'");
    }
    if name.ends_with('.') || name.ends_with(".lock") {
        return fail("name cannot end with '.' or '.lock'");
    }
    if name.contains("..") || name.contains("@{") || name == "@" {
        return fail("name contains a forbidden sequence");
    }
    if name
        .chars()
        .any(|c| c.is_ascii_control() || " ~^:?*[\\".contains(c))
    {
        return fail("name contains a forbidden character");
    }
    if name.split('/').any(|part| part.starts_with('.')) {
        return fail("path components cannot start with '.'");
    }
    Ok(())
}

/// Prefix every project marker file must carry.
pub const MARKER_PREFIX: &str = ".clickup-orchestrator-path-";

/// Marker filenames must carry our prefix and be a bare file name.
pub fn validate_marker_filename(marker: &str) -> Result<(), &'static str> {
    if !marker.starts_with(MARKER_PREFIX) {
        return Err("Invalid marker filename");
    }
    if marker.contains('/') || marker.contains('\\') || marker.contains("..") {
        return Err("Invalid marker filename");
    }
    Ok(())
}

/// Lowercased, filesystem and ref safe component derived from a task name.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed: String = out.trim_matches('-').chars().take(40).collect();
    let trimmed = trimmed.trim_end_matches('-').to_string();
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs() {
        assert_eq!(slugify("Fix Login Page!"), "fix-login-page");
        assert_eq!(slugify("  ??? "), "task");
        assert_eq!(slugify("a__b--c"), "a__b-c");
        assert!(slugify(&"x".repeat(100)).len() <= 40);
    }

    #[test]
    fn markers() {
        assert!(validate_marker_filename(".clickup-orchestrator-path-abc").is_ok());
        assert!(validate_marker_filename(".bashrc").is_err());
        assert!(validate_marker_filename(".clickup-orchestrator-path-../x").is_err());
    }
}
