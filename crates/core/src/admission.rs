//! Which queued tasks get a slot on the next admission pass.

use crate::model::Task;

/// Free agent slots given the configured limit and the tasks already active.
pub fn available_slots(parallel_limit: usize, in_progress: usize) -> usize {
    parallel_limit.saturating_sub(in_progress)
}

/// Orders `queued` by urgency (lowest ordinal first, missing last) and then by
/// arrival (task id), and returns the first `slots` of them.
pub fn plan_admission(mut queued: Vec<Task>, slots: usize) -> Vec<Task> {
    queued.sort_by_key(|t| (t.priority_rank(), t.id));
    queued.truncate(slots);
    queued
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskStatus;

    fn queued(id: i64, priority: Option<i32>) -> Task {
        Task {
            id,
            clickup_task_id: format!("cu-{id}"),
            clickup_list_id: None,
            name: format!("task {id}"),
            description: None,
            priority,
            status: TaskStatus::Queued,
            worktree_path: None,
            branch_name: None,
            time_spent_ms: 0,
            started_at_ms: None,
            completed_at_ms: None,
            created_at_ms: id,
            updated_at_ms: id,
        }
    }

    #[test]
    fn urgent_first_then_arrival() {
        let plan = plan_admission(
            vec![queued(1, Some(3)), queued(2, None), queued(3, Some(1)), queued(4, Some(3))],
            3,
        );
        let ids: Vec<i64> = plan.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![3, 1, 4]);
    }

    #[test]
    fn no_slots_no_admission() {
        assert_eq!(available_slots(1, 1), 0);
        assert_eq!(available_slots(2, 5), 0);
        assert_eq!(available_slots(3, 1), 2);
        assert!(plan_admission(vec![queued(1, Some(1))], 0).is_empty());
    }
}
