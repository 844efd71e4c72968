/// Retry Policy (component D).
use crate::model::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    TransientFailure,
}

/// A task succeeds iff every command exited zero and nothing timed out.
/// There is no notion of a fatal exit code — the only way a task becomes
/// `failed` without retrying is a stop request mid-run.
pub fn classify(all_exit_codes_zero: bool, timed_out: bool) -> Outcome {
    if all_exit_codes_zero && !timed_out {
        Outcome::Success
    } else {
        Outcome::TransientFailure
    }
}

/// Whether a backoff sleep is due before the next retry, and for how long.
/// Fires every Nth retry, not the first: `retry_count` 0 itself is the
/// original attempt, so the first post-failure retry is `retry_count == 1`.
pub fn should_backoff(retry_count: u32, policy: &RetryPolicy) -> (bool, u64) {
    if policy.max_retry_before_backoff == 0 {
        return (false, 0);
    }
    if retry_count > 0 && retry_count % policy.max_retry_before_backoff == 0 {
        (true, policy.backoff_duration_secs)
    } else {
        (false, 0)
    }
}
