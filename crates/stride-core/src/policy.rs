use crate::models::MutationKind;

/// Retry decisions for the external synchronizer draining the mutation
/// queue. The queue itself only stores `retry_count`.
#[must_use]
pub fn should_retry(kind: MutationKind, attempt: u32) -> bool {
    let max_attempts = match kind {
        MutationKind::DeleteTask
        | MutationKind::DeleteGoal
        | MutationKind::DeleteIntegration => 8,
        _ => 5,
    };
    attempt < max_attempts
}

/// Deterministic bounded exponential backoff with hashed jitter, seconds.
#[must_use]
pub fn retry_backoff_seconds(kind: MutationKind, attempt: u32, mutation_id: &str) -> i64 {
    let capped_exp = attempt.saturating_sub(1).min(6);
    let base = 1_i64 << capped_exp;
    let max = match kind {
        MutationKind::DeleteTask
        | MutationKind::DeleteGoal
        | MutationKind::DeleteIntegration => 300,
        _ => 60,
    };
    let baseline = base.min(max);
    let jitter_bound = (baseline / 4).max(1);
    let jitter_seed = format!("{}:{attempt}:{mutation_id}", kind.as_str());
    let hash = blake3::hash(jitter_seed.as_bytes());
    let bytes = hash.as_bytes();
    let rand = u16::from_be_bytes([bytes[0], bytes[1]]) as i64;
    let jitter = rand % (jitter_bound + 1);
    (baseline + jitter).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_retry_uses_kind_specific_caps() {
        assert!(should_retry(MutationKind::CreateTask, 4));
        assert!(!should_retry(MutationKind::CreateTask, 5));

        assert!(should_retry(MutationKind::DeleteGoal, 7));
        assert!(!should_retry(MutationKind::DeleteGoal, 8));
    }

    #[test]
    fn backoff_is_deterministic_and_bounded() {
        let a = retry_backoff_seconds(MutationKind::CreateTask, 3, "m-101");
        let b = retry_backoff_seconds(MutationKind::CreateTask, 3, "m-101");
        assert_eq!(a, b);
        assert!(a >= 4);
        assert!(a <= 60);
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let early = retry_backoff_seconds(MutationKind::UpdateTask, 1, "m-1");
        let late = retry_backoff_seconds(MutationKind::UpdateTask, 6, "m-1");
        assert!(late > early);
    }
}
