use std::sync::{Arc, Mutex};

use crate::error::StrideError;

const MAX_SAMPLES: usize = 16;

/// Bounded sample of swallowed durable-cache failures. The cache is
/// best-effort by contract, so these never reach the user; they surface
/// only through `SyncEngine::diagnostics`.
#[derive(Clone, Default)]
pub struct DegradedOps {
    samples: Arc<Mutex<Vec<String>>>,
}

impl std::fmt::Debug for DegradedOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DegradedOps").finish_non_exhaustive()
    }
}

impl DegradedOps {
    pub fn record(&self, operation: &str, err: &StrideError) {
        if let Ok(mut samples) = self.samples.lock() {
            if samples.len() < MAX_SAMPLES {
                samples.push(format!("{operation}: {err}"));
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.samples
            .lock()
            .map(|samples| samples.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_bounded() {
        let ops = DegradedOps::default();
        for i in 0..40 {
            ops.record(
                "put",
                &StrideError::StorageUnavailable(format!("backend gone {i}")),
            );
        }
        assert_eq!(ops.snapshot().len(), MAX_SAMPLES);
        assert!(ops.snapshot()[0].starts_with("put:"));
    }
}
