//! Retention policy of finished load tests.
use std::time::Duration;

use k8s_openapi::chrono::{DateTime, Utc};

use crate::loadtest::{LoadTest, LoadTestPhase};

fn older_than(time: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    now.signed_duration_since(time)
        .to_std()
        .is_ok_and(|age| age > threshold)
}

/// Whether a load test has been kept long enough to be deleted.
///
/// Age is measured from the completion of its job. Errored tests that never completed a
/// job are measured from their creation. A zero threshold keeps every load test.
pub fn should_delete(
    phase: LoadTestPhase,
    completion_time: Option<DateTime<Utc>>,
    creation_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    if threshold.is_zero() || !phase.is_terminal() {
        return false;
    }
    match (completion_time, phase) {
        (Some(completed), _) => older_than(completed, now, threshold),
        (None, LoadTestPhase::Errored) => {
            creation_time.is_some_and(|created| older_than(created, now, threshold))
        }
        (None, _) => false,
    }
}

/// Whether the load test is past retention.
pub fn expired(load_test: &LoadTest, now: DateTime<Utc>, threshold: Duration) -> bool {
    let Some(status) = &load_test.status else {
        return false;
    };
    should_delete(
        status.phase,
        status.job_status.completion_time.as_ref().map(|t| t.0),
        load_test.metadata.creation_timestamp.as_ref().map(|t| t.0),
        now,
        threshold,
    )
}
