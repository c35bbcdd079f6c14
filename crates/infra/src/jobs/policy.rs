//! Execution policy: parallel vs serial jobs, the in-flight flag and retry
//! accounting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use jobmesh_events::job::{PROPERTY_JOB_RETRIES, PROPERTY_JOB_RETRY_COUNT, PROPERTY_JOB_RETRY_DELAY};
use jobmesh_events::{Event, is_parallel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Parallel,
    Serial,
}

impl ExecutionMode {
    pub fn of(job: &Event) -> Self {
        if is_parallel(job) {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Serial
        }
    }
}

/// At most one serial job in flight in this process.
#[derive(Debug, Default)]
pub struct InFlightFlag(AtomicBool);

impl InFlightFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag; `false` if it was already set.
    pub fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A deferred serial item that is alone in the queue would otherwise spin.
pub fn should_back_off(queue_len: usize) -> bool {
    queue_len == 1
}

/// What to do with a job whose attempt just ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Finish,
    Reschedule {
        retries: i64,
        retry_count: i64,
        delay: Option<Duration>,
    },
    /// A reschedule was asked for but the budget is spent.
    Exhausted { retries: i64, retry_count: i64 },
}

impl RetryDecision {
    pub fn reschedules(&self) -> bool {
        matches!(self, RetryDecision::Reschedule { .. })
    }
}

/// Retry accounting for one finished attempt.
///
/// The job's own `event.job.retries` wins over `default_retries`; `-1` means
/// unlimited. The count is bumped on every reschedule request, and a request
/// that pushes it past the budget becomes a normal finish.
pub fn retry_decision(job: &Event, reschedule: bool, default_retries: i64) -> RetryDecision {
    if !reschedule {
        return RetryDecision::Finish;
    }
    let retries = job
        .property(PROPERTY_JOB_RETRIES)
        .and_then(|v| v.as_long())
        .unwrap_or(default_retries);
    let retry_count = job
        .property(PROPERTY_JOB_RETRY_COUNT)
        .and_then(|v| v.as_long())
        .unwrap_or(0)
        .saturating_add(1);

    if retries != -1 && retry_count > retries {
        return RetryDecision::Exhausted { retries, retry_count };
    }
    let delay = job
        .property(PROPERTY_JOB_RETRY_DELAY)
        .and_then(|v| v.as_long())
        .filter(|ms| *ms > 0)
        .map(|ms| Duration::from_millis(ms as u64));
    RetryDecision::Reschedule {
        retries,
        retry_count,
        delay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmesh_events::job::PROPERTY_JOB_PARALLEL;
    use jobmesh_events::job_request;

    #[test]
    fn mode_follows_parallel_flag() {
        assert_eq!(ExecutionMode::of(&job_request("t", "j")), ExecutionMode::Serial);
        let parallel = job_request("t", "j").with_property(PROPERTY_JOB_PARALLEL, true);
        assert_eq!(ExecutionMode::of(&parallel), ExecutionMode::Parallel);
    }

    #[test]
    fn in_flight_flag_admits_one() {
        let flag = InFlightFlag::new();
        assert!(flag.try_acquire());
        assert!(!flag.try_acquire());
        flag.release();
        assert!(flag.try_acquire());
    }

    #[test]
    fn backoff_only_when_alone() {
        assert!(should_back_off(1));
        assert!(!should_back_off(0));
        assert!(!should_back_off(2));
    }

    #[test]
    fn finish_needs_no_accounting() {
        assert_eq!(retry_decision(&job_request("t", "j"), false, 10), RetryDecision::Finish);
    }

    #[test]
    fn reschedule_counts_up_to_the_budget() {
        let job = job_request("t", "j")
            .with_property(PROPERTY_JOB_RETRIES, 2i64)
            .with_property(PROPERTY_JOB_RETRY_COUNT, 1i64);
        assert_eq!(
            retry_decision(&job, true, 10),
            RetryDecision::Reschedule {
                retries: 2,
                retry_count: 2,
                delay: None
            }
        );

        let job = job.with_property(PROPERTY_JOB_RETRY_COUNT, 2i64);
        assert_eq!(
            retry_decision(&job, true, 10),
            RetryDecision::Exhausted {
                retries: 2,
                retry_count: 3
            }
        );
    }

    #[test]
    fn default_budget_and_unlimited() {
        let job = job_request("t", "j").with_property(PROPERTY_JOB_RETRY_COUNT, 10i64);
        assert!(matches!(retry_decision(&job, true, 10), RetryDecision::Exhausted { .. }));
        assert!(retry_decision(&job, true, -1).reschedules());
    }

    #[test]
    fn retry_count_saturates() {
        let job = job_request("t", "j").with_property(PROPERTY_JOB_RETRY_COUNT, i64::MAX);
        assert_eq!(
            retry_decision(&job, true, -1),
            RetryDecision::Reschedule {
                retries: -1,
                retry_count: i64::MAX,
                delay: None
            }
        );
        assert_eq!(
            retry_decision(&job, true, 3),
            RetryDecision::Exhausted {
                retries: 3,
                retry_count: i64::MAX
            }
        );
    }

    #[test]
    fn retry_delay_is_carried() {
        let job = job_request("t", "j").with_property(PROPERTY_JOB_RETRY_DELAY, 250i64);
        let RetryDecision::Reschedule { delay, .. } = retry_decision(&job, true, 10) else {
            panic!("expected reschedule");
        };
        assert_eq!(delay, Some(Duration::from_millis(250)));
    }
}
