//! The Job entity and its lifecycle state machine.
//!
//! A job moves along `Pending → Running → {Completed | Pending (retry) |
//! DeadLetter}`. Retries are resolved by [`Job::record_failure`], which
//! applies exponential backoff (`2^attempts` seconds) until `max_retries`
//! failed attempts have accumulated, then dead-letters the job.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ClientId, JobId};

/// Default ceiling on failed attempts before dead-lettering.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created and waiting to be promoted by the scheduler.
    Pending,
    /// Published to the delivery channel; owned by a worker.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Failed (bookkeeping status for dashboards; the retry machine moves
    /// failed jobs back to `Pending` or on to `DeadLetter` directly).
    Failed,
    /// Exhausted retries. Terminal; requires manual intervention.
    DeadLetter,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::DeadLetter,
    ];

    /// Terminal statuses accept no further mutation.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::DeadLetter)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::DeadLetter => "DEAD_LETTER",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = crate::error::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "DEAD_LETTER" => Ok(Self::DeadLetter),
            other => Err(crate::error::DomainError::InvalidStatus(other.to_string())),
        }
    }
}

/// Kind of work a job performs, used to route execution to a handler.
///
/// Open for extension: unknown kinds round-trip as [`JobKind::Other`] and
/// fail at dispatch time when no handler is registered, rather than at
/// parse time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum JobKind {
    PaymentProcess,
    EmailConfirmation,
    Other(String),
}

impl JobKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::PaymentProcess => "PAYMENT_PROCESS",
            Self::EmailConfirmation => "EMAIL_CONFIRMATION",
            Self::Other(kind) => kind,
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for JobKind {
    fn from(value: &str) -> Self {
        match value {
            "PAYMENT_PROCESS" => Self::PaymentProcess,
            "EMAIL_CONFIRMATION" => Self::EmailConfirmation,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for JobKind {
    fn from(value: String) -> Self {
        JobKind::from(value.as_str())
    }
}

impl From<JobKind> for String {
    fn from(value: JobKind) -> Self {
        value.as_str().to_string()
    }
}

/// Backoff delay before the retry following the given number of failed
/// attempts: `2^attempts` seconds (attempt 1 → 2s, attempt 2 → 4s, ...).
pub fn backoff_delay(attempts: i32) -> Duration {
    let exp = attempts.clamp(0, 30);
    Duration::seconds(1i64 << exp)
}

/// A unit of asynchronous work with a durable lifecycle.
///
/// The job store row is the source of truth for every field here; the
/// cache holds a time-bounded copy and the delivery channel carries only
/// the job id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub client_id: ClientId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Opaque payload, interpreted only by the kind-specific handler.
    pub payload: String,
    /// Failed attempts so far.
    pub attempts: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    /// Next eligible pickup time. Monotone non-decreasing across retries.
    pub scheduled_at: DateTime<Utc>,
    /// Set on any terminal transition.
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job in `Pending`, scheduled for immediate pickup.
    pub fn new(client_id: ClientId, kind: JobKind, payload: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            client_id,
            kind,
            status: JobStatus::Pending,
            payload: payload.into(),
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: now,
            scheduled_at: now,
            completed_at: None,
            error_message: None,
            updated_at: now,
        }
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the scheduler should pick this job up at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    /// Mark the job as published to the delivery channel.
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.updated_at = Utc::now();
    }

    /// Mark the job as successfully completed. Terminal.
    pub fn mark_completed(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Resolve a failed execution attempt.
    ///
    /// Increments `attempts`; while under `max_retries` the job returns to
    /// `Pending` with `scheduled_at` pushed out by [`backoff_delay`], so
    /// the scheduler re-observes it after the backoff window. Once
    /// `attempts` reaches `max_retries` the job is dead-lettered and
    /// `completed_at` stamped.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        let now = Utc::now();
        self.attempts += 1;
        self.error_message = Some(error.into());
        self.updated_at = now;

        if self.attempts < self.max_retries {
            self.status = JobStatus::Pending;
            self.scheduled_at = now + backoff_delay(self.attempts);
        } else {
            self.status = JobStatus::DeadLetter;
            self.completed_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_job() -> Job {
        Job::new(ClientId::from("client-1"), JobKind::PaymentProcess, "order_1|a@b.c|$9.99")
    }

    #[test]
    fn new_job_is_pending_and_immediately_ready() {
        let job = test_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert!(job.is_ready(Utc::now()));
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn successful_lifecycle() {
        let mut job = test_job();
        job.mark_running();
        assert_eq!(job.status, JobStatus::Running);
        assert!(!job.is_ready(Utc::now()));

        job.mark_completed();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.is_terminal());
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(1), Duration::seconds(2));
        assert_eq!(backoff_delay(2), Duration::seconds(4));
        assert_eq!(backoff_delay(3), Duration::seconds(8));
    }

    #[test]
    fn failure_schedules_retry_with_backoff() {
        let mut job = test_job();
        job.mark_running();

        let before = Utc::now();
        job.record_failure("gateway timeout");

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error_message.as_deref(), Some("gateway timeout"));
        assert!(job.scheduled_at >= before + Duration::seconds(2));
        assert!(!job.is_ready(Utc::now()));
    }

    #[test]
    fn third_failure_dead_letters_with_default_retries() {
        let mut job = test_job();

        for _ in 0..2 {
            job.mark_running();
            job.record_failure("boom");
            assert_eq!(job.status, JobStatus::Pending);
        }

        job.mark_running();
        job.record_failure("boom");

        assert_eq!(job.status, JobStatus::DeadLetter);
        assert_eq!(job.attempts, 3);
        assert!(job.completed_at.is_some());
        assert!(job.error_message.is_some());
    }

    #[test]
    fn scheduled_at_never_moves_backwards_across_retries() {
        let mut job = test_job();
        let mut last = job.scheduled_at;
        for _ in 0..3 {
            job.mark_running();
            job.record_failure("boom");
            assert!(job.scheduled_at >= last);
            last = job.scheduled_at;
        }
    }

    #[test]
    fn unknown_kind_round_trips_as_other() {
        let kind = JobKind::from("SMS_NOTIFICATION");
        assert_eq!(kind, JobKind::Other("SMS_NOTIFICATION".to_string()));
        assert_eq!(kind.as_str(), "SMS_NOTIFICATION");
    }

    #[test]
    fn status_parses_its_own_display() {
        for status in JobStatus::ALL {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("DONE".parse::<JobStatus>().is_err());
    }

    proptest! {
        /// A job never dead-letters before accumulating `max_retries`
        /// failed attempts, and always dead-letters exactly at that count.
        #[test]
        fn dead_letter_only_at_max_retries(max_retries in 1i32..8) {
            let mut job = test_job().with_max_retries(max_retries);
            for failure in 1..=max_retries {
                prop_assert!(!job.is_terminal());
                job.mark_running();
                job.record_failure("boom");
                if failure < max_retries {
                    prop_assert_eq!(job.status, JobStatus::Pending);
                    prop_assert!(job.attempts < job.max_retries);
                }
            }
            prop_assert_eq!(job.status, JobStatus::DeadLetter);
            prop_assert_eq!(job.attempts, max_retries);
        }

        /// Backoff for the k-th retry is exactly `2^k` seconds.
        #[test]
        fn backoff_is_exactly_two_to_the_k(k in 1i32..20) {
            prop_assert_eq!(backoff_delay(k).num_seconds(), 1i64 << k);
        }
    }
}
