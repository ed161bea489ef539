use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

/// The status of a `JobRecord`. Transitions are restricted to
/// (none)->Pending, Pending->Running, Running->{Succeeded,Failed}.
///
/// Stored as plain text (`PENDING`/`RUNNING`/`SUCCEEDED`/`FAILED`) on both
/// backends via `as_str`/`parse` rather than a `sqlx::Type` derive, since
/// SQLite has no native enum type and we bind/read this column with
/// runtime-checked queries rather than the `query!` macros.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(JobStatus::Pending),
            "RUNNING" => Some(JobStatus::Running),
            "SUCCEEDED" => Some(JobStatus::Succeeded),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// A terminal status accepted by `Finish`. Anything else is a validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Succeeded,
    Failed,
}

impl From<TerminalStatus> for JobStatus {
    fn from(value: TerminalStatus) -> Self {
        match value {
            TerminalStatus::Succeeded => JobStatus::Succeeded,
            TerminalStatus::Failed => JobStatus::Failed,
        }
    }
}

/// The triple that identifies a logical job for deduplication purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Triple {
    pub repository: String,
    pub commit: String,
    pub query: String,
}

/// Input to `Engine::enqueue` - only the identifying triple is populated by
/// the caller; everything else is assigned by the engine.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub repository: String,
    pub commit: String,
    pub query: String,
}

/// The canonical entity manipulated by the engine. See SPEC_FULL.md §3 for
/// the invariants this type's fields must jointly satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: Uuid,
    pub repository: String,
    pub commit: String,
    pub query: String,
    pub status: JobStatus,
    pub worker: Option<String>,
    pub queue_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub result_url: Option<String>,
    pub result_error: Option<String>,
}

impl JobRecord {
    pub fn new_pending(triple: Triple, now: DateTime<Utc>) -> Self {
        JobRecord {
            id: Uuid::new_v4(),
            repository: triple.repository,
            commit: triple.commit,
            query: triple.query,
            status: JobStatus::Pending,
            worker: None,
            queue_time: now,
            start_time: None,
            finish_time: None,
            result_url: None,
            result_error: None,
        }
    }

    pub fn triple(&self) -> Triple {
        Triple {
            repository: self.repository.clone(),
            commit: self.commit.clone(),
            query: self.query.clone(),
        }
    }
}

/// Formats a timestamp so that byte-wise string comparison agrees with
/// chronological comparison: fixed-width microsecond fraction, UTC, `Z`
/// suffix. `chrono`'s default `to_rfc3339()` omits the fraction entirely
/// when it's zero, which would break `ORDER BY queue_time` on the stored
/// text column.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_roundtrips_and_sorts_lexically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1);

        let fa = format_timestamp(&a);
        let fb = format_timestamp(&b);

        assert!(fa < fb, "expected {fa} < {fb}");
        assert_eq!(parse_timestamp(&fa).unwrap(), a);
        assert_eq!(parse_timestamp(&fb).unwrap(), b);
    }
}
