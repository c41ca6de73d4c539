use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{ApplyStep, CollectionSummary};

/// Failure of a single write against the store.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{entity} {id} changed since the snapshot was taken")]
    Stale { entity: &'static str, id: Uuid },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("could not read the collection snapshot")]
    SnapshotUnavailable(#[source] anyhow::Error),

    #[error("a collection run is already in progress")]
    ConcurrentRunConflict,

    #[error("could not acquire the collection lock")]
    LockUnavailable(#[source] anyhow::Error),

    #[error("run {run_id} did not finish; resume it before starting a new collection")]
    UnfinishedRun { run_id: Uuid },

    #[error("no unfinished collection run to resume")]
    NothingToResume,

    #[error("could not record the start of the collection run")]
    CheckpointUnavailable(#[source] GatewayError),

    #[error("run {run_id} already marked its cards counted; resume it instead of abandoning")]
    AbandonAfterMarking { run_id: Uuid },

    #[error("collection date {now} is not after the latest collection at {latest}")]
    NonMonotonicDate {
        now: DateTime<Utc>,
        latest: DateTime<Utc>,
    },

    #[error(
        "run {run_id} failed at step '{failed_step}' after completing {}",
        describe_steps(.completed)
    )]
    PartialApplyFailure {
        run_id: Uuid,
        completed: Vec<ApplyStep>,
        failed_step: ApplyStep,
        summary: CollectionSummary,
        #[source]
        source: GatewayError,
    },
}

impl CollectionError {
    /// Whether the same call can simply be issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollectionError::SnapshotUnavailable(_)
                | CollectionError::ConcurrentRunConflict
                | CollectionError::LockUnavailable(_)
                | CollectionError::CheckpointUnavailable(_)
        )
    }
}

fn describe_steps(steps: &[ApplyStep]) -> String {
    if steps.is_empty() {
        return "no steps".to_string();
    }
    steps
        .iter()
        .map(|step| step.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
