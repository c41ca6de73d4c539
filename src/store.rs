use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::GatewayError;
use crate::models::{CollectionRecord, RunCheckpoint, Snapshot, StudentLevelUpdate, TeamStateUpdate};

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Teams with their members and uncounted cards as of `now`, plus the
    /// newest `collections_without_repeat_winners` collection records.
    async fn snapshot(&self, now: DateTime<Utc>, config: &EngineConfig) -> anyhow::Result<Snapshot>;
}

/// Writes issued by a collection run. Every operation must be safe to repeat
/// with the same arguments.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn create_collection_record(&self, record: &CollectionRecord) -> Result<Uuid, GatewayError>;

    /// `run_id` marks the student so a repeated write from the same run is a no-op.
    async fn update_student_level(
        &self,
        run_id: Uuid,
        update: &StudentLevelUpdate,
    ) -> Result<(), GatewayError>;

    async fn update_team_state(&self, run_id: Uuid, update: &TeamStateUpdate) -> Result<(), GatewayError>;

    /// Returns how many cards flipped from uncounted to counted.
    async fn mark_cards_counted(&self, card_ids: &[Uuid]) -> Result<u64, GatewayError>;

    async fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<(), GatewayError>;

    async fn unfinished_checkpoint(&self) -> anyhow::Result<Option<RunCheckpoint>>;
}

/// Mutual exclusion across collection runs. The lock is held until the
/// returned guard is dropped.
#[async_trait]
pub trait RunLock: Send + Sync {
    type Guard: Send;

    /// `Ok(None)` when another run already holds the lock.
    async fn try_lock(&self) -> anyhow::Result<Option<Self::Guard>>;
}
