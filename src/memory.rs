//! In-memory store used by the orchestrator tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::GatewayError;
use crate::models::{
    CardAverage, CollectionRecord, RunCheckpoint, Snapshot, StudentLevelUpdate, TeamStateUpdate,
};
use crate::snapshot::{self, CardRow, StudentRow, TeamRow};
use crate::store::{PersistenceGateway, RunLock, SnapshotSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Snapshot,
    CreateRecord,
    SaveCheckpoint,
    /// Fails the mark call made after `after_calls` successful ones.
    MarkCards { after_calls: usize },
}

#[derive(Debug, Clone)]
pub struct MemoryStudent {
    pub id: Uuid,
    pub name: String,
    pub team_id: Uuid,
    pub individual_level: u32,
    pub version: i64,
    pub last_collection_id: Option<Uuid>,
}

#[derive(Default)]
struct MemoryState {
    teams: Vec<TeamRow>,
    team_runs: HashMap<Uuid, Uuid>,
    students: Vec<MemoryStudent>,
    cards: Vec<CardRow>,
    collections: Vec<CollectionRecord>,
    checkpoint: Option<RunCheckpoint>,
    fail: Option<FailPoint>,
    mark_calls: Vec<usize>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    locked: Arc<AtomicBool>,
}

pub struct MemoryGuard(Arc<AtomicBool>);

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    pub fn add_team(&self, name: &str, average: i128, level: u32) -> Uuid {
        let id = Uuid::new_v4();
        self.state().teams.push(TeamRow {
            id,
            name: name.to_string(),
            average_cards_per_student: CardAverage::from_integer(average),
            current_level: level,
            current_winner: None,
            previous_winner: None,
            version: 1,
        });
        id
    }

    pub fn add_student(&self, team_id: Uuid, name: &str, level: u32) -> Uuid {
        let id = Uuid::new_v4();
        self.state().students.push(MemoryStudent {
            id,
            name: name.to_string(),
            team_id,
            individual_level: level,
            version: 1,
            last_collection_id: None,
        });
        id
    }

    pub fn give_cards(&self, student_id: Uuid, count: usize, date_given: DateTime<Utc>) {
        let mut state = self.state();
        for _ in 0..count {
            state.cards.push(CardRow {
                id: Uuid::new_v4(),
                student_id,
                date_given,
                counted: false,
            });
        }
    }

    pub fn fail_once(&self, point: FailPoint) {
        self.state().fail = Some(point);
    }

    pub fn set_team_winners(&self, team_id: Uuid, current: Option<Uuid>, previous: Option<Uuid>) {
        if let Some(team) = self.state().teams.iter_mut().find(|team| team.id == team_id) {
            team.current_winner = current;
            team.previous_winner = previous;
        }
    }

    pub fn checkpoint(&self) -> Option<RunCheckpoint> {
        self.state().checkpoint.clone()
    }

    pub fn bump_student_version(&self, student_id: Uuid) {
        if let Some(student) = self.state().students.iter_mut().find(|s| s.id == student_id) {
            student.version += 1;
        }
    }

    pub fn student(&self, id: Uuid) -> MemoryStudent {
        self.state()
            .students
            .iter()
            .find(|student| student.id == id)
            .cloned()
            .unwrap()
    }

    pub fn team(&self, id: Uuid) -> TeamRow {
        self.state()
            .teams
            .iter()
            .find(|team| team.id == id)
            .cloned()
            .unwrap()
    }

    pub fn collections(&self) -> Vec<CollectionRecord> {
        self.state().collections.clone()
    }

    pub fn uncounted_card_count(&self) -> usize {
        self.state().cards.iter().filter(|card| !card.counted).count()
    }

    pub fn mark_calls(&self) -> Vec<usize> {
        self.state().mark_calls.clone()
    }

    pub fn unfinished(&self) -> Option<RunCheckpoint> {
        self.state().checkpoint.clone().filter(|checkpoint| !checkpoint.finished)
    }

    fn trip(&self, point: FailPoint) -> bool {
        let mut state = self.state();
        if state.fail == Some(point) {
            state.fail = None;
            return true;
        }
        false
    }
}

#[async_trait]
impl SnapshotSource for InMemoryStore {
    async fn snapshot(&self, now: DateTime<Utc>, config: &EngineConfig) -> anyhow::Result<Snapshot> {
        if self.trip(FailPoint::Snapshot) {
            anyhow::bail!("store offline");
        }
        let state = self.state();
        let latest = state.collections.iter().map(|record| record.collection_date).max();
        let cutoff = snapshot::cutoff_date(now, latest, config);

        let students = state
            .students
            .iter()
            .map(|student| StudentRow {
                id: student.id,
                name: student.name.clone(),
                team_id: student.team_id,
                individual_level: student.individual_level,
                version: student.version,
                total_cards: state
                    .cards
                    .iter()
                    .filter(|card| card.student_id == student.id && card.date_given <= now)
                    .count() as u32,
            })
            .collect();

        let mut recent = state.collections.clone();
        recent.sort_by(|a, b| b.collection_date.cmp(&a.collection_date));
        recent.truncate(config.collections_without_repeat_winners);

        Ok(snapshot::assemble(
            now,
            cutoff,
            state.teams.clone(),
            students,
            state.cards.clone(),
            recent,
        ))
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryStore {
    async fn create_collection_record(&self, record: &CollectionRecord) -> Result<Uuid, GatewayError> {
        if self.trip(FailPoint::CreateRecord) {
            return Err(anyhow::anyhow!("insert rejected").into());
        }
        let mut state = self.state();
        if !state.collections.iter().any(|existing| existing.id == record.id) {
            state.collections.push(record.clone());
        }
        Ok(record.id)
    }

    async fn update_student_level(
        &self,
        run_id: Uuid,
        update: &StudentLevelUpdate,
    ) -> Result<(), GatewayError> {
        let mut state = self.state();
        let student = state
            .students
            .iter_mut()
            .find(|student| student.id == update.student_id)
            .ok_or_else(|| anyhow::anyhow!("unknown student {}", update.student_id))?;
        if student.last_collection_id == Some(run_id) {
            return Ok(());
        }
        if student.version != update.expected_version {
            return Err(GatewayError::Stale {
                entity: "student",
                id: student.id,
            });
        }
        student.individual_level = student.individual_level.max(update.new_level);
        student.version += 1;
        student.last_collection_id = Some(run_id);
        Ok(())
    }

    async fn update_team_state(&self, run_id: Uuid, update: &TeamStateUpdate) -> Result<(), GatewayError> {
        let mut state = self.state();
        if state.team_runs.get(&update.team_id) == Some(&run_id) {
            return Ok(());
        }
        let team = state
            .teams
            .iter_mut()
            .find(|team| team.id == update.team_id)
            .ok_or_else(|| anyhow::anyhow!("unknown team {}", update.team_id))?;
        if team.version != update.expected_version {
            return Err(GatewayError::Stale {
                entity: "team",
                id: team.id,
            });
        }
        team.average_cards_per_student = update.average_cards_per_student;
        team.current_level = update.level;
        if let Some(rotation) = update.rotation {
            team.current_winner = Some(rotation.current_winner);
            team.previous_winner = rotation.previous_winner;
        }
        team.version += 1;
        state.team_runs.insert(update.team_id, run_id);
        Ok(())
    }

    async fn mark_cards_counted(&self, card_ids: &[Uuid]) -> Result<u64, GatewayError> {
        let mut state = self.state();
        if let Some(FailPoint::MarkCards { after_calls }) = state.fail {
            if state.mark_calls.len() == after_calls {
                state.fail = None;
                return Err(anyhow::anyhow!("request too large").into());
            }
        }
        let mut flipped = 0;
        for card in state.cards.iter_mut() {
            if !card.counted && card_ids.contains(&card.id) {
                card.counted = true;
                flipped += 1;
            }
        }
        state.mark_calls.push(card_ids.len());
        Ok(flipped)
    }

    async fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<(), GatewayError> {
        if self.trip(FailPoint::SaveCheckpoint) {
            return Err(anyhow::anyhow!("checkpoint write timed out").into());
        }
        self.state().checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    async fn unfinished_checkpoint(&self) -> anyhow::Result<Option<RunCheckpoint>> {
        Ok(self.unfinished())
    }
}

#[async_trait]
impl RunLock for InMemoryStore {
    type Guard = MemoryGuard;

    async fn try_lock(&self) -> anyhow::Result<Option<Self::Guard>> {
        let acquired = self
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        Ok(acquired.then(|| MemoryGuard(Arc::clone(&self.locked))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[tokio::test]
    async fn marking_twice_is_a_no_op() {
        let now = Utc.with_ymd_and_hms(2026, 3, 6, 15, 0, 0).unwrap();
        let config = EngineConfig::default();
        let store = InMemoryStore::new();
        let team = store.add_team("Rivera TA", 0, 0);
        let student = store.add_student(team, "Avery Lee", 0);
        store.give_cards(student, 3, now - Duration::days(1));

        let snapshot = store.snapshot(now, &config).await.unwrap();
        let ids = snapshot.teams[0].members[0].uncounted_card_ids.clone();
        assert_eq!(ids.len(), 3);

        assert_eq!(store.mark_cards_counted(&ids).await.unwrap(), 3);
        assert_eq!(store.mark_cards_counted(&ids).await.unwrap(), 0);

        let snapshot = store.snapshot(now, &config).await.unwrap();
        assert_eq!(snapshot.teams[0].members[0].uncounted_cards(), 0);
        assert_eq!(snapshot.teams[0].members[0].total_cards, 3);
    }
}
