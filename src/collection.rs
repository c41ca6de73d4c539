use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{CollectionError, GatewayError};
use crate::levels;
use crate::lottery;
use crate::models::{
    ApplyStep, CollectionPlan, CollectionRecord, CollectionSummary, RunCheckpoint, Snapshot,
    StudentLevelUpdate, TeamStateUpdate, WinnerRotation,
};
use crate::store::{PersistenceGateway, RunLock, SnapshotSource};

/// Computes every write of a run from a snapshot. Pure apart from `rng`.
pub fn build_plan<R: Rng + ?Sized>(
    snapshot: &Snapshot,
    config: &EngineConfig,
    rng: &mut R,
) -> CollectionPlan {
    let versions: HashMap<Uuid, i64> = snapshot
        .students()
        .map(|student| (student.id, student.version))
        .collect();

    let personal_level_winners =
        levels::personal_level_winners(snapshot.students(), &config.personal_level_thresholds);
    let student_levels = personal_level_winners
        .iter()
        .map(|winner| StudentLevelUpdate {
            student_id: winner.student_id,
            new_level: winner.new_level,
            expected_version: versions.get(&winner.student_id).copied().unwrap_or_default(),
        })
        .collect();

    let mut ta_new_level_winners = Vec::new();
    let mut team_updates = Vec::with_capacity(snapshot.teams.len());
    for team in &snapshot.teams {
        let progress = levels::team_progress(team, config.team_level_divisor);
        if let Some(winner) = levels::team_level_winner(team, &progress) {
            ta_new_level_winners.push(winner);
        }
        let rotation = lottery::draw_team_winner(team, rng).map(|winner| WinnerRotation {
            current_winner: winner,
            previous_winner: team.current_winner,
        });
        team_updates.push(TeamStateUpdate {
            team_id: team.id,
            average_cards_per_student: progress.cumulative_average,
            level: progress.new_level,
            rotation,
            expected_version: team.version,
        });
    }
    let school_wide_goal = levels::school_wide_goal(
        team_updates.iter().map(|update| update.level),
        config.levels_per_school_wide_level,
    );

    let excluded = lottery::excluded_winners(
        &snapshot.recent_collections,
        config.collections_without_repeat_winners,
    );
    let tickets = lottery::ticket_pool(snapshot.students(), &excluded);
    let random_drawing_winners = lottery::draw_winners(tickets, config.weekly_winner_count, rng);

    let card_ids: Vec<Uuid> = snapshot
        .students()
        .flat_map(|student| student.uncounted_card_ids.iter().copied())
        .collect();

    CollectionPlan {
        run_id: Uuid::new_v4(),
        record: CollectionRecord {
            id: Uuid::new_v4(),
            collection_date: snapshot.taken_at,
            collected_cards_count: card_ids.len() as u64,
            personal_level_winners,
            ta_new_level_winners,
            random_drawing_winners,
        },
        student_levels,
        team_updates,
        card_ids,
        school_wide_goal,
    }
}

/// Runs collections against a store, one at a time, checkpointing after
/// every step so an interrupted run can be resumed.
pub struct Collector<S> {
    store: S,
    config: EngineConfig,
}

impl<S> Collector<S>
where
    S: SnapshotSource + PersistenceGateway + RunLock,
{
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Builds the plan a run would apply without locking or writing anything.
    pub async fn preview(&self, now: DateTime<Utc>) -> Result<CollectionPlan, CollectionError> {
        let snapshot = self.load_snapshot(now).await?;
        let mut rng = StdRng::from_entropy();
        Ok(build_plan(&snapshot, &self.config, &mut rng))
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<CollectionSummary, CollectionError> {
        let mut rng = StdRng::from_entropy();
        self.run_with_rng(now, &mut rng).await
    }

    pub async fn run_with_rng<R: Rng + Send>(
        &self,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<CollectionSummary, CollectionError> {
        let _guard = self.lock().await?;

        if let Some(pending) = self
            .store
            .unfinished_checkpoint()
            .await
            .map_err(CollectionError::SnapshotUnavailable)?
        {
            return Err(CollectionError::UnfinishedRun {
                run_id: pending.plan.run_id,
            });
        }

        let snapshot = self.load_snapshot(now).await?;
        if now <= snapshot.cutoff {
            return Err(CollectionError::NonMonotonicDate {
                now,
                latest: snapshot.cutoff,
            });
        }

        let plan = build_plan(&snapshot, &self.config, rng);
        info!(
            run_id = %plan.run_id,
            cards = plan.record.collected_cards_count,
            drawing_winners = plan.record.random_drawing_winners.len(),
            leveled_students = plan.student_levels.len(),
            leveled_teams = plan.record.ta_new_level_winners.len(),
            "collection plan built"
        );

        let mut checkpoint = RunCheckpoint {
            plan,
            started_at: now,
            completed_steps: Vec::new(),
            finished: false,
            abandoned: false,
        };
        if let Err(source) = self.store.save_checkpoint(&checkpoint).await {
            warn!(run_id = %checkpoint.plan.run_id, error = %source, "initial checkpoint save failed");
            return Err(CollectionError::CheckpointUnavailable(source));
        }

        self.apply(&mut checkpoint).await
    }

    /// Finishes the unfinished run left by an earlier failure.
    pub async fn resume(&self) -> Result<CollectionSummary, CollectionError> {
        let _guard = self.lock().await?;

        let mut checkpoint = self
            .store
            .unfinished_checkpoint()
            .await
            .map_err(CollectionError::SnapshotUnavailable)?
            .ok_or(CollectionError::NothingToResume)?;
        info!(
            run_id = %checkpoint.plan.run_id,
            completed = checkpoint.completed_steps.len(),
            "resuming collection run"
        );

        self.apply(&mut checkpoint).await
    }

    /// Closes an unfinished run that cannot be resumed, keeping the steps it
    /// already applied. Its cards stay uncounted for the next run.
    pub async fn abandon(&self) -> Result<Uuid, CollectionError> {
        let _guard = self.lock().await?;

        let mut checkpoint = self
            .store
            .unfinished_checkpoint()
            .await
            .map_err(CollectionError::SnapshotUnavailable)?
            .ok_or(CollectionError::NothingToResume)?;
        let run_id = checkpoint.plan.run_id;
        if checkpoint.is_done(ApplyStep::MarkCards) {
            return Err(CollectionError::AbandonAfterMarking { run_id });
        }

        checkpoint.finished = true;
        checkpoint.abandoned = true;
        self.store
            .save_checkpoint(&checkpoint)
            .await
            .map_err(CollectionError::CheckpointUnavailable)?;
        warn!(
            %run_id,
            completed = checkpoint.completed_steps.len(),
            "collection run abandoned"
        );
        Ok(run_id)
    }

    async fn lock(&self) -> Result<S::Guard, CollectionError> {
        match self.store.try_lock().await {
            Ok(Some(guard)) => {
                debug!("collection lock acquired");
                Ok(guard)
            }
            Ok(None) => Err(CollectionError::ConcurrentRunConflict),
            Err(error) => Err(CollectionError::LockUnavailable(error)),
        }
    }

    async fn load_snapshot(&self, now: DateTime<Utc>) -> Result<Snapshot, CollectionError> {
        let snapshot = self
            .store
            .snapshot(now, &self.config)
            .await
            .map_err(CollectionError::SnapshotUnavailable)?;
        debug!(
            teams = snapshot.teams.len(),
            history = snapshot.recent_collections.len(),
            cutoff = %snapshot.cutoff,
            "snapshot loaded"
        );
        Ok(snapshot)
    }

    async fn apply(&self, checkpoint: &mut RunCheckpoint) -> Result<CollectionSummary, CollectionError> {
        for step in ApplyStep::ALL {
            if checkpoint.is_done(step) {
                debug!(%step, "step already applied");
                continue;
            }

            if let Err(source) = self.apply_step(&checkpoint.plan, step).await {
                warn!(run_id = %checkpoint.plan.run_id, %step, error = %source, "collection step failed");
                return Err(partial_failure(checkpoint, step, source));
            }

            checkpoint.completed_steps.push(step);
            checkpoint.finished = checkpoint.completed_steps.len() == ApplyStep::ALL.len();
            if let Err(source) = self.store.save_checkpoint(checkpoint).await {
                checkpoint.completed_steps.pop();
                checkpoint.finished = false;
                warn!(run_id = %checkpoint.plan.run_id, %step, error = %source, "checkpoint save failed");
                return Err(partial_failure(checkpoint, step, source));
            }
            info!(run_id = %checkpoint.plan.run_id, %step, "collection step applied");
        }

        let summary = checkpoint.plan.summary();
        info!(run_id = %summary.run_id, "{summary}");
        Ok(summary)
    }

    async fn apply_step(&self, plan: &CollectionPlan, step: ApplyStep) -> Result<(), GatewayError> {
        match step {
            ApplyStep::CreateRecord => {
                self.store.create_collection_record(&plan.record).await?;
            }
            ApplyStep::StudentLevels => {
                for update in &plan.student_levels {
                    self.store.update_student_level(plan.run_id, update).await?;
                }
            }
            ApplyStep::TeamStates => {
                for update in &plan.team_updates {
                    self.store.update_team_state(plan.run_id, update).await?;
                }
            }
            ApplyStep::MarkCards => {
                let mut marked = 0;
                for batch in plan.card_ids.chunks(self.config.mark_batch_size.max(1)) {
                    marked += self.store.mark_cards_counted(batch).await?;
                }
                debug!(marked, planned = plan.card_ids.len(), "cards marked counted");
            }
        }
        Ok(())
    }
}

fn partial_failure(checkpoint: &RunCheckpoint, failed_step: ApplyStep, source: GatewayError) -> CollectionError {
    CollectionError::PartialApplyFailure {
        run_id: checkpoint.plan.run_id,
        completed: checkpoint.completed_steps.clone(),
        failed_step,
        summary: checkpoint.plan.summary(),
        source,
    }
}
