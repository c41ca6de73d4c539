use chrono::{DateTime, Utc};
use num_rational::Ratio;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Exact card average. Period averages like 1/3 must add up to whole
/// numbers again so level boundaries are hit exactly.
pub type CardAverage = Ratio<i128>;

#[derive(Debug, Clone)]
pub struct StudentSnapshot {
    pub id: Uuid,
    pub name: String,
    /// Lifetime card count, including the uncounted ones.
    pub total_cards: u32,
    pub individual_level: u32,
    pub version: i64,
    /// Cards earned inside the current collection window.
    pub uncounted_card_ids: Vec<Uuid>,
}

impl StudentSnapshot {
    pub fn uncounted_cards(&self) -> u32 {
        self.uncounted_card_ids.len() as u32
    }
}

#[derive(Debug, Clone)]
pub struct TeamSnapshot {
    pub id: Uuid,
    pub name: String,
    pub members: Vec<StudentSnapshot>,
    /// Running sum of per-collection averages, not a lifetime average.
    pub average_cards_per_student: CardAverage,
    pub current_level: u32,
    pub current_winner: Option<Uuid>,
    pub previous_winner: Option<Uuid>,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalLevelWinner {
    pub student_id: Uuid,
    pub name: String,
    pub previous_level: u32,
    pub new_level: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamLevelWinner {
    pub team_id: Uuid,
    pub name: String,
    pub previous_level: u32,
    pub new_level: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub id: Uuid,
    pub collection_date: DateTime<Utc>,
    pub collected_cards_count: u64,
    pub personal_level_winners: Vec<PersonalLevelWinner>,
    pub ta_new_level_winners: Vec<TeamLevelWinner>,
    /// Student ids in draw order.
    pub random_drawing_winners: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
    pub teams: Vec<TeamSnapshot>,
    /// Newest first.
    pub recent_collections: Vec<CollectionRecord>,
}

impl Snapshot {
    pub fn students(&self) -> impl Iterator<Item = &StudentSnapshot> {
        self.teams.iter().flat_map(|team| team.members.iter())
    }

    pub fn latest_collection_date(&self) -> Option<DateTime<Utc>> {
        self.recent_collections
            .iter()
            .map(|record| record.collection_date)
            .max()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentLevelUpdate {
    pub student_id: Uuid,
    pub new_level: u32,
    pub expected_version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinnerRotation {
    pub current_winner: Uuid,
    pub previous_winner: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamStateUpdate {
    pub team_id: Uuid,
    pub average_cards_per_student: CardAverage,
    pub level: u32,
    /// `None` leaves both winner slots untouched.
    pub rotation: Option<WinnerRotation>,
    pub expected_version: i64,
}

/// Every write a run performs, computed up front so it can be checkpointed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionPlan {
    pub run_id: Uuid,
    pub record: CollectionRecord,
    pub student_levels: Vec<StudentLevelUpdate>,
    pub team_updates: Vec<TeamStateUpdate>,
    pub card_ids: Vec<Uuid>,
    pub school_wide_goal: Option<u32>,
}

impl CollectionPlan {
    pub fn summary(&self) -> CollectionSummary {
        CollectionSummary {
            run_id: self.run_id,
            collection_id: self.record.id,
            winners_count: self.record.random_drawing_winners.len(),
            leveled_students: self.record.personal_level_winners.len(),
            leveled_teams: self.record.ta_new_level_winners.len(),
            rotated_team_winners: self
                .team_updates
                .iter()
                .filter(|update| update.rotation.is_some())
                .count(),
            cards_processed: self.record.collected_cards_count,
            school_wide_goal: self.school_wide_goal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplyStep {
    CreateRecord,
    StudentLevels,
    TeamStates,
    MarkCards,
}

impl ApplyStep {
    pub const ALL: [ApplyStep; 4] = [
        ApplyStep::CreateRecord,
        ApplyStep::StudentLevels,
        ApplyStep::TeamStates,
        ApplyStep::MarkCards,
    ];
}

impl std::fmt::Display for ApplyStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ApplyStep::CreateRecord => "create collection record",
            ApplyStep::StudentLevels => "update student levels",
            ApplyStep::TeamStates => "update team state",
            ApplyStep::MarkCards => "mark cards counted",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub plan: CollectionPlan,
    pub started_at: DateTime<Utc>,
    pub completed_steps: Vec<ApplyStep>,
    pub finished: bool,
    /// Closed by an operator before every step was applied.
    #[serde(default)]
    pub abandoned: bool,
}

impl RunCheckpoint {
    pub fn is_done(&self, step: ApplyStep) -> bool {
        self.completed_steps.contains(&step)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub run_id: Uuid,
    pub collection_id: Uuid,
    pub winners_count: usize,
    pub leveled_students: usize,
    pub leveled_teams: usize,
    pub rotated_team_winners: usize,
    pub cards_processed: u64,
    pub school_wide_goal: Option<u32>,
}

impl std::fmt::Display for CollectionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cards processed, {} drawing winners, {} students and {} teams leveled up",
            self.cards_processed, self.winners_count, self.leveled_students, self.leveled_teams
        )
    }
}
