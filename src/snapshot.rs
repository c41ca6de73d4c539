use std::collections::HashMap;

use chrono::{DateTime, Months, Utc};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::models::{CardAverage, CollectionRecord, Snapshot, StudentSnapshot, TeamSnapshot};

#[derive(Debug, Clone)]
pub struct TeamRow {
    pub id: Uuid,
    pub name: String,
    pub average_cards_per_student: CardAverage,
    pub current_level: u32,
    pub current_winner: Option<Uuid>,
    pub previous_winner: Option<Uuid>,
    pub version: i64,
}

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub id: Uuid,
    pub name: String,
    pub team_id: Uuid,
    pub individual_level: u32,
    pub version: i64,
    pub total_cards: u32,
}

#[derive(Debug, Clone)]
pub struct CardRow {
    pub id: Uuid,
    pub student_id: Uuid,
    pub date_given: DateTime<Utc>,
    pub counted: bool,
}

/// Start of the uncounted window: the latest collection, or the fallback
/// lookback when nothing has been collected yet.
pub fn cutoff_date(
    now: DateTime<Utc>,
    latest_collection: Option<DateTime<Utc>>,
    config: &EngineConfig,
) -> DateTime<Utc> {
    latest_collection.unwrap_or_else(|| {
        now.checked_sub_months(Months::new(config.fallback_lookback_months))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    })
}

pub fn is_uncounted(card: &CardRow, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    !card.counted && card.date_given > cutoff && card.date_given <= now
}

/// Joins raw store rows into the snapshot the engines read. Students whose
/// team is unknown are left out; so are their cards.
pub fn assemble(
    now: DateTime<Utc>,
    cutoff: DateTime<Utc>,
    teams: Vec<TeamRow>,
    students: Vec<StudentRow>,
    cards: impl IntoIterator<Item = CardRow>,
    mut recent_collections: Vec<CollectionRecord>,
) -> Snapshot {
    let mut cards_by_student: HashMap<Uuid, Vec<(DateTime<Utc>, Uuid)>> = HashMap::new();
    for card in cards {
        if is_uncounted(&card, cutoff, now) {
            cards_by_student
                .entry(card.student_id)
                .or_default()
                .push((card.date_given, card.id));
        }
    }

    let mut members_by_team: HashMap<Uuid, Vec<StudentSnapshot>> = HashMap::new();
    for student in students {
        let mut earned = cards_by_student.remove(&student.id).unwrap_or_default();
        earned.sort();
        members_by_team
            .entry(student.team_id)
            .or_default()
            .push(StudentSnapshot {
                id: student.id,
                name: student.name,
                total_cards: student.total_cards,
                individual_level: student.individual_level,
                version: student.version,
                uncounted_card_ids: earned.into_iter().map(|(_, id)| id).collect(),
            });
    }

    let mut teams: Vec<TeamSnapshot> = teams
        .into_iter()
        .map(|team| {
            let mut members = members_by_team.remove(&team.id).unwrap_or_default();
            members.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
            TeamSnapshot {
                id: team.id,
                name: team.name,
                members,
                average_cards_per_student: team.average_cards_per_student,
                current_level: team.current_level,
                current_winner: team.current_winner,
                previous_winner: team.previous_winner,
                version: team.version,
            }
        })
        .collect();
    teams.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

    recent_collections.sort_by(|a, b| b.collection_date.cmp(&a.collection_date));

    Snapshot {
        taken_at: now,
        cutoff,
        teams,
        recent_collections,
    }
}
