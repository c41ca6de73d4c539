use std::collections::HashMap;
use std::fmt::Write;

use uuid::Uuid;

use crate::levels;
use crate::models::{CardAverage, CollectionPlan, CollectionRecord};
use crate::snapshot::TeamRow;

#[derive(Debug, Clone, PartialEq)]
pub struct TeamStanding {
    pub name: String,
    pub level: u32,
    pub average_cards_per_student: CardAverage,
    pub current_winner: Option<String>,
}

pub fn team_standings(teams: &[TeamRow], names: &HashMap<Uuid, String>) -> Vec<TeamStanding> {
    let mut standings: Vec<TeamStanding> = teams
        .iter()
        .map(|team| TeamStanding {
            name: team.name.clone(),
            level: team.current_level,
            average_cards_per_student: team.average_cards_per_student,
            current_winner: team.current_winner.map(|id| student_label(names, id)),
        })
        .collect();

    standings.sort_by(|a, b| {
        b.level
            .cmp(&a.level)
            .then(b.average_cards_per_student.cmp(&a.average_cards_per_student))
    });
    standings
}

fn approximate(average: CardAverage) -> f64 {
    *average.numer() as f64 / *average.denom() as f64
}

fn student_label(names: &HashMap<Uuid, String>, id: Uuid) -> String {
    names
        .get(&id)
        .cloned()
        .unwrap_or_else(|| format!("student {id}"))
}

fn write_winner_sections(output: &mut String, record: &CollectionRecord, names: &HashMap<Uuid, String>) {
    let _ = writeln!(output, "## Random Drawing Winners");
    if record.random_drawing_winners.is_empty() {
        let _ = writeln!(output, "No eligible cards for a drawing this collection.");
    } else {
        for (position, id) in record.random_drawing_winners.iter().enumerate() {
            let _ = writeln!(output, "{}. {}", position + 1, student_label(names, *id));
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Personal Level Winners");
    if record.personal_level_winners.is_empty() {
        let _ = writeln!(output, "No students reached a new level.");
    } else {
        for winner in &record.personal_level_winners {
            let _ = writeln!(
                output,
                "- {} reached level {} (was {})",
                winner.name, winner.new_level, winner.previous_level
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## TA Team Level Winners");
    if record.ta_new_level_winners.is_empty() {
        let _ = writeln!(output, "No teams reached a new level.");
    } else {
        for winner in &record.ta_new_level_winners {
            let _ = writeln!(
                output,
                "- {} reached level {} (was {})",
                winner.name, winner.new_level, winner.previous_level
            );
        }
    }
}

pub fn build_report(
    record: &CollectionRecord,
    teams: &[TeamRow],
    names: &HashMap<Uuid, String>,
    levels_per_school_wide_level: u32,
) -> String {
    let standings = team_standings(teams, names);
    let mut output = String::new();

    let _ = writeln!(output, "# PBIS Collection Report");
    let _ = writeln!(
        output,
        "Collected {} cards on {}",
        record.collected_cards_count,
        record.collection_date.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(output);
    write_winner_sections(&mut output, record, names);

    let _ = writeln!(output);
    let _ = writeln!(output, "## TA Team Standings");
    if standings.is_empty() {
        let _ = writeln!(output, "No TA teams configured.");
    } else {
        for standing in &standings {
            let _ = writeln!(
                output,
                "- {}: level {} ({:.1} cards per student), TA winner {}",
                standing.name,
                standing.level,
                approximate(standing.average_cards_per_student),
                standing.current_winner.as_deref().unwrap_or("none")
            );
        }
        if let Some(goal) = levels::school_wide_goal(
            standings.iter().map(|standing| standing.level),
            levels_per_school_wide_level,
        ) {
            let _ = writeln!(output);
            let _ = writeln!(output, "School-wide goal: every team at level {goal}.");
        }
    }

    output
}

/// Text shown for a dry run, before anything is written.
pub fn render_plan(plan: &CollectionPlan, names: &HashMap<Uuid, String>) -> String {
    let summary = plan.summary();
    let mut output = String::new();

    let _ = writeln!(output, "# Collection Preview");
    let _ = writeln!(output, "{summary}");
    if let Some(goal) = summary.school_wide_goal {
        let _ = writeln!(output, "School-wide goal after this run: level {goal}.");
    }
    let _ = writeln!(output);
    write_winner_sections(&mut output, &plan.record, names);

    let rotations: Vec<_> = plan
        .team_updates
        .iter()
        .filter_map(|update| update.rotation)
        .collect();
    if !rotations.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## New TA Winners");
        for rotation in rotations {
            let _ = writeln!(output, "- {}", student_label(names, rotation.current_winner));
        }
    }

    output
}
