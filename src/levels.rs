use crate::models::{
    CardAverage, PersonalLevelWinner, StudentSnapshot, TeamLevelWinner, TeamSnapshot,
};

/// Number of thresholds at or below `total_cards`. Thresholds must be ascending.
pub fn personal_level(thresholds: &[u32], total_cards: u32) -> u32 {
    thresholds.partition_point(|&threshold| threshold <= total_cards) as u32
}

/// Students whose computed level is above the stored one, with the new level.
pub fn personal_level_winners<'a>(
    students: impl IntoIterator<Item = &'a StudentSnapshot>,
    thresholds: &[u32],
) -> Vec<PersonalLevelWinner> {
    students
        .into_iter()
        .filter_map(|student| {
            let new_level = personal_level(thresholds, student.total_cards);
            (new_level > student.individual_level).then(|| PersonalLevelWinner {
                student_id: student.id,
                name: student.name.clone(),
                previous_level: student.individual_level,
                new_level,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct TeamProgress {
    pub member_count: usize,
    pub period_cards: u64,
    pub period_average: CardAverage,
    pub cumulative_average: CardAverage,
    pub previous_level: u32,
    pub new_level: u32,
}

impl TeamProgress {
    pub fn is_new_level(&self) -> bool {
        self.new_level > self.previous_level
    }
}

/// Adds this period's per-member average to the team's running total and
/// derives the level from it.
pub fn team_progress(team: &TeamSnapshot, divisor: u32) -> TeamProgress {
    let member_count = team.members.len();
    let period_cards: u64 = team
        .members
        .iter()
        .map(|member| u64::from(member.uncounted_cards()))
        .sum();
    let period_average = if member_count == 0 {
        CardAverage::from_integer(0)
    } else {
        CardAverage::new(i128::from(period_cards), member_count as i128)
    };
    let cumulative_average = team.average_cards_per_student + period_average;
    let new_level = team_level(cumulative_average, divisor);

    TeamProgress {
        member_count,
        period_cards,
        period_average,
        cumulative_average,
        previous_level: team.current_level,
        new_level,
    }
}

pub fn team_level(cumulative_average: CardAverage, divisor: u32) -> u32 {
    if divisor == 0 || cumulative_average <= CardAverage::from_integer(0) {
        return 0;
    }
    let level = (cumulative_average / i128::from(divisor)).floor().to_integer();
    u32::try_from(level).unwrap_or(u32::MAX)
}

pub fn team_level_winner(team: &TeamSnapshot, progress: &TeamProgress) -> Option<TeamLevelWinner> {
    progress.is_new_level().then(|| TeamLevelWinner {
        team_id: team.id,
        name: team.name.clone(),
        previous_level: progress.previous_level,
        new_level: progress.new_level,
    })
}

/// Level every team is working toward together: the lowest team level plus a
/// fixed step.
pub fn school_wide_goal(team_levels: impl IntoIterator<Item = u32>, step: u32) -> Option<u32> {
    team_levels.into_iter().min().map(|lowest| lowest + step)
}
