use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;
use uuid::Uuid;

use crate::models::{CollectionRecord, StudentSnapshot, TeamSnapshot};

/// Everyone who won a drawing in the newest `window` records.
pub fn excluded_winners(recent: &[CollectionRecord], window: usize) -> HashSet<Uuid> {
    let mut newest_first: Vec<&CollectionRecord> = recent.iter().collect();
    newest_first.sort_by(|a, b| b.collection_date.cmp(&a.collection_date));
    newest_first
        .into_iter()
        .take(window)
        .flat_map(|record| record.random_drawing_winners.iter().copied())
        .collect()
}

/// One ticket per uncounted card for every student not excluded.
pub fn ticket_pool<'a>(
    students: impl IntoIterator<Item = &'a StudentSnapshot>,
    excluded: &HashSet<Uuid>,
) -> Vec<Uuid> {
    let mut tickets = Vec::new();
    for student in students {
        if excluded.contains(&student.id) {
            continue;
        }
        let count = student.uncounted_card_ids.len();
        tickets.extend(std::iter::repeat(student.id).take(count));
    }
    tickets
}

/// Draws up to `count` distinct students, each draw weighted by the tickets
/// still in the pool. A winner's remaining tickets leave the pool with them.
pub fn draw_winners<R: Rng + ?Sized>(mut tickets: Vec<Uuid>, count: usize, rng: &mut R) -> Vec<Uuid> {
    let mut winners = Vec::with_capacity(count.min(tickets.len()));
    for _ in 0..count {
        if tickets.is_empty() {
            break;
        }
        tickets.shuffle(rng);
        let winner = tickets[0];
        tickets.retain(|ticket| *ticket != winner);
        winners.push(winner);
    }
    winners
}

/// Picks the team's next rotating winner from its own members' tickets,
/// skipping whoever currently holds the spot.
pub fn draw_team_winner<R: Rng + ?Sized>(team: &TeamSnapshot, rng: &mut R) -> Option<Uuid> {
    let excluded: HashSet<Uuid> = team.current_winner.into_iter().collect();
    let tickets = ticket_pool(&team.members, &excluded);
    draw_winners(tickets, 1, rng).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn student(uncounted: usize) -> StudentSnapshot {
        StudentSnapshot {
            id: Uuid::new_v4(),
            name: "Avery Lee".to_string(),
            total_cards: uncounted as u32,
            individual_level: 0,
            version: 1,
            uncounted_card_ids: (0..uncounted).map(|_| Uuid::new_v4()).collect(),
        }
    }

    fn record(days_ago: i64, winners: Vec<Uuid>) -> CollectionRecord {
        let base = Utc.with_ymd_and_hms(2026, 3, 6, 15, 0, 0).unwrap();
        CollectionRecord {
            id: Uuid::new_v4(),
            collection_date: base - Duration::days(days_ago),
            collected_cards_count: 0,
            personal_level_winners: Vec::new(),
            ta_new_level_winners: Vec::new(),
            random_drawing_winners: winners,
        }
    }

    #[test]
    fn exclusion_covers_only_the_window() {
        let recent_winner = Uuid::new_v4();
        let old_winner = Uuid::new_v4();
        let history = vec![
            record(28, vec![old_winner]),
            record(7, vec![recent_winner]),
            record(14, Vec::new()),
            record(21, Vec::new()),
        ];

        let excluded = excluded_winners(&history, 3);
        assert!(excluded.contains(&recent_winner));
        assert!(!excluded.contains(&old_winner));
        assert!(excluded_winners(&history, 0).is_empty());
    }

    #[test]
    fn tickets_follow_uncounted_cards() {
        let students = vec![student(3), student(0), student(2)];
        let excluded: HashSet<Uuid> = [students[2].id].into_iter().collect();
        let tickets = ticket_pool(&students, &excluded);
        assert_eq!(tickets, vec![students[0].id; 3]);
    }

    #[test]
    fn excluded_student_never_wins() {
        let regular = student(100);
        let history = vec![
            record(7, vec![regular.id]),
            record(14, vec![regular.id]),
            record(21, vec![regular.id]),
        ];
        let excluded = excluded_winners(&history, 3);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..100 {
            let tickets = ticket_pool([&regular], &excluded);
            assert!(draw_winners(tickets, 10, &mut rng).is_empty());
        }
    }

    #[test]
    fn draws_are_proportional_to_tickets() {
        let rare = student(1);
        let frequent = student(99);
        let excluded = HashSet::new();
        let mut rng = StdRng::seed_from_u64(2026);

        let runs = 10_000;
        let mut frequent_wins = 0;
        for _ in 0..runs {
            let tickets = ticket_pool([&rare, &frequent], &excluded);
            let winners = draw_winners(tickets, 1, &mut rng);
            if winners == vec![frequent.id] {
                frequent_wins += 1;
            }
        }

        let share = frequent_wins as f64 / runs as f64;
        assert!((0.975..=0.999).contains(&share), "share was {share}");
    }

    #[test]
    fn no_student_wins_twice() {
        let students = vec![student(5), student(1)];
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..200 {
            let tickets = ticket_pool(&students, &HashSet::new());
            let winners = draw_winners(tickets, 5, &mut rng);
            assert_eq!(winners.len(), 2);
            let distinct: HashSet<Uuid> = winners.iter().copied().collect();
            assert_eq!(distinct.len(), winners.len());
        }
    }

    #[test]
    fn empty_pool_draws_nobody() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(draw_winners(Vec::new(), 10, &mut rng).is_empty());
        let idle = vec![student(0), student(0)];
        assert!(draw_winners(ticket_pool(&idle, &HashSet::new()), 10, &mut rng).is_empty());
    }

    #[test]
    fn team_winner_skips_current_holder() {
        let holder = student(50);
        let other = student(1);
        let team = TeamSnapshot {
            id: Uuid::new_v4(),
            name: "Rivera TA".to_string(),
            members: vec![holder.clone(), other.clone()],
            average_cards_per_student: crate::models::CardAverage::from_integer(0),
            current_level: 0,
            current_winner: Some(holder.id),
            previous_winner: None,
            version: 1,
        };
        let mut rng = StdRng::seed_from_u64(3);

        for _ in 0..50 {
            assert_eq!(draw_team_winner(&team, &mut rng), Some(other.id));
        }

        let only_holder = TeamSnapshot {
            members: vec![holder],
            ..team
        };
        assert_eq!(draw_team_winner(&only_holder, &mut rng), None);
    }
}
