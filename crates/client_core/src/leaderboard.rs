use std::cmp::Ordering;

use shared::protocol::LeaderboardEntry;

/// Deterministic ranking: score descending, ties broken by response
/// time ascending (faster wins), missing response times after measured
/// ones. Ranks are dense positional ranks; a residual full tie keeps
/// input order (the sort is stable).
pub fn compute_ranking(mut entries: Vec<LeaderboardEntry>) -> Vec<LeaderboardEntry> {
    entries.sort_by(compare_entries);
    for (position, entry) in entries.iter_mut().enumerate() {
        entry.rank = position as u32 + 1;
    }
    entries
}

fn compare_entries(a: &LeaderboardEntry, b: &LeaderboardEntry) -> Ordering {
    b.score.cmp(&a.score).then_with(|| {
        match (a.response_time_ms, b.response_time_ms) {
            (Some(a_rt), Some(b_rt)) => a_rt.cmp(&b_rt),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::UserId;

    fn entry(id: i64, score: i64, response_time_ms: Option<u64>) -> LeaderboardEntry {
        LeaderboardEntry {
            user_id: UserId(id),
            username: format!("user-{id}"),
            score,
            response_time_ms,
            is_late_joiner: false,
            rank: 0,
        }
    }

    #[test]
    fn faster_response_wins_a_score_tie() {
        let ranked = compute_ranking(vec![entry(1, 100, Some(500)), entry(2, 100, Some(300))]);
        assert_eq!(ranked[0].user_id, UserId(2));
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[1].user_id, UserId(1));
        assert_eq!(ranked[1].rank, 2);
    }

    #[test]
    fn missing_response_time_sorts_after_measured_on_a_tie() {
        let ranked = compute_ranking(vec![entry(1, 50, None), entry(2, 50, Some(4000))]);
        assert_eq!(ranked[0].user_id, UserId(2));
        assert_eq!(ranked[1].user_id, UserId(1));
    }

    #[test]
    fn higher_score_beats_any_response_time() {
        let ranked = compute_ranking(vec![entry(1, 10, Some(100)), entry(2, 20, None)]);
        assert_eq!(ranked[0].user_id, UserId(2));
    }

    #[test]
    fn all_zero_scores_still_produce_a_total_order() {
        let ranked = compute_ranking(vec![
            entry(1, 0, None),
            entry(2, 0, Some(900)),
            entry(3, 0, Some(200)),
            entry(4, 0, None),
        ]);
        let ranks: Vec<u32> = ranked.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
        assert_eq!(ranked[0].user_id, UserId(3));
        assert_eq!(ranked[1].user_id, UserId(2));
        // Residual ties keep input order.
        assert_eq!(ranked[2].user_id, UserId(1));
        assert_eq!(ranked[3].user_id, UserId(4));
    }

    #[test]
    fn ranks_are_dense_not_competition_style() {
        let ranked = compute_ranking(vec![
            entry(1, 100, Some(100)),
            entry(2, 100, Some(100)),
            entry(3, 90, Some(100)),
        ]);
        let ranks: Vec<u32> = ranked.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
    }
}
