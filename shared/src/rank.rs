//! Fixed score→rank mapping.

/// Rank id of players without a placement yet.
pub const RANK_NONE: u32 = 0;

/// Highest rank id.
pub const RANK_MAX: u32 = 18;

/// Score thresholds; crossing threshold `i` puts the player into rank
/// `i + 1`. Below the first threshold the player is unranked.
pub const RANK_THRESHOLDS: [u32; 18] = [
    100, 150, 200, 300, 400, 500, 600, 750, 900, 1050, 1200, 1400, 1600, 1800, 2000, 2200, 2400,
    2700,
];

/// Maps a score to a rank id in `0..=18`. A score exactly on a threshold
/// belongs to the higher rank.
pub fn score_to_rank(score: u32) -> u32 {
    RANK_THRESHOLDS.iter().filter(|&&t| score >= t).count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unranked_below_first_threshold() {
        assert_eq!(score_to_rank(0), RANK_NONE);
        assert_eq!(score_to_rank(99), RANK_NONE);
    }

    #[test]
    fn threshold_boundary_belongs_to_higher_rank() {
        for (i, &threshold) in RANK_THRESHOLDS.iter().enumerate() {
            assert_eq!(score_to_rank(threshold - 1), i as u32);
            assert_eq!(score_to_rank(threshold), i as u32 + 1);
        }
    }

    #[test]
    fn mapping_is_monotonic() {
        let mut previous = 0;
        for score in 0..3000 {
            let rank = score_to_rank(score);
            assert!(rank >= previous, "rank regressed at score {}", score);
            assert!(rank <= RANK_MAX);
            previous = rank;
        }
    }

    #[test]
    fn top_rank_at_and_above_final_threshold() {
        assert_eq!(score_to_rank(2700), RANK_MAX);
        assert_eq!(score_to_rank(50_000), RANK_MAX);
    }
}
