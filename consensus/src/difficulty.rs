//! Linear difficulty retargeting
//!
//! The controller samples the chain once per epoch, converts each
//! inter-sample interval into an effective difficulty (what the
//! difficulty should have been for blocks to land on the desired
//! interval), fits a least-squares line through the effective
//! difficulties and extrapolates one epoch past the newest sample.
//! All arithmetic is integer fixed-point.

use crate::header::Header;
use crate::types::{Difficulty, Height};

/// Fixed-point scale for the regression arithmetic
pub const PRECISION: i128 = 1_000_000_000;

/// Least-squares linear difficulty controller
#[derive(Debug, Clone)]
pub struct LinearDifficultyController {
    /// Sampling interval in blocks
    pub epoch_length: u64,
    /// Number of samples the retarget window holds
    pub retargeting_epochs_qty: usize,
    /// Desired block interval in milliseconds
    pub desired_block_interval_ms: u64,
    /// Difficulty used before the window fills and as the floor fallback
    pub initial_difficulty: Difficulty,
}

impl LinearDifficultyController {
    /// Heights to sample when retargeting after a header at `height`:
    /// `retargeting_epochs_qty` heights spaced `epoch_length` apart,
    /// ascending, ending at `height`. Heights that would fall below
    /// genesis are dropped.
    pub fn heights_for_retargeting_at(&self, height: Height) -> Vec<Height> {
        (0..self.retargeting_epochs_qty as u64)
            .rev()
            .filter_map(|i| height.checked_sub(i * self.epoch_length))
            .collect()
    }

    /// Compute the required difficulty from `(height, header)` samples in
    /// ascending height order. With a short window the newest sample's
    /// difficulty is kept unchanged.
    pub fn get_difficulty(&self, samples: &[(Height, Header)]) -> Difficulty {
        if samples.is_empty() {
            return self.initial_difficulty;
        }
        if samples.len() < self.retargeting_epochs_qty {
            return samples
                .iter()
                .max_by_key(|(height, _)| *height)
                .map(|(_, header)| header.difficulty)
                .unwrap_or(self.initial_difficulty);
        }

        let data: Vec<(i128, i128)> = samples
            .windows(2)
            .map(|pair| {
                let (_, start) = &pair[0];
                let (end_height, end) = &pair[1];
                let elapsed = end.timestamp.saturating_sub(start.timestamp).max(1) as i128;
                let effective = (end.difficulty as i128)
                    .saturating_mul(self.desired_block_interval_ms as i128)
                    .saturating_mul(self.epoch_length as i128)
                    / elapsed;
                (*end_height as i128, effective)
            })
            .collect();

        let max_height = samples
            .iter()
            .map(|(height, _)| *height)
            .max()
            .unwrap_or(0) as i128;
        let predicted = Self::interpolate(&data, max_height + self.epoch_length as i128);

        if predicted < 1 {
            self.initial_difficulty
        } else {
            predicted as Difficulty
        }
    }

    /// Least-squares fit of `y = a + b * x` over the data points,
    /// evaluated at `x0`, with coefficients scaled by [`PRECISION`].
    fn interpolate(data: &[(i128, i128)], x0: i128) -> i128 {
        let n = data.len() as i128;
        if n == 0 {
            return 0;
        }

        let sum_x: i128 = data.iter().map(|(x, _)| x).sum();
        let sum_y: i128 = data.iter().map(|(_, y)| y).sum();
        let sum_xy: i128 = data.iter().map(|(x, y)| x.saturating_mul(*y)).sum();
        let sum_xx: i128 = data.iter().map(|(x, _)| x.saturating_mul(*x)).sum();

        let denominator = n
            .saturating_mul(sum_xx)
            .saturating_sub(sum_x.saturating_mul(sum_x));
        if denominator == 0 {
            return sum_y / n;
        }

        let slope = PRECISION
            .saturating_mul(
                n.saturating_mul(sum_xy)
                    .saturating_sub(sum_x.saturating_mul(sum_y)),
            )
            / denominator;
        let intercept = PRECISION
            .saturating_mul(sum_y)
            .saturating_sub(slope.saturating_mul(sum_x))
            / n;

        intercept.saturating_add(slope.saturating_mul(x0)) / PRECISION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::GENESIS_PARENT_ID;
    use crate::types::{ModifierId, StateDigest};

    fn controller() -> LinearDifficultyController {
        LinearDifficultyController {
            epoch_length: 10,
            retargeting_epochs_qty: 4,
            desired_block_interval_ms: 1_000,
            initial_difficulty: 1_000,
        }
    }

    fn header_at(timestamp: u64, difficulty: u128) -> Header {
        Header {
            parent_id: GENESIS_PARENT_ID,
            height: 0,
            timestamp,
            difficulty,
            state_root: StateDigest::default(),
            ad_proofs_root: [0u8; 32],
            payload_id: ModifierId::default(),
            ad_proofs_id: ModifierId::default(),
            nonce: 0,
            miner_pk: [0u8; 32],
            signature: vec![],
        }
    }

    /// Samples with blocks arriving on exactly the desired interval
    fn on_target_samples(ctrl: &LinearDifficultyController, difficulty: u128) -> Vec<(u64, Header)> {
        let interval = ctrl.desired_block_interval_ms * ctrl.epoch_length;
        (0..ctrl.retargeting_epochs_qty as u64)
            .map(|i| {
                (
                    (i + 1) * ctrl.epoch_length,
                    header_at((i + 1) * interval, difficulty),
                )
            })
            .collect()
    }

    #[test]
    fn test_sample_heights_end_at_height() {
        let ctrl = controller();
        assert_eq!(ctrl.heights_for_retargeting_at(100), vec![70, 80, 90, 100]);
    }

    #[test]
    fn test_sample_heights_truncated_near_genesis() {
        let ctrl = controller();
        assert_eq!(ctrl.heights_for_retargeting_at(15), vec![5, 15]);
    }

    #[test]
    fn test_on_target_chain_keeps_difficulty() {
        let ctrl = controller();
        let samples = on_target_samples(&ctrl, 5_000);
        let result = ctrl.get_difficulty(&samples);
        // Fixed-point rounding may shave a unit.
        assert!((4_999..=5_001).contains(&result), "got {result}");
    }

    #[test]
    fn test_slow_chain_halves_difficulty() {
        let ctrl = controller();
        // Blocks took twice the desired interval.
        let interval = 2 * ctrl.desired_block_interval_ms * ctrl.epoch_length;
        let samples: Vec<(u64, Header)> = (0..ctrl.retargeting_epochs_qty as u64)
            .map(|i| {
                (
                    (i + 1) * ctrl.epoch_length,
                    header_at((i + 1) * interval, 5_000),
                )
            })
            .collect();
        let result = ctrl.get_difficulty(&samples);
        assert!((2_499..=2_501).contains(&result), "got {result}");
    }

    #[test]
    fn test_short_window_keeps_last_difficulty() {
        let ctrl = controller();
        let samples = vec![(10, header_at(1_000, 777)), (20, header_at(2_000, 888))];
        assert_eq!(ctrl.get_difficulty(&samples), 888);
    }

    #[test]
    fn test_prediction_floor_falls_back_to_initial() {
        let ctrl = controller();
        // Absurdly slow chain pushes the prediction below one.
        let samples: Vec<(u64, Header)> = (0..ctrl.retargeting_epochs_qty as u64)
            .map(|i| ((i + 1) * ctrl.epoch_length, header_at((i + 1) * (u64::MAX / 8), 1)))
            .collect();
        assert_eq!(ctrl.get_difficulty(&samples), ctrl.initial_difficulty);
    }

    #[test]
    fn test_accelerating_chain_raises_difficulty() {
        let ctrl = controller();
        let desired = ctrl.desired_block_interval_ms * ctrl.epoch_length;
        // Each successive epoch takes half the time of the previous one.
        let times = [desired, desired + desired / 2, desired * 7 / 4, desired * 15 / 8];
        let samples: Vec<(u64, Header)> = times
            .iter()
            .enumerate()
            .map(|(i, t)| ((i as u64 + 1) * ctrl.epoch_length, header_at(*t, 4_000)))
            .collect();
        let result = ctrl.get_difficulty(&samples);
        assert!(result > 4_000, "got {result}");
    }
}
