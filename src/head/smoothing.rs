//! Label smoothing for structured losses by stochastic hard-label sampling
//!
//! A CRF needs one integer tag per position, so soft targets are replaced by
//! sampling. Each position draws uniformly from a pool holding the true label
//! `floor(num_classes / label_smoothing)` times plus one copy of every class.

use crate::error::{MultitaskError, Result};
use rand::Rng;

/// Per-position label sampler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelSampler {
    num_classes: usize,
    repeats: usize,
    enabled: bool,
}

impl LabelSampler {
    /// Sampler over `num_classes` classes
    ///
    /// `label_smoothing == 0` bypasses sampling. A smoothing factor large
    /// enough that the repeat count floors to zero leaves the uniform class
    /// list as the whole pool.
    pub fn new(num_classes: usize, label_smoothing: f32) -> Result<Self> {
        if !(label_smoothing >= 0.0) {
            return Err(MultitaskError::invalid(
                "head.label_smoothing",
                format!("{label_smoothing} (must be >= 0.0)"),
            ));
        }
        let enabled = label_smoothing > 0.0 && num_classes > 0;
        let repeats = if enabled {
            (num_classes as f32 / label_smoothing).floor() as usize
        } else {
            0
        };
        Ok(Self {
            num_classes,
            repeats,
            enabled,
        })
    }

    /// Whether labels pass through unchanged
    pub fn is_bypassed(&self) -> bool {
        !self.enabled
    }

    /// Copies of the true label in the pool
    pub fn repeats(&self) -> usize {
        self.repeats
    }

    /// Total pool size
    pub fn pool_size(&self) -> usize {
        self.repeats + self.num_classes
    }

    /// Probability that the true label is drawn
    pub fn true_label_probability(&self) -> f64 {
        if self.is_bypassed() {
            return 1.0;
        }
        (self.repeats + 1) as f64 / self.pool_size() as f64
    }

    /// Draw the training label for a position whose true label is `label`
    pub fn sample<R: Rng + ?Sized>(&self, label: usize, rng: &mut R) -> usize {
        if self.is_bypassed() {
            return label;
        }
        let slot = rng.random_range(0..self.pool_size());
        if slot < self.repeats {
            label
        } else {
            slot - self.repeats
        }
    }

    /// Resample the first `length` entries of every row of `[rows, seq_len]`
    pub fn sample_sequences<R: Rng + ?Sized>(
        &self,
        labels: &[usize],
        lengths: &[usize],
        seq_len: usize,
        rng: &mut R,
    ) -> Vec<usize> {
        if self.is_bypassed() {
            return labels.to_vec();
        }
        let mut sampled = labels.to_vec();
        for (row, &len) in lengths.iter().enumerate() {
            for slot in &mut sampled[row * seq_len..row * seq_len + len.min(seq_len)] {
                *slot = self.sample(*slot, rng);
            }
        }
        sampled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_zero_smoothing_bypasses_sampling() {
        let sampler = LabelSampler::new(10, 0.0).expect("valid factor");
        assert!(sampler.is_bypassed());
        let mut rng = StdRng::seed_from_u64(0);
        let labels = vec![3, 1, 4, 1];
        assert_eq!(sampler.sample_sequences(&labels, &[2, 2], 2, &mut rng), labels);
    }

    #[test]
    fn test_negative_smoothing_rejected() {
        let err = LabelSampler::new(4, -0.5).unwrap_err();
        assert!(matches!(err, MultitaskError::InvalidConfig { field, .. } if field == "head.label_smoothing"));
        assert!(LabelSampler::new(4, f32::NAN).is_err());
    }

    #[test]
    fn test_pool_size() {
        let sampler = LabelSampler::new(10, 0.1).expect("valid factor");
        assert_eq!(sampler.repeats(), 100);
        assert_eq!(sampler.pool_size(), 110);
    }

    #[test]
    fn test_large_smoothing_degenerates_to_uniform() {
        let sampler = LabelSampler::new(3, 10.0).expect("valid factor");
        assert_eq!(sampler.repeats(), 0);
        assert_eq!(sampler.pool_size(), 3);
        assert!((sampler.true_label_probability() - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_sampling_histogram_matches_mixture() {
        // 4 classes, smoothing 0.5: pool = 8 copies of the label + [0, 1, 2, 3]
        let sampler = LabelSampler::new(4, 0.5).expect("valid factor");
        let mut rng = StdRng::seed_from_u64(7);
        let trials = 60_000;
        let mut counts = [0usize; 4];
        for _ in 0..trials {
            counts[sampler.sample(2, &mut rng)] += 1;
        }
        let freq: Vec<f64> = counts.iter().map(|&c| c as f64 / trials as f64).collect();
        assert!((freq[2] - 9.0 / 12.0).abs() < 0.01, "true label freq {}", freq[2]);
        for class in [0, 1, 3] {
            assert!((freq[class] - 1.0 / 12.0).abs() < 0.01, "class {class} freq {}", freq[class]);
        }
    }

    #[test]
    fn test_padding_positions_untouched() {
        let sampler = LabelSampler::new(2, 100.0).expect("valid factor");
        let mut rng = StdRng::seed_from_u64(3);
        let labels = vec![0, 0, 9, 9];
        let sampled = sampler.sample_sequences(&labels, &[2], 4, &mut rng);
        assert_eq!(&sampled[2..], &[9, 9]);
    }

    proptest! {
        #[test]
        fn prop_samples_within_classes(
            num_classes in 1usize..20,
            smoothing in 0.01f32..5.0,
            label in 0usize..20,
            seed in any::<u64>(),
        ) {
            let label = label % num_classes;
            let sampler = LabelSampler::new(num_classes, smoothing).expect("valid factor");
            let mut rng = StdRng::seed_from_u64(seed);
            for _ in 0..50 {
                prop_assert!(sampler.sample(label, &mut rng) < num_classes);
            }
        }
    }
}
