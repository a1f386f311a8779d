//! Evaluation metrics over flat row-major score matrices

/// Number of evenly spaced thresholds scanned by [`best_threshold_f1`]
pub const F1_THRESHOLDS: usize = 200;

/// Row-wise softmax of `[rows, cols]`
pub fn softmax_rows(logits: &[f32], cols: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(logits.len());
    for row in logits.chunks(cols.max(1)) {
        let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let exp: Vec<f32> = row.iter().map(|&v| (v - max).exp()).collect();
        let sum: f32 = exp.iter().sum();
        out.extend(exp.iter().map(|e| e / sum));
    }
    out
}

/// Row-wise log-softmax of `[rows, cols]`
pub fn log_softmax_rows(logits: &[f32], cols: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(logits.len());
    for row in logits.chunks(cols.max(1)) {
        let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let log_sum = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
        out.extend(row.iter().map(|&v| v - log_sum));
    }
    out
}

/// Index of the largest value of each row (first on ties)
pub fn argmax_rows(values: &[f32], cols: usize) -> Vec<usize> {
    values
        .chunks(cols.max(1))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                .0
        })
        .collect()
}

/// Fraction of matching entries, optionally weighted
///
/// Returns 0 when the total weight is 0.
pub fn weighted_accuracy(predictions: &[usize], labels: &[usize], weights: Option<&[f32]>) -> f32 {
    let mut hits = 0.0;
    let mut total = 0.0;
    for (i, (p, l)) in predictions.iter().zip(labels).enumerate() {
        let w = weights.map_or(1.0, |w| w[i]);
        total += w;
        if p == l {
            hits += w;
        }
    }
    if total > 0.0 {
        hits / total
    } else {
        0.0
    }
}

/// Fraction of sequences whose every valid position is correct
///
/// `mask` marks valid positions of `[rows, seq_len]`. A sequence with no
/// valid position counts as correct.
pub fn sequence_accuracy(predictions: &[usize], labels: &[usize], mask: &[f32], seq_len: usize) -> f32 {
    let rows = predictions.len() / seq_len.max(1);
    if rows == 0 {
        return 0.0;
    }
    let correct = (0..rows)
        .filter(|&r| {
            (r * seq_len..(r + 1) * seq_len).all(|i| mask[i] <= 0.0 || predictions[i] == labels[i])
        })
        .count();
    correct as f32 / rows as f32
}

/// Best F1 over [`F1_THRESHOLDS`] thresholds of class scores vs one-hot labels
///
/// Every (row, class) cell is a binary decision `score > threshold` against
/// `class == label[row]`; counts are weighted per row.
pub fn best_threshold_f1(scores: &[f32], labels: &[usize], cols: usize, weights: Option<&[f32]>) -> f32 {
    let mut best = 0.0f32;
    for k in 0..F1_THRESHOLDS {
        let threshold = k as f32 / (F1_THRESHOLDS - 1) as f32;
        let (mut tp, mut fp, mut fn_) = (0.0f32, 0.0f32, 0.0f32);
        for (row, (chunk, &label)) in scores.chunks(cols.max(1)).zip(labels).enumerate() {
            let w = weights.map_or(1.0, |w| w[row]);
            if w == 0.0 {
                continue;
            }
            for (class, &score) in chunk.iter().enumerate() {
                match (score > threshold, class == label) {
                    (true, true) => tp += w,
                    (true, false) => fp += w,
                    (false, true) => fn_ += w,
                    (false, false) => {}
                }
            }
        }
        let denom = 2.0 * tp + fp + fn_;
        if denom > 0.0 {
            best = best.max(2.0 * tp / denom);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn test_softmax_and_log_softmax_agree() {
        let logits = [1.0, 2.0, 3.0, -1.0, 0.0, 1000.0];
        let probs = softmax_rows(&logits, 3);
        let logs = log_softmax_rows(&logits, 3);
        for (p, l) in probs.iter().zip(&logs) {
            assert_abs_diff_eq!(p.ln().max(-100.0), l.max(-100.0), epsilon = 1e-4);
        }
        assert_abs_diff_eq!(probs[5], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_argmax_rows() {
        assert_eq!(argmax_rows(&[0.1, 0.7, 0.2, 0.9, 0.0, 0.9], 3), vec![1, 0]);
    }

    #[test]
    fn test_weighted_accuracy_ignores_zero_weight() {
        let acc = weighted_accuracy(&[1, 2, 3], &[1, 0, 0], Some(&[1.0, 0.0, 0.0]));
        assert_eq!(acc, 1.0);
        assert_eq!(weighted_accuracy(&[1], &[1], Some(&[0.0])), 0.0);
    }

    #[test]
    fn test_sequence_accuracy_counts_empty_as_correct() {
        let preds = [1, 2, 0, 1, 1, 5];
        let labels = [1, 2, 9, 1, 0, 0];
        let mask = [1.0, 1.0, 0.0, 1.0, 1.0, 0.0];
        assert_abs_diff_eq!(sequence_accuracy(&preds, &labels, &mask, 3), 0.5);
        assert_eq!(sequence_accuracy(&[4, 4], &[0, 0], &[0.0, 0.0], 2), 1.0);
    }

    #[test]
    fn test_perfect_scores_give_unit_f1() {
        let scores = [0.9, 0.05, 0.05, 0.1, 0.8, 0.1];
        assert_abs_diff_eq!(best_threshold_f1(&scores, &[0, 1], 3, None), 1.0);
    }

    #[test]
    fn test_f1_zero_weight_rows_skipped() {
        let scores = [0.9, 0.1, 0.9, 0.1];
        let f1 = best_threshold_f1(&scores, &[0, 1], 2, Some(&[1.0, 0.0]));
        assert_abs_diff_eq!(f1, 1.0);
    }

    proptest! {
        #[test]
        fn prop_softmax_rows_sum_to_one(logits in prop::collection::vec(-20.0f32..20.0, 12)) {
            let probs = softmax_rows(&logits, 4);
            for row in probs.chunks(4) {
                prop_assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
            }
        }

        #[test]
        fn prop_f1_in_unit_interval(
            scores in prop::collection::vec(0.0f32..1.0, 12),
            labels in prop::collection::vec(0usize..3, 4),
        ) {
            let f1 = best_threshold_f1(&scores, &labels, 3, None);
            prop_assert!((0.0..=1.0).contains(&f1));
        }
    }
}
