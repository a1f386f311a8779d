//! Named batch fields keyed by convention

use crate::error::{MultitaskError, Result};
use ndarray::{Array, Array1, ArrayD, Axis, Dimension};
use std::collections::BTreeMap;

/// Validity mask over token positions, `[batch, seq_len]`
pub const INPUT_MASK: &str = "input_mask";
/// Masked token positions, `[batch, max_predictions]`
pub const MASKED_LM_POSITIONS: &str = "masked_lm_positions";
/// True token id per masked slot, `[batch, max_predictions]`
pub const MASKED_LM_IDS: &str = "masked_lm_ids";
/// 1.0 for real masked slots, 0.0 for padding, `[batch, max_predictions]`
pub const MASKED_LM_WEIGHTS: &str = "masked_lm_weights";

/// `<task>_label_ids`
pub fn label_ids_key(task: &str) -> String {
    format!("{task}_label_ids")
}

/// `<task>_loss_multiplier`
pub fn loss_multiplier_key(task: &str) -> String {
    format!("{task}_loss_multiplier")
}

/// A single batch field
#[derive(Debug, Clone, PartialEq)]
pub enum Feature {
    /// Integer ids, masks and positions
    Int(ArrayD<i64>),
    /// Real-valued weights
    Float(ArrayD<f32>),
}

impl Feature {
    /// Shape of the field
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Int(a) => a.shape(),
            Self::Float(a) => a.shape(),
        }
    }

    /// Leading (batch) dimension
    pub fn batch_size(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    /// Values as `f32`, whatever the storage type
    pub fn to_f32(&self) -> ArrayD<f32> {
        match self {
            Self::Int(a) => a.mapv(|v| v as f32),
            Self::Float(a) => a.clone(),
        }
    }
}

/// Per-step projection of the training batch
///
/// Common token features plus task-scoped fields named `<task>_label_ids`
/// and `<task>_loss_multiplier`. Heads never mutate it.
#[derive(Debug, Clone, Default)]
pub struct BatchView {
    features: BTreeMap<String, Feature>,
}

impl BatchView {
    /// Empty view
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an integer field
    pub fn with_int<D: Dimension>(mut self, name: impl Into<String>, values: Array<i64, D>) -> Self {
        self.insert(name, Feature::Int(values.into_dyn()));
        self
    }

    /// Add a float field
    pub fn with_float<D: Dimension>(mut self, name: impl Into<String>, values: Array<f32, D>) -> Self {
        self.insert(name, Feature::Float(values.into_dyn()));
        self
    }

    /// Insert or replace a field
    pub fn insert(&mut self, name: impl Into<String>, feature: Feature) {
        self.features.insert(name.into(), feature);
    }

    /// Whether a field is present
    pub fn contains(&self, name: &str) -> bool {
        self.features.contains_key(name)
    }

    /// Field by name
    pub fn get(&self, name: &str) -> Result<&Feature> {
        self.features
            .get(name)
            .ok_or_else(|| MultitaskError::missing(name))
    }

    /// Integer field by name
    pub fn int(&self, name: &str) -> Result<&ArrayD<i64>> {
        match self.get(name)? {
            Feature::Int(a) => Ok(a),
            Feature::Float(_) => Err(MultitaskError::invalid(name, "expected integer field")),
        }
    }

    /// Field by name as `f32`
    pub fn float(&self, name: &str) -> Result<ArrayD<f32>> {
        Ok(self.get(name)?.to_f32())
    }

    /// `<task>_label_ids`, checked against the expected batch size
    pub fn label_ids(&self, task: &str, batch_size: usize) -> Result<&ArrayD<i64>> {
        let key = label_ids_key(task);
        let labels = self.int(&key)?;
        check_leading(&key, labels.shape(), batch_size)?;
        Ok(labels)
    }

    /// `<task>_loss_multiplier` as a `[batch]` vector
    ///
    /// A missing multiplier means every example belongs to the task.
    pub fn loss_multiplier(&self, task: &str, batch_size: usize) -> Result<Array1<f32>> {
        let key = loss_multiplier_key(task);
        match self.features.get(&key) {
            None => Ok(Array1::ones(batch_size)),
            Some(feature) => {
                if feature.shape() != [batch_size] {
                    return Err(MultitaskError::shape(key, vec![batch_size], feature.shape().to_vec()));
                }
                let values = feature.to_f32();
                Ok(values.iter().copied().collect())
            }
        }
    }

    /// Input validity mask as `f32`, `[batch, seq_len]`
    pub fn input_mask(&self, batch_size: usize, seq_len: usize) -> Result<ArrayD<f32>> {
        let mask = self.get(INPUT_MASK)?;
        if mask.shape() != [batch_size, seq_len] {
            return Err(MultitaskError::shape(
                INPUT_MASK,
                vec![batch_size, seq_len],
                mask.shape().to_vec(),
            ));
        }
        Ok(mask.to_f32())
    }

    /// Real sequence length per example (sum of the validity mask)
    pub fn sequence_lengths(&self, batch_size: usize, seq_len: usize) -> Result<Vec<usize>> {
        let mask = self.input_mask(batch_size, seq_len)?;
        Ok(mask
            .axis_iter(Axis(0))
            .map(|row| row.iter().filter(|&&v| v > 0.0).count())
            .collect())
    }
}

/// Reject a field whose leading dimension is not `batch_size`
pub(crate) fn check_leading(field: &str, shape: &[usize], batch_size: usize) -> Result<()> {
    match shape.first() {
        Some(&b) if b == batch_size => Ok(()),
        _ => {
            let mut expected = shape.to_vec();
            if expected.is_empty() {
                expected.push(batch_size);
            } else {
                expected[0] = batch_size;
            }
            Err(MultitaskError::shape(field, expected, shape.to_vec()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn batch() -> BatchView {
        BatchView::new()
            .with_int(INPUT_MASK, arr2(&[[1, 1, 1, 0], [1, 1, 0, 0]]))
            .with_int(label_ids_key("NER"), arr2(&[[1, 2, 3, 0], [4, 5, 0, 0]]))
            .with_float(loss_multiplier_key("NER"), arr1(&[1.0, 0.0]))
    }

    #[test]
    fn test_sequence_lengths_from_mask() {
        assert_eq!(batch().sequence_lengths(2, 4).expect("mask"), vec![3, 2]);
    }

    #[test]
    fn test_missing_multiplier_defaults_to_ones() {
        let m = batch().loss_multiplier("POS", 2).expect("default");
        assert_eq!(m.to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_multiplier_length_must_match_batch() {
        let err = batch().loss_multiplier("NER", 3).unwrap_err();
        assert!(matches!(err, MultitaskError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_label_ids_leading_dimension_checked() {
        assert!(batch().label_ids("NER", 2).is_ok());
        let err = batch().label_ids("NER", 5).unwrap_err();
        match err {
            MultitaskError::ShapeMismatch { expected, actual, .. } => {
                assert_eq!(expected, vec![5, 4]);
                assert_eq!(actual, vec![2, 4]);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_missing_field() {
        let err = batch().label_ids("CWS", 2).unwrap_err();
        assert!(matches!(err, MultitaskError::MissingFeature { name } if name == "CWS_label_ids"));
    }

    #[test]
    fn test_int_multiplier_is_cast() {
        let b = BatchView::new().with_int(loss_multiplier_key("CWS"), arr1(&[0, 1]));
        assert_eq!(b.loss_multiplier("CWS", 2).expect("cast").to_vec(), vec![0.0, 1.0]);
    }
}
