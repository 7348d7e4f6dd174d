//! Recognition metrics with running counters.
//!
//! All metrics compare decoded class sequences against BLANK-padded target
//! rows. Padding reuses the BLANK index, so targets are stripped of BLANK
//! before comparison. Counters accumulate across calls until `reset()`; the
//! caller decides when an evaluation epoch starts and ends.

use candle_core::{DType, Tensor};
use ndarray::{Array2, ArrayView2};
use std::fmt;

use crate::core::validation::validate_rank;
use crate::core::{LprError, LprResult};
use crate::domain::BLANK_INDEX;

fn strip_blank(targets: ArrayView2<u32>) -> Vec<Vec<usize>> {
    targets
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .filter(|&&c| c as usize != BLANK_INDEX)
                .map(|&c| c as usize)
                .collect()
        })
        .collect()
}

/// Copies a rank-2 `(N, L)` target tensor to the host.
pub fn targets_to_array(targets: &Tensor) -> LprResult<Array2<u32>> {
    validate_rank(targets, 2, "targets")?;
    let (n, l) = targets
        .dims2()
        .map_err(|e| LprError::post_processing("read target dims", e))?;
    let data = targets
        .to_dtype(DType::U32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<u32>())
        .map_err(|e| LprError::post_processing("copy targets to host", e))?;
    Array2::from_shape_vec((n, l), data).map_err(|e| LprError::post_processing("reshape targets", e))
}

fn check_batch(predictions: usize, targets: usize) -> LprResult<()> {
    if predictions != targets {
        return Err(LprError::InvalidInput {
            message: format!("{predictions} predictions for {targets} target rows"),
        });
    }
    Ok(())
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Letter-and-number recognition rate, `R = correct symbols / target symbols`.
///
/// A predicted symbol counts as correct when it equals the target symbol at the
/// same position; comparison stops at the shorter of the two sequences. There
/// is no alignment, so a single inserted or dropped symbol shifts every later
/// position. [`CharErrorRate`] gives the alignment-aware view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecognitionRate {
    corrects: usize,
    total_length: usize,
}

impl RecognitionRate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scores a batch against a rank-2 `(N, L)` target tensor.
    ///
    /// Returns the rate of this batch; [`result`](Self::result) gives the
    /// running rate.
    pub fn update(&mut self, predictions: &[Vec<usize>], targets: &Tensor) -> LprResult<f64> {
        let targets = targets_to_array(targets)?;
        self.update_rows(predictions, targets.view())
    }

    /// Scores a batch against host-side padded targets.
    pub fn update_rows(
        &mut self,
        predictions: &[Vec<usize>],
        targets: ArrayView2<u32>,
    ) -> LprResult<f64> {
        check_batch(predictions.len(), targets.nrows())?;
        let mut corrects = 0;
        let mut total_length = 0;
        for (predicted, target) in predictions.iter().zip(strip_blank(targets)) {
            corrects += predicted
                .iter()
                .zip(&target)
                .filter(|(p, t)| p == t)
                .count();
            total_length += target.len();
        }
        self.corrects += corrects;
        self.total_length += total_length;
        Ok(ratio(corrects, total_length))
    }

    /// Running rate over every batch since the last reset.
    pub fn result(&self) -> f64 {
        ratio(self.corrects, self.total_length)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn corrects(&self) -> usize {
        self.corrects
    }

    pub fn total_length(&self) -> usize {
        self.total_length
    }
}

impl fmt::Display for RecognitionRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "recognition rate {:.4} ({}/{})",
            self.result(),
            self.corrects,
            self.total_length
        )
    }
}

/// Fraction of plates decoded exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceAccuracy {
    exact: usize,
    total: usize,
}

impl SequenceAccuracy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_rows(
        &mut self,
        predictions: &[Vec<usize>],
        targets: ArrayView2<u32>,
    ) -> LprResult<f64> {
        check_batch(predictions.len(), targets.nrows())?;
        let exact = predictions
            .iter()
            .zip(strip_blank(targets))
            .filter(|(p, t)| **p == *t)
            .count();
        self.exact += exact;
        self.total += predictions.len();
        Ok(ratio(exact, predictions.len()))
    }

    pub fn result(&self) -> f64 {
        ratio(self.exact, self.total)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for SequenceAccuracy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sequence accuracy {:.4} ({}/{})",
            self.result(),
            self.exact,
            self.total
        )
    }
}

/// Levenshtein distance between two sequences.
pub fn edit_distance(a: &[usize], b: &[usize]) -> usize {
    let mut previous = (0..=b.len()).collect::<Vec<_>>();
    let mut current = vec![0; b.len() + 1];
    for (i, x) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(x != y);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Character error rate: summed edit distance over summed target length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharErrorRate {
    edits: usize,
    total_length: usize,
}

impl CharErrorRate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_rows(
        &mut self,
        predictions: &[Vec<usize>],
        targets: ArrayView2<u32>,
    ) -> LprResult<f64> {
        check_batch(predictions.len(), targets.nrows())?;
        let mut edits = 0;
        let mut total_length = 0;
        for (predicted, target) in predictions.iter().zip(strip_blank(targets)) {
            edits += edit_distance(predicted, &target);
            total_length += target.len();
        }
        self.edits += edits;
        self.total_length += total_length;
        Ok(ratio(edits, total_length))
    }

    pub fn result(&self) -> f64 {
        ratio(self.edits, self.total_length)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for CharErrorRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "character error rate {:.4} ({}/{})",
            self.result(),
            self.edits,
            self.total_length
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pad_targets;
    use candle_core::Device;

    const A: usize = 1;
    const B: usize = 2;
    const ONE: usize = 27;

    #[test]
    fn perfect_predictions_score_one() {
        let targets = pad_targets(&[vec![1, 2, 27], vec![3, 4]]);
        let mut metric = RecognitionRate::new();
        let rate = metric
            .update_rows(&[vec![A, B, ONE], vec![3, 4]], targets.view())
            .unwrap();
        assert_eq!(rate, 1.0);
        assert_eq!(metric.result(), 1.0);
    }

    #[test]
    fn disjoint_predictions_score_zero() {
        let targets = pad_targets(&[vec![1, 2, 27]]);
        let mut metric = RecognitionRate::new();
        assert_eq!(
            metric.update_rows(&[vec![5, 6, 7]], targets.view()).unwrap(),
            0.0
        );
    }

    #[test]
    fn comparison_is_positional() {
        // Decoded "AB1" against target "A1": position 0 matches, position 1 does not.
        let targets = Tensor::new(&[[1u32, 27, 0, 0]], &Device::Cpu).unwrap();
        let mut metric = RecognitionRate::new();
        let rate = metric.update(&[vec![A, B, ONE]], &targets).unwrap();
        assert_eq!(rate, 0.5);
        assert_eq!((metric.corrects(), metric.total_length()), (1, 2));
    }

    #[test]
    fn empty_prediction_counts_target_length() {
        let targets = pad_targets(&[vec![1, 2, 27]]);
        let mut metric = RecognitionRate::new();
        assert_eq!(metric.update_rows(&[vec![]], targets.view()).unwrap(), 0.0);
        assert_eq!(metric.total_length(), 3);
    }

    #[test]
    fn accumulates_until_reset() {
        let mut metric = RecognitionRate::new();
        metric
            .update_rows(&[vec![A, B]], pad_targets(&[vec![1, 2]]).view())
            .unwrap();
        metric
            .update_rows(&[vec![A, A]], pad_targets(&[vec![1, 2]]).view())
            .unwrap();
        assert_eq!(metric.result(), 0.75);
        metric.reset();
        assert_eq!(metric.result(), 0.0);
        assert_eq!(metric.total_length(), 0);
    }

    #[test]
    fn rejects_non_matrix_targets() {
        let targets = Tensor::new(&[1u32, 2, 27], &Device::Cpu).unwrap();
        let mut metric = RecognitionRate::new();
        assert!(matches!(
            metric.update(&[vec![A, B, ONE]], &targets),
            Err(LprError::InvalidInput { .. })
        ));
        assert_eq!(metric, RecognitionRate::default());
    }

    #[test]
    fn sequence_accuracy_and_cer() {
        let targets = pad_targets(&[vec![1, 27], vec![1, 2, 27]]);
        let predictions = [vec![A, ONE], vec![A, ONE]];

        let mut accuracy = SequenceAccuracy::new();
        assert_eq!(accuracy.update_rows(&predictions, targets.view()).unwrap(), 0.5);

        let mut cer = CharErrorRate::new();
        // One deletion over five target symbols.
        assert!((cer.update_rows(&predictions, targets.view()).unwrap() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn edit_distance_cases() {
        assert_eq!(edit_distance(&[], &[1, 2]), 2);
        assert_eq!(edit_distance(&[1, 2, 3], &[1, 3]), 1);
        assert_eq!(edit_distance(&[1, 2], &[2, 1]), 2);
    }
}
