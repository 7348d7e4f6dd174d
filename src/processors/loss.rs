//! CTC training loss.
//!
//! The forward (alpha) recursion runs in log space over the BLANK-interleaved
//! target, vectorized across the batch. Every step is a differentiable tensor
//! op, so the loss can be back-propagated into the network logits.

use candle_core::{D, DType, Device, Tensor};

use crate::core::validation::validate_rank;
use crate::core::{LprError, LprResult};
use crate::domain::BLANK_INDEX;

/// Stand-in for log(0) that keeps every intermediate finite.
const NEG: f32 = -1e30;

/// Per-sample alignment tables derived from the padded targets.
struct Alignment {
    /// BLANK-interleaved labels, padded with BLANK to the longest one, `(N, S)`.
    extended: Vec<u32>,
    /// 0 where the recursion may skip from `s - 2`, `NEG` otherwise, `(N, S)`.
    skip_mask: Vec<f32>,
    /// 0 for the two admissible start states, `NEG` otherwise, `(N, S)`.
    start_mask: Vec<f32>,
    /// Index of the final BLANK and of the final label state, `(N, 1)` each.
    last: Vec<u32>,
    prev: Vec<u32>,
    /// 0 if the sample has a final label state, `NEG` for empty targets.
    prev_mask: Vec<f32>,
    /// Target lengths clamped to at least 1.
    divisors: Vec<f32>,
    states: usize,
}

impl Alignment {
    fn new(rows: &[Vec<u32>], time_steps: usize) -> LprResult<Self> {
        let labels = rows
            .iter()
            .map(|row| {
                row.iter()
                    .copied()
                    .filter(|&c| c != BLANK_INDEX as u32)
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        for (n, label) in labels.iter().enumerate() {
            let repeats = label.windows(2).filter(|w| w[0] == w[1]).count();
            let required = label.len() + repeats;
            if required > time_steps {
                return Err(LprError::InvalidInput {
                    message: format!(
                        "target {n} needs at least {required} time-steps but the logits have {time_steps}"
                    ),
                });
            }
        }

        let states = labels.iter().map(|l| 2 * l.len() + 1).max().unwrap_or(1);
        let batch = labels.len();
        let mut table = Self {
            extended: vec![BLANK_INDEX as u32; batch * states],
            skip_mask: vec![NEG; batch * states],
            start_mask: vec![NEG; batch * states],
            last: Vec::with_capacity(batch),
            prev: Vec::with_capacity(batch),
            prev_mask: Vec::with_capacity(batch),
            divisors: Vec::with_capacity(batch),
            states,
        };
        for (n, label) in labels.iter().enumerate() {
            let row = n * states;
            for (i, &class) in label.iter().enumerate() {
                let s = 2 * i + 1;
                table.extended[row + s] = class;
                if i > 0 && label[i - 1] != class {
                    table.skip_mask[row + s] = 0.0;
                }
            }
            let used = 2 * label.len() + 1;
            table.start_mask[row] = 0.0;
            if used > 1 {
                table.start_mask[row + 1] = 0.0;
            }
            table.last.push((used - 1) as u32);
            table.prev.push(used.saturating_sub(2) as u32);
            table.prev_mask.push(if used > 1 { 0.0 } else { NEG });
            table.divisors.push(label.len().max(1) as f32);
        }
        Ok(table)
    }
}

/// Numerically stable log-sum-exp over the first axis of a stack.
fn log_sum_exp(parts: &[Tensor]) -> candle_core::Result<Tensor> {
    let stacked = Tensor::stack(parts, 0)?;
    let max = stacked.max_keepdim(0)?.detach();
    let sum = stacked.broadcast_sub(&max)?.exp()?.sum_keepdim(0)?;
    (sum.log()? + max)?.squeeze(0)
}

fn shifted(alpha: &Tensor, by: usize) -> candle_core::Result<Tensor> {
    let (n, s) = alpha.dims2()?;
    let fill = Tensor::full(NEG, (n, by), alpha.device())?;
    Tensor::cat(&[&fill, &alpha.narrow(1, 0, s - by)?], 1)
}

fn forward(logits: &Tensor, table: &Alignment, device: &Device) -> candle_core::Result<Tensor> {
    let (n, _, time_steps) = logits.dims3()?;
    let states = table.states;
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, 1)?;

    let index = Tensor::from_vec(table.extended.clone(), (n, states, 1), device)?
        .broadcast_as((n, states, time_steps))?
        .contiguous()?;
    let emissions = log_probs.gather(&index, 1)?;
    let skip_mask = Tensor::from_vec(table.skip_mask.clone(), (n, states), device)?;
    let start_mask = Tensor::from_vec(table.start_mask.clone(), (n, states), device)?;

    let mut alpha = emissions.narrow(2, 0, 1)?.squeeze(2)?.add(&start_mask)?;
    for t in 1..time_steps {
        let emission = emissions.narrow(2, t, 1)?.squeeze(2)?;
        let merged = match states {
            1 => alpha,
            2 => log_sum_exp(&[alpha.clone(), shifted(&alpha, 1)?])?,
            _ => log_sum_exp(&[
                alpha.clone(),
                shifted(&alpha, 1)?,
                shifted(&alpha, 2)?.add(&skip_mask)?,
            ])?,
        };
        alpha = merged.add(&emission)?;
    }

    let last = Tensor::from_vec(table.last.clone(), (n, 1), device)?;
    let prev = Tensor::from_vec(table.prev.clone(), (n, 1), device)?;
    let prev_mask = Tensor::from_vec(table.prev_mask.clone(), (n, 1), device)?;
    let log_likelihood = log_sum_exp(&[
        alpha.gather(&last, 1)?,
        alpha.gather(&prev, 1)?.add(&prev_mask)?,
    ])?
    .squeeze(D::Minus1)?;

    let divisors = Tensor::from_vec(table.divisors.clone(), n, device)?;
    log_likelihood.neg()?.div(&divisors)?.mean_all()
}

/// CTC loss of `(N, classes, T)` logits against BLANK-padded `(N, L)` targets.
///
/// Each sample's negative log-likelihood is divided by its target length
/// (at least 1) and the result is averaged over the batch. Target lengths are
/// the number of non-BLANK entries.
///
/// # Errors
///
/// [`LprError::InvalidInput`] for mismatched ranks or batch sizes, and for
/// targets that cannot be aligned within `T` time-steps.
pub fn ctc_loss(logits: &Tensor, targets: &Tensor) -> LprResult<Tensor> {
    validate_rank(logits, 3, "logits")?;
    validate_rank(targets, 2, "targets")?;
    let (n, _, time_steps) = logits
        .dims3()
        .map_err(|e| LprError::loss("read logits dims", e))?;
    let rows = targets
        .to_dtype(DType::U32)
        .and_then(|t| t.to_vec2::<u32>())
        .map_err(|e| LprError::loss("copy targets to host", e))?;
    if rows.len() != n {
        return Err(LprError::InvalidInput {
            message: format!(
                "logits hold {} samples but targets hold {}",
                n,
                rows.len()
            ),
        });
    }

    let table = Alignment::new(&rows, time_steps)?;
    forward(logits, &table, logits.device()).map_err(|e| LprError::loss("CTC forward recursion", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;

    /// `(1, 2, T)` logits with p(BLANK) = 0.6, p(A) = 0.4 at every step.
    fn two_class_logits(batch: usize, time_steps: usize) -> Tensor {
        let mut data = Vec::new();
        for _ in 0..batch {
            data.extend(std::iter::repeat_n(0.6f32.ln(), time_steps));
            data.extend(std::iter::repeat_n(0.4f32.ln(), time_steps));
        }
        Tensor::from_vec(data, (batch, 2, time_steps), &Device::Cpu).unwrap()
    }

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn single_symbol_probability() {
        // p("A") = 0.4 * 0.4 + 0.4 * 0.6 + 0.6 * 0.4
        let targets = Tensor::new(&[[1u32]], &Device::Cpu).unwrap();
        let loss = ctc_loss(&two_class_logits(1, 2), &targets).unwrap();
        assert!((scalar(&loss) + 0.64f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn two_symbols_are_divided_by_length() {
        // Uniform over three classes, T = 2: only the path (A, B) yields "AB".
        let logits = Tensor::zeros((1, 3, 2), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[1u32, 2]], &Device::Cpu).unwrap();
        let loss = ctc_loss(&logits, &targets).unwrap();
        assert!((scalar(&loss) - 9f32.ln() / 2.0).abs() < 1e-5);
    }

    #[test]
    fn batch_mean_with_empty_target() {
        // Sample 0: -ln 0.64 / 1; sample 1 (empty): -ln 0.36 / 1.
        let targets = Tensor::new(&[[1u32, 0], [0, 0]], &Device::Cpu).unwrap();
        let loss = ctc_loss(&two_class_logits(2, 2), &targets).unwrap();
        let expected = -(0.64f32.ln() + 0.36f32.ln()) / 2.0;
        assert!((scalar(&loss) - expected).abs() < 1e-5);
    }

    #[test]
    fn repeated_symbols_need_a_blank_between() {
        let targets = Tensor::new(&[[1u32, 1]], &Device::Cpu).unwrap();
        assert!(matches!(
            ctc_loss(&two_class_logits(1, 2), &targets),
            Err(LprError::InvalidInput { .. })
        ));
        // With three steps the only path is (A, BLANK, A): 0.4 * 0.6 * 0.4.
        let loss = ctc_loss(&two_class_logits(1, 3), &targets).unwrap();
        assert!((scalar(&loss) + (0.4f32 * 0.6 * 0.4).ln() / 2.0).abs() < 1e-5);
    }

    #[test]
    fn gradients_reach_logits() {
        let logits = Var::from_tensor(&two_class_logits(2, 4)).unwrap();
        let targets = Tensor::new(&[[1u32, 0], [1, 1]], &Device::Cpu).unwrap();
        let loss = ctc_loss(logits.as_tensor(), &targets).unwrap();
        let grads = loss.backward().unwrap();
        let grad = grads.get(logits.as_tensor()).unwrap();
        assert_eq!(grad.dims(), &[2, 2, 4]);
        let magnitude = grad.abs().unwrap().sum_all().unwrap();
        assert!(scalar(&magnitude) > 0.0);
    }

    #[test]
    fn rejects_mismatched_batches() {
        let targets = Tensor::new(&[[1u32], [1]], &Device::Cpu).unwrap();
        assert!(ctc_loss(&two_class_logits(1, 2), &targets).is_err());
        let flat = Tensor::new(&[1u32], &Device::Cpu).unwrap();
        assert!(ctc_loss(&two_class_logits(1, 2), &flat).is_err());
    }
}
