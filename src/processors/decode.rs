//! CTC decoding of per-timestep class scores into label sequences.
//!
//! Both decoders read a `(classes, T)` score grid per sample, normalize each
//! time-step with a log-softmax and reduce raw paths to labels with
//! [`ctc_collapse`]: consecutive repeats merge, then BLANK is dropped. The beam
//! decoder additionally sums the probability of every raw path that collapses
//! to the same label, which lets it recover labels no single path dominates.

use candle_core::{DType, Tensor};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::core::{ConfigError, LprError, LprResult};
use crate::domain::BLANK_INDEX;

/// Default number of candidates kept by the beam decoder.
pub const DEFAULT_BEAM_WIDTH: usize = 5;

/// Applies one raw class to a partially collapsed label.
///
/// `previous` is the raw class emitted at the step before. The class is
/// appended unless it repeats `previous` or is BLANK.
fn collapse_step(label: &mut Vec<usize>, previous: Option<usize>, class: usize) {
    if previous != Some(class) && class != BLANK_INDEX {
        label.push(class);
    }
}

/// Reduces a raw per-timestep path to a label: merge consecutive repeats, then drop BLANK.
///
/// A label without BLANK and without adjacent repeats is returned unchanged.
/// Labels with repeats separated by BLANK are not fixed points: `A _ A`
/// collapses to `A A`, which collapses again to `A`.
pub fn ctc_collapse(path: &[usize]) -> Vec<usize> {
    let mut label = Vec::with_capacity(path.len());
    let mut previous = None;
    for &class in path {
        collapse_step(&mut label, previous, class);
        previous = Some(class);
    }
    label
}

/// A decoded label with the log-probability the decoder assigned to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// Collapsed class indices, BLANK-free.
    pub indices: Vec<usize>,
    /// Log-probability of the best path (greedy) or of the label (beam).
    pub log_prob: f32,
}

impl Decoded {
    pub fn confidence(&self) -> f32 {
        self.log_prob.exp()
    }
}

/// Column-wise log-softmax of a `(classes, T)` score grid.
fn log_softmax_columns(scores: ArrayView2<f32>) -> Array2<f32> {
    let mut out = scores.to_owned();
    for mut column in out.columns_mut() {
        let max = column.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let log_sum = column.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
        column.mapv_inplace(|v| v - log_sum);
    }
    out
}

fn log_add_exp(a: f32, b: f32) -> f32 {
    if a == f32::NEG_INFINITY {
        return b;
    }
    if b == f32::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// A decoder from a `(classes, T)` score grid to a label.
pub trait SequenceDecoder {
    fn decode(&self, scores: ArrayView2<f32>) -> Decoded;
}

/// Best class per time-step, then collapse.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyDecoder;

impl SequenceDecoder for GreedyDecoder {
    fn decode(&self, scores: ArrayView2<f32>) -> Decoded {
        let log_probs = log_softmax_columns(scores);
        let mut path = Vec::with_capacity(log_probs.ncols());
        let mut log_prob = 0.0;
        for column in log_probs.columns() {
            // First maximum wins ties.
            let (best, best_lp) = column.iter().enumerate().fold(
                (BLANK_INDEX, f32::NEG_INFINITY),
                |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) },
            );
            path.push(best);
            log_prob += best_lp;
        }
        Decoded {
            indices: ctc_collapse(&path),
            log_prob,
        }
    }
}

/// Prefix beam search over collapsed labels.
///
/// Candidates are keyed by their collapsed prefix and the last raw class, the
/// smallest state from which the collapse of any extension is determined.
/// Equal keys are merged by log-sum-exp and the `beam_width` most probable
/// keys survive each step. At the end, keys sharing a prefix are merged and the
/// most probable prefix is returned.
#[derive(Debug, Clone, Copy)]
pub struct BeamSearchDecoder {
    beam_width: usize,
}

type BeamKey = (Vec<usize>, Option<usize>);

impl BeamSearchDecoder {
    pub fn new(beam_width: usize) -> Result<Self, ConfigError> {
        if beam_width == 0 {
            return Err(ConfigError::InvalidConfig {
                message: "beam_width must be at least 1".to_string(),
            });
        }
        Ok(Self { beam_width })
    }

    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    /// Extends every candidate by every class. Insertion order is kept so
    /// equally probable keys rank in a deterministic order.
    fn step(beams: &[(BeamKey, f32)], column: ndarray::ArrayView1<f32>) -> Vec<(BeamKey, f32)> {
        let mut next: Vec<(BeamKey, f32)> = Vec::with_capacity(beams.len() * column.len());
        let mut slots: HashMap<BeamKey, usize> = HashMap::new();
        for ((prefix, last), score) in beams {
            for (class, &lp) in column.iter().enumerate() {
                let mut extended = prefix.clone();
                collapse_step(&mut extended, *last, class);
                let key = (extended, Some(class));
                let score = score + lp;
                match slots.get(&key) {
                    Some(&slot) => next[slot].1 = log_add_exp(next[slot].1, score),
                    None => {
                        slots.insert(key.clone(), next.len());
                        next.push((key, score));
                    }
                }
            }
        }
        next
    }
}

impl SequenceDecoder for BeamSearchDecoder {
    fn decode(&self, scores: ArrayView2<f32>) -> Decoded {
        let log_probs = log_softmax_columns(scores);
        let mut beams: Vec<(BeamKey, f32)> = vec![((Vec::new(), None), 0.0)];
        for column in log_probs.columns() {
            let mut next = Self::step(&beams, column);
            next.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            next.truncate(self.beam_width);
            beams = next;
        }

        let mut labels: Vec<(Vec<usize>, f32)> = Vec::with_capacity(beams.len());
        for ((prefix, _), score) in beams {
            match labels.iter_mut().find(|(p, _)| *p == prefix) {
                Some((_, total)) => *total = log_add_exp(*total, score),
                None => labels.push((prefix, score)),
            }
        }
        labels
            .into_iter()
            .fold(None::<(Vec<usize>, f32)>, |best, candidate| match best {
                Some(b) if b.1 >= candidate.1 => Some(b),
                _ => Some(candidate),
            })
            .map(|(indices, log_prob)| Decoded { indices, log_prob })
            .unwrap_or(Decoded {
                indices: Vec::new(),
                log_prob: 0.0,
            })
    }
}

/// Decoder selection, as found in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DecoderKind {
    #[default]
    Greedy,
    Beam {
        #[serde(default = "default_beam_width")]
        beam_width: usize,
    },
}

fn default_beam_width() -> usize {
    DEFAULT_BEAM_WIDTH
}

impl DecoderKind {
    /// Parses `greedy`, `beam` or `beam:<width>`.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        let normalized = name.trim().to_ascii_lowercase();
        match normalized.split_once(':') {
            None if normalized == "greedy" => Ok(Self::Greedy),
            None if normalized == "beam" => Ok(Self::Beam {
                beam_width: DEFAULT_BEAM_WIDTH,
            }),
            Some(("beam", width)) => {
                let beam_width = width.parse().map_err(|_| ConfigError::InvalidConfig {
                    message: format!("beam width must be a positive integer, got '{width}'"),
                })?;
                let kind = Self::Beam { beam_width };
                kind.validate()?;
                Ok(kind)
            }
            _ => Err(ConfigError::UnknownDecoder(name.to_string())),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Greedy => Ok(()),
            Self::Beam { beam_width } => BeamSearchDecoder::new(*beam_width).map(|_| ()),
        }
    }
}

impl FromStr for DecoderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

/// A configured CTC decoder.
#[derive(Debug, Clone, Copy)]
pub enum CtcDecoder {
    Greedy(GreedyDecoder),
    Beam(BeamSearchDecoder),
}

impl CtcDecoder {
    pub fn new(kind: DecoderKind) -> Result<Self, ConfigError> {
        Ok(match kind {
            DecoderKind::Greedy => Self::Greedy(GreedyDecoder),
            DecoderKind::Beam { beam_width } => Self::Beam(BeamSearchDecoder::new(beam_width)?),
        })
    }

    /// Decodes an `(N, classes, T)` score grid.
    pub fn decode_batch(&self, scores: &Array3<f32>) -> Vec<Decoded> {
        let decoded = scores
            .axis_iter(Axis(0))
            .map(|grid| self.decode(grid))
            .collect::<Vec<_>>();

        let with_text = decoded.iter().filter(|d| !d.indices.is_empty()).count();
        tracing::debug!(
            "CTC decode summary: decoder={}, batch_size={}, batches_with_text={}, empty_batches={}",
            self.name(),
            decoded.len(),
            with_text,
            decoded.len() - with_text
        );
        decoded
    }

    /// Decodes `(N, classes, T)` logits straight from the network.
    pub fn decode_tensor(&self, logits: &Tensor) -> LprResult<Vec<Decoded>> {
        let (n, c, t) = logits.dims3().map_err(|_| LprError::InvalidInput {
            message: format!(
                "expected logits of shape (N, classes, T), got {:?}",
                logits.dims()
            ),
        })?;
        let data = logits
            .to_dtype(DType::F32)
            .and_then(|l| l.flatten_all())
            .and_then(|l| l.to_vec1::<f32>())
            .map_err(|e| LprError::post_processing("copy logits to host", e))?;
        let scores = Array3::from_shape_vec((n, c, t), data)
            .map_err(|e| LprError::post_processing("reshape logits", e))?;
        Ok(self.decode_batch(&scores))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Greedy(_) => "greedy",
            Self::Beam(_) => "beam",
        }
    }
}

impl SequenceDecoder for CtcDecoder {
    fn decode(&self, scores: ArrayView2<f32>) -> Decoded {
        match self {
            Self::Greedy(decoder) => decoder.decode(scores),
            Self::Beam(decoder) => decoder.decode(scores),
        }
    }
}
