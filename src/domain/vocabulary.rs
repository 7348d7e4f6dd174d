//! Symbol vocabulary shared by the network head, the decoders and the metrics.
//!
//! Class index 0 is permanently reserved for the CTC BLANK. Targets are padded
//! with the same value, so a genuine plate symbol can never map to 0.

use candle_core::{Device, Tensor};
use ndarray::Array2;
use std::collections::HashMap;
use std::path::Path;

use crate::core::LprError;

/// Class index of the CTC BLANK.
pub const BLANK_INDEX: usize = 0;

/// Display name of the BLANK class.
pub const BLANK_SYMBOL: &str = "<BLANK>";

/// Plate alphabet in class order, starting at index 1.
const INDONESIAN_PLATE_SYMBOLS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890";

/// Bidirectional mapping between plate symbols and class indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    forward: HashMap<char, usize>,
    reverse: Vec<Option<char>>,
}

impl Vocabulary {
    /// The 37-class Indonesian plate vocabulary: BLANK, `A`-`Z`, `1`-`9`, `0`.
    pub fn indonesian() -> Self {
        match Self::from_symbols(INDONESIAN_PLATE_SYMBOLS) {
            Ok(vocabulary) => vocabulary,
            Err(e) => unreachable!("built-in plate alphabet is valid: {e}"),
        }
    }

    /// Builds a vocabulary assigning indices `1..` to the symbols in order.
    pub fn from_symbols(symbols: &str) -> Result<Self, LprError> {
        let mapping = symbols
            .chars()
            .enumerate()
            .map(|(i, symbol)| (symbol, i + 1))
            .collect::<HashMap<_, _>>();
        if mapping.len() != symbols.chars().count() {
            return Err(LprError::config_error(format!(
                "vocabulary symbols must be unique, got '{symbols}'"
            )));
        }
        Self::from_mapping(mapping)
    }

    /// Builds a vocabulary from an explicit symbol to index mapping.
    ///
    /// # Errors
    ///
    /// Fails if the mapping is empty, assigns the BLANK index to a symbol, or
    /// assigns the same index twice.
    pub fn from_mapping(mapping: HashMap<char, usize>) -> Result<Self, LprError> {
        let reverse = Self::derive_reverse(&mapping)?;
        Ok(Self {
            forward: mapping,
            reverse,
        })
    }

    /// Reads a dictionary file with one symbol per line; line `i` maps to index `i + 1`.
    pub fn from_dict_file(path: &Path) -> Result<Self, LprError> {
        let content = std::fs::read_to_string(path).map_err(|e| LprError::InvalidInput {
            message: format!(
                "failed to read character dictionary from '{}': {}",
                path.display(),
                e
            ),
        })?;
        let symbols = content
            .lines()
            .filter_map(|line| line.chars().next())
            .collect::<String>();
        Self::from_symbols(&symbols)
    }

    /// Replaces the forward mapping and re-derives the reverse one.
    pub fn set_mapping(&mut self, mapping: HashMap<char, usize>) -> Result<(), LprError> {
        self.reverse = Self::derive_reverse(&mapping)?;
        self.forward = mapping;
        Ok(())
    }

    fn derive_reverse(mapping: &HashMap<char, usize>) -> Result<Vec<Option<char>>, LprError> {
        if mapping.is_empty() {
            return Err(LprError::config_error("vocabulary must contain at least one symbol"));
        }
        let size = mapping.values().copied().max().unwrap_or(BLANK_INDEX) + 1;
        let mut reverse = vec![None; size];
        for (&symbol, &index) in mapping {
            if index == BLANK_INDEX {
                return Err(LprError::config_error(format!(
                    "symbol '{symbol}' uses index {BLANK_INDEX}, which is reserved for {BLANK_SYMBOL}"
                )));
            }
            if let Some(other) = reverse[index] {
                return Err(LprError::config_error(format!(
                    "symbols '{other}' and '{symbol}' share index {index}"
                )));
            }
            reverse[index] = Some(symbol);
        }
        Ok(reverse)
    }

    /// Number of classes including BLANK.
    pub fn num_classes(&self) -> usize {
        self.reverse.len()
    }

    /// Class index of a symbol.
    pub fn index_of(&self, symbol: char) -> Option<usize> {
        self.forward.get(&symbol).copied()
    }

    /// Symbol of a class index; `None` for BLANK and unused indices.
    pub fn symbol_of(&self, index: usize) -> Option<char> {
        self.reverse.get(index).copied().flatten()
    }

    /// Encodes a plate label into class indices.
    pub fn encode(&self, label: &str) -> Result<Vec<u32>, LprError> {
        label
            .chars()
            .map(|symbol| {
                self.index_of(symbol)
                    .map(|index| index as u32)
                    .ok_or_else(|| LprError::InvalidInput {
                        message: format!("symbol '{symbol}' in label '{label}' is not in the vocabulary"),
                    })
            })
            .collect()
    }

    /// Turns class indices back into text, skipping BLANK and unknown indices.
    pub fn decode(&self, indices: &[usize]) -> String {
        indices.iter().filter_map(|&i| self.symbol_of(i)).collect()
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::indonesian()
    }
}

/// Pads encoded targets to a common length with BLANK, giving an `(N, L)` matrix.
pub fn pad_targets(targets: &[Vec<u32>]) -> Array2<u32> {
    let max_len = targets.iter().map(Vec::len).max().unwrap_or(0);
    let mut padded = Array2::from_elem((targets.len(), max_len), BLANK_INDEX as u32);
    for (row, target) in targets.iter().enumerate() {
        for (col, &index) in target.iter().enumerate() {
            padded[[row, col]] = index;
        }
    }
    padded
}

/// Pads encoded targets and uploads them as a `(N, L)` `u32` tensor.
pub fn targets_tensor(targets: &[Vec<u32>], device: &Device) -> Result<Tensor, LprError> {
    let padded = pad_targets(targets);
    let (rows, cols) = padded.dim();
    let data = padded.iter().copied().collect::<Vec<_>>();
    Tensor::from_vec(data, (rows, cols), device)
        .map_err(|e| LprError::tensor_operation("build target tensor", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indonesian_vocabulary_layout() {
        let vocab = Vocabulary::indonesian();
        assert_eq!(vocab.num_classes(), 37);
        assert_eq!(vocab.index_of('A'), Some(1));
        assert_eq!(vocab.index_of('Z'), Some(26));
        assert_eq!(vocab.index_of('1'), Some(27));
        assert_eq!(vocab.index_of('0'), Some(36));
        assert_eq!(vocab.symbol_of(BLANK_INDEX), None);
    }

    #[test]
    fn encode_decode_plate() {
        let vocab = Vocabulary::indonesian();
        let encoded = vocab.encode("B1234XY").unwrap();
        assert_eq!(encoded, vec![2, 27, 28, 29, 30, 24, 25]);
        let indices = encoded.iter().map(|&i| i as usize).collect::<Vec<_>>();
        assert_eq!(vocab.decode(&indices), "B1234XY");
        assert!(vocab.encode("b12").is_err());
    }

    #[test]
    fn mapping_must_not_use_blank() {
        let mapping = HashMap::from([('A', 0), ('B', 1)]);
        assert!(Vocabulary::from_mapping(mapping).is_err());
    }

    #[test]
    fn mapping_rejects_shared_indices() {
        let mapping = HashMap::from([('A', 1), ('B', 1)]);
        assert!(Vocabulary::from_mapping(mapping).is_err());
        assert!(Vocabulary::from_symbols("AA").is_err());
    }

    #[test]
    fn set_mapping_rederives_reverse() {
        let mut vocab = Vocabulary::indonesian();
        vocab
            .set_mapping(HashMap::from([('A', 1), ('B', 2), ('1', 3)]))
            .unwrap();
        assert_eq!(vocab.num_classes(), 4);
        assert_eq!(vocab.symbol_of(3), Some('1'));
        assert_eq!(vocab.index_of('Z'), None);
        assert_eq!(vocab.decode(&[1, 0, 2, 3]), "AB1");
    }

    #[test]
    fn failed_set_mapping_keeps_previous_state() {
        let mut vocab = Vocabulary::indonesian();
        assert!(vocab.set_mapping(HashMap::from([('A', 0)])).is_err());
        assert_eq!(vocab, Vocabulary::indonesian());
    }

    #[test]
    fn pads_with_blank() {
        let padded = pad_targets(&[vec![1, 2, 3], vec![4]]);
        assert_eq!(padded.dim(), (2, 3));
        assert_eq!(padded.row(1).to_vec(), vec![4, 0, 0]);

        let tensor = targets_tensor(&[vec![1, 2], vec![3]], &Device::Cpu).unwrap();
        assert_eq!(tensor.to_vec2::<u32>().unwrap(), vec![vec![1, 2], vec![3, 0]]);
    }
}
