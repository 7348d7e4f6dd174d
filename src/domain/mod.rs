//! Domain types shared across the pipeline.

pub mod mode;
pub mod vocabulary;

pub use mode::{PipelineMode, RectifierSchedule, RectifierState};
pub use vocabulary::{BLANK_INDEX, BLANK_SYMBOL, Vocabulary, pad_targets, targets_tensor};
