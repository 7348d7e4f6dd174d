//! Pre- and post-processing around the recognition network.
//!
//! # Modules
//!
//! * `preprocess` - Resizing plate crops into input batches
//! * `decode` - CTC greedy and beam-search decoding of network output
//! * `loss` - CTC training loss over network logits

mod decode;
mod loss;
mod preprocess;

pub use decode::*;
pub use loss::ctc_loss;
pub use preprocess::PlateImageProcessor;
