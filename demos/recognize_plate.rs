//! Plate Recognition Example
//!
//! Reads the text of cropped license plate images, or scores a directory of
//! labeled plates whose file names start with the plate text (`B1234XYZ_01.jpg`).
//!
//! # Usage
//!
//! ```bash
//! cargo run --example recognize_plate -- [OPTIONS] --weights <WEIGHTS> [IMAGES]...
//! ```
//!
//! # Arguments
//!
//! * `-w, --weights` - Safetensors weight files (repeatable)
//! * `-c, --config` - Recognizer configuration JSON (default: built-in)
//! * `--dict` - Character dictionary, one symbol per line (default: built-in)
//! * `--decoder` - `greedy`, `beam` or `beam:N` (default: greedy)
//! * `--device` - `cpu`, `cuda`, `cuda:N` or `metal`
//! * `--no-stn` - Skip the spatial transformer
//! * `--no-global-context` - Skip global context fusion
//! * `--eval-dir` - Directory of labeled plates to score
//! * `--batch-size` - Images per forward pass (default: 32)
//!
//! # Examples
//!
//! ```bash
//! cargo run --release --example recognize_plate -- \
//!     -w models/lprnet.safetensors --decoder beam:5 plate1.jpg plate2.jpg
//!
//! RUST_LOG=info cargo run --release --example recognize_plate -- \
//!     -w models/lprnet.safetensors --eval-dir data/test
//! ```

use candle_core::Device;
use clap::Parser;
use icvlpr::core::RecognizerConfig;
use icvlpr::domain::{PipelineMode, RectifierState, Vocabulary, pad_targets};
use icvlpr::metrics::{CharErrorRate, RecognitionRate, SequenceAccuracy};
use icvlpr::pipeline::{PlateReader, PlateReaderBuilder};
use icvlpr::processors::DecoderKind;
use icvlpr::utils::{collect_labeled_plates, init_tracing, load_image, load_images};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

/// Command-line arguments for the plate recognition example
#[derive(Parser)]
#[command(name = "recognize_plate")]
#[command(about = "Plate Recognition Example - reads license plate text from cropped images")]
struct Args {
    /// Safetensors weight files
    #[arg(short, long, required = true)]
    weights: Vec<PathBuf>,

    /// Paths to input plate images
    images: Vec<PathBuf>,

    /// Recognizer configuration JSON
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Character dictionary, one symbol per line
    #[arg(long)]
    dict: Option<PathBuf>,

    /// Decoder: greedy, beam or beam:N
    #[arg(long, default_value = "greedy")]
    decoder: DecoderKind,

    /// Device to use for inference (cpu, cuda, cuda:N, metal)
    #[arg(long, default_value = "cpu")]
    device: String,

    /// Skip the spatial transformer
    #[arg(long)]
    no_stn: bool,

    /// Skip global context fusion
    #[arg(long)]
    no_global_context: bool,

    /// Directory of labeled plates to score
    #[arg(long)]
    eval_dir: Option<PathBuf>,

    /// Images per forward pass
    #[arg(long, default_value = "32")]
    batch_size: usize,
}

fn parse_device(name: &str) -> Result<Device, Box<dyn std::error::Error>> {
    let device = match name {
        "cpu" => Device::Cpu,
        "cuda" => Device::new_cuda(0)?,
        "metal" => Device::new_metal(0)?,
        other => match other.strip_prefix("cuda:") {
            Some(ordinal) => Device::new_cuda(ordinal.parse()?)?,
            None => return Err(format!("unknown device '{other}'").into()),
        },
    };
    Ok(device)
}

fn recognize_images(reader: &PlateReader, paths: &[PathBuf], batch_size: usize) {
    for chunk in paths.chunks(batch_size) {
        let mut images = Vec::new();
        let mut loaded = Vec::new();
        for path in chunk {
            match load_image(path) {
                Ok(image) => {
                    images.push(image);
                    loaded.push(path);
                }
                Err(e) => error!("Failed to load image {}: {}", path.display(), e),
            }
        }
        if images.is_empty() {
            continue;
        }
        match reader.recognize(&images) {
            Ok(recognition) => {
                for ((path, text), score) in loaded
                    .iter()
                    .zip(&recognition.texts)
                    .zip(&recognition.scores)
                {
                    println!("{}\t{}\t{:.4}", path.display(), text, score);
                }
            }
            Err(e) => error!("Recognition failed: {}", e),
        }
    }
}

fn evaluate(
    reader: &PlateReader,
    dir: &Path,
    batch_size: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let plates = collect_labeled_plates(dir)?;
    info!("Scoring {} labeled plates in {}", plates.len(), dir.display());

    let mut rate = RecognitionRate::new();
    let mut accuracy = SequenceAccuracy::new();
    let mut cer = CharErrorRate::new();
    let start = Instant::now();

    for chunk in plates.chunks(batch_size) {
        let mut targets = Vec::new();
        let mut paths = Vec::new();
        for plate in chunk {
            match reader.vocabulary().encode(&plate.label) {
                Ok(encoded) => {
                    targets.push(encoded);
                    paths.push(&plate.path);
                }
                Err(e) => warn!("Skipping {}: {}", plate.path.display(), e),
            }
        }
        if paths.is_empty() {
            continue;
        }
        let images = load_images(&paths)?;
        let recognition = reader.recognize(&images)?;
        let padded = pad_targets(&targets);
        rate.update_rows(&recognition.sequences, padded.view())?;
        accuracy.update_rows(&recognition.sequences, padded.view())?;
        cer.update_rows(&recognition.sequences, padded.view())?;
    }

    info!("Evaluated in {:.2?}", start.elapsed());
    println!("{rate}");
    println!("{accuracy}");
    println!("{cer}");
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    if args.images.is_empty() && args.eval_dir.is_none() {
        error!("Pass plate images or --eval-dir");
        return Err("no input given".into());
    }
    if args.batch_size == 0 {
        return Err("--batch-size must be positive".into());
    }

    let config = match &args.config {
        Some(path) => RecognizerConfig::from_path(path)?,
        None => RecognizerConfig::default(),
    };
    let vocabulary = match &args.dict {
        Some(path) => Vocabulary::from_dict_file(path)?,
        None => Vocabulary::indonesian(),
    };
    let rectifier = if args.no_stn {
        RectifierState::Disabled
    } else {
        RectifierState::Enabled
    };
    let mode = PipelineMode::inference()
        .with_rectifier(rectifier)
        .with_global_context(!args.no_global_context);

    info!("Using device: {}", args.device);
    let device = parse_device(&args.device)?;

    let reader = PlateReaderBuilder::new()
        .config(config)
        .vocabulary(vocabulary)
        .decoder(args.decoder)
        .mode(mode)
        .device(device)
        .build(&args.weights)?;
    info!("Plate reader built successfully");

    if !args.images.is_empty() {
        recognize_images(&reader, &args.images, args.batch_size);
    }
    if let Some(dir) = &args.eval_dir {
        evaluate(&reader, dir, args.batch_size)?;
    }
    Ok(())
}
