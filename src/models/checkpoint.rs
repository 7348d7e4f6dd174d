//! Keyed restore of safetensors checkpoints into a [`VarMap`].
//!
//! Parameter names follow the PyTorch module layout of the reference training
//! code (`stn_layer.localization.fc2.bias`, `backbone.conv_1.weight`,
//! `pre_decoder.1.running_var`, ...). Restores are validated completely before
//! the first parameter is written, so a failed restore leaves the network
//! untouched.

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use crate::core::{LprError, LprResult};

/// Batch-norm step counters exported by PyTorch; they carry no weights.
const IGNORED_SUFFIX: &str = "num_batches_tracked";

/// How to treat key mismatches between a checkpoint and the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Any missing or unexpected key fails the restore.
    #[default]
    Strict,
    /// Matching keys are restored; mismatches are reported.
    NonStrict,
}

/// Outcome of a restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Number of parameters written.
    pub restored: usize,
    /// Network parameters absent from the checkpoint.
    pub missing: Vec<String>,
    /// Checkpoint entries with no matching parameter.
    pub unexpected: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

fn is_remote(path: &Path) -> bool {
    path.to_str().is_some_and(|p| p.contains("://"))
}

/// Reads one or more local safetensors files into a single tensor map.
///
/// # Errors
///
/// Remote locations (anything with a URL scheme) are rejected with a
/// configuration error; fetching weights is the caller's job.
pub fn load_safetensors<P: AsRef<Path>>(
    paths: &[P],
    device: &Device,
) -> LprResult<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    for path in paths {
        let path = path.as_ref();
        if is_remote(path) {
            return Err(LprError::config_error(format!(
                "checkpoint location '{}' is remote; download it and pass the local path",
                path.display()
            )));
        }
        let loaded = candle_core::safetensors::load(path, device).map_err(|e| {
            LprError::tensor_operation(&format!("load checkpoint '{}'", path.display()), e)
        })?;
        tracing::debug!(path = %path.display(), tensors = loaded.len(), "read checkpoint");
        tensors.extend(loaded);
    }
    Ok(tensors)
}

/// Writes `tensors` into the variables of `varmap`.
///
/// Shape mismatches are always fatal. In [`LoadMode::Strict`] missing and
/// unexpected keys are fatal as well and are listed in
/// [`LprError::CheckpointMismatch`].
pub fn restore(
    varmap: &VarMap,
    tensors: &HashMap<String, Tensor>,
    mode: LoadMode,
) -> LprResult<LoadReport> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| LprError::invalid_input("variable store lock is poisoned"))?;

    let expected = vars.keys().map(String::as_str).collect::<BTreeSet<_>>();
    let provided = tensors
        .keys()
        .map(String::as_str)
        .filter(|key| !key.ends_with(IGNORED_SUFFIX))
        .collect::<BTreeSet<_>>();
    let missing = expected
        .difference(&provided)
        .map(|key| key.to_string())
        .collect::<Vec<_>>();
    let unexpected = provided
        .difference(&expected)
        .map(|key| key.to_string())
        .collect::<Vec<_>>();

    let mismatched_shapes = expected
        .intersection(&provided)
        .filter_map(|&key| {
            let var = vars[key].as_tensor();
            let tensor = &tensors[key];
            (var.dims() != tensor.dims()).then(|| {
                format!(
                    "{key}: checkpoint {:?}, network {:?}",
                    tensor.dims(),
                    var.dims()
                )
            })
        })
        .collect::<Vec<_>>();
    if !mismatched_shapes.is_empty() {
        return Err(LprError::InvalidInput {
            message: format!(
                "checkpoint shapes do not match the network: {}",
                mismatched_shapes.join("; ")
            ),
        });
    }

    if mode == LoadMode::Strict && !(missing.is_empty() && unexpected.is_empty()) {
        return Err(LprError::CheckpointMismatch {
            missing,
            unexpected,
        });
    }

    let mut restored = 0;
    for &key in expected.intersection(&provided) {
        let var = &vars[key];
        tensors[key]
            .to_dtype(var.dtype())
            .and_then(|t| t.to_device(var.device()))
            .and_then(|t| var.set(&t))
            .map_err(|e| LprError::tensor_operation(&format!("restore parameter '{key}'"), e))?;
        restored += 1;
    }

    let report = LoadReport {
        restored,
        missing,
        unexpected,
    };
    if report.is_complete() {
        tracing::info!(restored, "checkpoint restored");
    } else {
        tracing::warn!(
            restored,
            missing = report.missing.len(),
            unexpected = report.unexpected.len(),
            "checkpoint partially restored"
        );
    }
    Ok(report)
}
