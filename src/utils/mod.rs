//! Utility functions for loading plate images and setting up logging.

use image::RgbImage;
use std::path::{Path, PathBuf};

use crate::core::{LprError, LprResult};

/// Initializes the tracing subscriber for logging.
///
/// This function sets up the tracing subscriber with environment filter and formatting layer.
/// It's typically called at the start of an application to enable logging.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Loads an image from disk as RGB.
pub fn load_image(path: &Path) -> LprResult<RgbImage> {
    let img = image::open(path).map_err(LprError::ImageLoad)?;
    Ok(img.to_rgb8())
}

/// Loads several images, failing on the first unreadable one.
pub fn load_images<P: AsRef<Path>>(paths: &[P]) -> LprResult<Vec<RgbImage>> {
    paths.iter().map(|p| load_image(p.as_ref())).collect()
}

/// Plate label encoded in a file name: everything before the first `_`.
///
/// `B1234XYZ_0042.jpg` yields `B1234XYZ`; a name without `_` yields its whole stem.
pub fn plate_label_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let label = stem.split('_').next().unwrap_or(stem);
    (!label.is_empty()).then(|| label.to_string())
}

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// A plate image path with the label taken from its file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledPlate {
    pub path: PathBuf,
    pub label: String,
}

/// Lists the labeled plate images in `dir`, sorted by path.
///
/// Files without an image extension or without a label are skipped.
pub fn collect_labeled_plates(dir: &Path) -> LprResult<Vec<LabeledPlate>> {
    let mut plates = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if !is_image {
            continue;
        }
        match plate_label_from_path(&path) {
            Some(label) => plates.push(LabeledPlate { path, label }),
            None => tracing::warn!(path = %path.display(), "skipping plate without label"),
        }
    }
    plates.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(plates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_is_prefix_before_underscore() {
        assert_eq!(
            plate_label_from_path(Path::new("data/B1234XYZ_0042.jpg")).as_deref(),
            Some("B1234XYZ")
        );
        assert_eq!(
            plate_label_from_path(Path::new("L8899AB.png")).as_deref(),
            Some("L8899AB")
        );
        assert_eq!(plate_label_from_path(Path::new("_0001.png")), None);
    }

    #[test]
    fn collects_only_labeled_images() {
        let dir = std::env::temp_dir().join(format!("icvlpr-plates-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        RgbImage::new(4, 2).save(dir.join("D5678AB_1.png")).unwrap();
        RgbImage::new(4, 2).save(dir.join("AB123C_7.png")).unwrap();
        std::fs::write(dir.join("notes.txt"), "not a plate").unwrap();

        let plates = collect_labeled_plates(&dir).unwrap();
        let labels = plates.iter().map(|p| p.label.as_str()).collect::<Vec<_>>();
        assert_eq!(labels, ["AB123C", "D5678AB"]);
        let images = load_images(&plates.iter().map(|p| &p.path).collect::<Vec<_>>()).unwrap();
        assert_eq!(images[0].dimensions(), (4, 2));

        std::fs::remove_dir_all(&dir).ok();
    }
}
