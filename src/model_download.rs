use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;

/// A model file the landmarker needs, with the place to fetch it from when it is missing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelAsset {
    pub label: &'static str,
    pub file_name: &'static str,
    pub url: &'static str,
}

pub const HANDPOSE_ESTIMATOR: ModelAsset = ModelAsset {
    label: "handpose estimator",
    file_name: "handpose_estimation_mediapipe_2023feb.onnx",
    url: "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models/handpose_estimation_mediapipe_2023feb.onnx",
};

pub const PALM_DETECTOR: ModelAsset = ModelAsset {
    label: "palm detector",
    file_name: "palm_detection_mediapipe_2023feb.onnx",
    url: "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models/palm_detection_mediapipe_2023feb.onnx",
};

const MODEL_DIR: &str = "models";

impl ModelAsset {
    pub fn default_path(&self) -> PathBuf {
        PathBuf::from(MODEL_DIR).join(self.file_name)
    }
}

/// Where the landmarker loads its two models from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelPaths {
    pub handpose: PathBuf,
    pub palm_detector: PathBuf,
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self {
            handpose: HANDPOSE_ESTIMATOR.default_path(),
            palm_detector: PALM_DETECTOR.default_path(),
        }
    }
}

/// Downloads `asset` to `path` unless a file is already there.
pub fn ensure_model_ready(asset: &ModelAsset, path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        log::debug!("{} model present at {}", asset.label, path.display());
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create model directory {}", parent.display()))?;
    }

    download_to_path(asset, path)
        .with_context(|| format!("failed to fetch {} model", asset.label))
}

fn download_to_path(asset: &ModelAsset, dest: &Path) -> anyhow::Result<()> {
    log::info!(
        "downloading {} model from {} to {}",
        asset.label,
        asset.url,
        dest.display()
    );

    let mut response = Client::new()
        .get(asset.url)
        .send()
        .context("failed to start model download")?
        .error_for_status()
        .context("model download returned error status")?;

    let progress = progress_bar(response.content_length());
    if let Err(err) = write_download(&mut response, dest, &progress) {
        progress.abandon_with_message(format!("{} model download failed", asset.label));
        return Err(err);
    }

    progress.finish_with_message(format!("{} model ready", asset.label));
    Ok(())
}

/// Streams `reader` into a `.download` file next to `dest`, then renames it into place. The
/// temp file is removed if anything fails.
fn write_download(
    reader: &mut impl Read,
    dest: &Path,
    progress: &ProgressBar,
) -> anyhow::Result<()> {
    let tmp_path = dest.with_extension("download");
    let result = copy_to_temp(reader, &tmp_path, progress).and_then(|()| {
        fs::rename(&tmp_path, dest).with_context(|| {
            format!(
                "failed to move {} into place at {}",
                tmp_path.display(),
                dest.display()
            )
        })
    });

    if result.is_err() && tmp_path.exists() {
        if let Err(err) = fs::remove_file(&tmp_path) {
            log::warn!("could not remove partial download {}: {err}", tmp_path.display());
        }
    }
    result
}

fn copy_to_temp(
    reader: &mut impl Read,
    tmp_path: &Path,
    progress: &ProgressBar,
) -> anyhow::Result<()> {
    let mut file = fs::File::create(tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut buffer = [0u8; 16 * 1024];
    loop {
        let read = reader
            .read(&mut buffer)
            .context("failed while reading model bytes")?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .context("failed while writing model to disk")?;
        progress.inc(read as u64);
    }

    file.sync_all()
        .context("failed to flush downloaded model to disk")
}

fn progress_bar(total: Option<u64>) -> ProgressBar {
    match total {
        Some(total) if total > 0 => {
            let pb = ProgressBar::new(total);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            ) {
                pb.set_style(style.progress_chars("=>-"));
            }
            pb
        }
        _ => {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.green} downloading model") {
                pb.set_style(style);
            }
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        }
    }
}
