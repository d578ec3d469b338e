use std::fs::{self, OpenOptions};
use std::io::{Cursor, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Local;
use image::{DynamicImage, ImageFormat};

pub const MAX_FRAGMENT_LEN: usize = 50;
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Keeps `[A-Za-z0-9_.-]` after turning spaces into underscores, then truncates.
pub fn sanitize_fragment(text: &str, max_len: usize) -> String {
    text.replace(' ', "_")
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
        .take(max_len)
        .collect()
}

/// File stem for a generated image, without the `.png` extension.
pub fn stored_file_stem(
    prompt: Option<&str>,
    source_file_name: Option<&str>,
    timestamp: &str,
) -> String {
    let prompt = prompt
        .map(|text| sanitize_fragment(text, MAX_FRAGMENT_LEN))
        .filter(|value| !value.is_empty());
    let source = source_file_name
        .map(|name| sanitize_fragment(file_stem(name), MAX_FRAGMENT_LEN))
        .filter(|value| !value.is_empty());

    match (source, prompt) {
        (Some(source), Some(prompt)) => format!("from_{source}_with_{prompt}_{timestamp}"),
        (Some(source), None) => format!("from_{source}_{timestamp}"),
        (None, Some(prompt)) => format!("{prompt}_{timestamp}"),
        (None, None) => format!("generated_image_{timestamp}"),
    }
}

fn file_stem(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(name)
}

/// Directory of generated PNGs. Files are created once and never overwritten.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create storage dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn save(
        &self,
        image: &DynamicImage,
        prompt: Option<&str>,
        source_file_name: Option<&str>,
    ) -> Result<PathBuf> {
        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        self.save_with_timestamp(image, prompt, source_file_name, &timestamp)
    }

    fn save_with_timestamp(
        &self,
        image: &DynamicImage,
        prompt: Option<&str>,
        source_file_name: Option<&str>,
        timestamp: &str,
    ) -> Result<PathBuf> {
        let bytes = encode_png(image)?;
        let stem = stored_file_stem(prompt, source_file_name, timestamp);

        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let file_name = if attempt == 1 {
                format!("{stem}.png")
            } else {
                format!("{stem}_{attempt}.png")
            };
            let path = self.root.join(file_name);
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create {}", path.display()))
                }
            };
            let written = file.write_all(&bytes).and_then(|_| file.sync_all());
            drop(file);
            if let Err(err) = written {
                let _ = fs::remove_file(&path);
                return Err(err).with_context(|| format!("failed to write {}", path.display()));
            }
            return Ok(path);
        }
        bail!("no free file name for {stem}.png after {MAX_NAME_ATTEMPTS} attempts")
    }

    /// Reads an image from anywhere on disk; source images need not live in the store.
    pub fn load(&self, path: &Path) -> Result<DynamicImage> {
        if !path.is_file() {
            bail!("image file not found at {}", path.display());
        }
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        image::load_from_memory(&bytes)
            .with_context(|| format!("failed to decode {}", path.display()))
    }

    /// Stored PNGs, sorted by file name.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("failed to list {}", self.root.display()))?
        {
            let path = entry?.path();
            let is_png = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("png"))
                .unwrap_or(false);
            if is_png && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

/// PNG bytes for `image`; float buffers are stored as 16-bit RGBA.
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let normalized;
    let image = match image {
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => {
            normalized = DynamicImage::ImageRgba16(image.to_rgba16());
            &normalized
        }
        other => other,
    };
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("PNG encoding failed")?;
    Ok(bytes)
}
