use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use anyhow::{bail, Result};
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};

use crate::models::ImageModel;

pub(crate) struct CountingModel {
    calls: Arc<AtomicUsize>,
}

impl CountingModel {
    pub(crate) fn new() -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

impl ImageModel for CountingModel {
    fn name(&self) -> &str {
        "counting"
    }

    fn text_to_image(&self, _prompt: &str) -> Result<DynamicImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([200, 10, 10]))))
    }

    fn image_to_image(&self, _prompt: &str, source: &DynamicImage) -> Result<DynamicImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(source.resize_exact(8, 8, FilterType::Nearest))
    }
}

pub(crate) struct FailingModel;

impl ImageModel for FailingModel {
    fn name(&self) -> &str {
        "failing"
    }

    fn text_to_image(&self, _prompt: &str) -> Result<DynamicImage> {
        bail!("out of memory")
    }
}

pub(crate) struct PanickingModel;

impl ImageModel for PanickingModel {
    fn name(&self) -> &str {
        "panicking"
    }

    fn text_to_image(&self, _prompt: &str) -> Result<DynamicImage> {
        panic!("weights corrupted")
    }
}

/// Prompts starting with "slow" block until the test sends on the gate.
pub(crate) struct GatedModel {
    gate: Mutex<mpsc::Receiver<()>>,
}

impl GatedModel {
    pub(crate) fn new() -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                gate: Mutex::new(rx),
            },
            tx,
        )
    }
}

impl ImageModel for GatedModel {
    fn name(&self) -> &str {
        "gated"
    }

    fn text_to_image(&self, prompt: &str) -> Result<DynamicImage> {
        if prompt.starts_with("slow") {
            let gate = self
                .gate
                .lock()
                .map_err(|_| anyhow::anyhow!("gate lock poisoned"))?;
            gate.recv()?;
        }
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([0, 0, 255]))))
    }
}
