use std::io::Cursor;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Output edge length; the distilled model is trained at 512x512.
pub const IMAGE_SIZE: u32 = 512;
pub const TEXT_TO_IMAGE_STEPS: u32 = 1;
pub const IMAGE_TO_IMAGE_STEPS: u32 = 2;
pub const GUIDANCE_SCALE: f64 = 0.0;
pub const IMAGE_TO_IMAGE_STRENGTH: f64 = 0.5;

pub const DEFAULT_LOCAL_MODEL_URL: &str = "http://127.0.0.1:7860";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A generative image backend. Calls block until inference finishes.
pub trait ImageModel: Send + Sync {
    fn name(&self) -> &str;

    fn text_to_image(&self, prompt: &str) -> Result<DynamicImage>;

    fn image_to_image(&self, prompt: &str, source: &DynamicImage) -> Result<DynamicImage> {
        let _ = (prompt, source);
        bail!("image-to-image is not supported by {}", self.name())
    }
}

/// Offline backend that paints deterministic images from the prompt text.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryrunModel;

impl ImageModel for DryrunModel {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn text_to_image(&self, prompt: &str) -> Result<DynamicImage> {
        Ok(DynamicImage::ImageRgb8(gradient_from_prompt(
            prompt, IMAGE_SIZE, IMAGE_SIZE,
        )))
    }

    fn image_to_image(&self, prompt: &str, source: &DynamicImage) -> Result<DynamicImage> {
        let mut image = source
            .resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::Lanczos3)
            .to_rgb8();
        let (r, g, b) = color_from_prompt(prompt, 0);
        for pixel in image.pixels_mut() {
            let [pr, pg, pb] = pixel.0;
            *pixel = Rgb([
                lerp_channel(pr, r, IMAGE_TO_IMAGE_STRENGTH),
                lerp_channel(pg, g, IMAGE_TO_IMAGE_STRENGTH),
                lerp_channel(pb, b, IMAGE_TO_IMAGE_STRENGTH),
            ]);
        }
        Ok(DynamicImage::ImageRgb8(image))
    }
}

fn gradient_from_prompt(prompt: &str, width: u32, height: u32) -> RgbImage {
    let top = color_from_prompt(prompt, 0);
    let bottom = color_from_prompt(prompt, 1);
    let span = height.saturating_sub(1).max(1) as f64;
    RgbImage::from_fn(width, height, |_, y| {
        let t = y as f64 / span;
        Rgb([
            lerp_channel(top.0, bottom.0, t),
            lerp_channel(top.1, bottom.1, t),
            lerp_channel(top.2, bottom.2, t),
        ])
    })
}

fn color_from_prompt(prompt: &str, salt: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(salt.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn lerp_channel(from: u8, to: u8, t: f64) -> u8 {
    let value = from as f64 + (to as f64 - from as f64) * t.clamp(0.0, 1.0);
    value.round().clamp(0.0, 255.0) as u8
}

/// Step count that still runs at least one denoising step at `strength`.
pub fn image_to_image_steps(steps: u32, strength: f64) -> u32 {
    let mut steps = steps.max(1);
    if !(strength > 0.0 && strength <= 1.0) {
        return steps;
    }
    while (steps as f64 * strength).floor() < 1.0 {
        steps += 1;
    }
    steps
}

#[derive(Debug, Serialize)]
struct TextToImagePayload<'a> {
    prompt: &'a str,
    steps: u32,
    cfg_scale: f64,
    width: u32,
    height: u32,
    batch_size: u32,
}

#[derive(Debug, Serialize)]
struct ImageToImagePayload<'a> {
    prompt: &'a str,
    init_images: Vec<String>,
    denoising_strength: f64,
    steps: u32,
    cfg_scale: f64,
    width: u32,
    height: u32,
    batch_size: u32,
}

#[derive(Debug, Deserialize)]
struct CheckpointInfo {
    #[serde(default)]
    title: String,
    #[serde(default)]
    model_name: String,
}

/// Client for a Stable-Diffusion-WebUI-compatible server on this machine.
pub struct LocalDiffusionModel {
    api_base: String,
    http: HttpClient,
    checkpoint: String,
}

impl LocalDiffusionModel {
    /// Probes the server once and fails if it is unreachable or has no model loaded.
    pub fn connect(api_base: &str) -> Result<Self> {
        let api_base = api_base.trim().trim_end_matches('/').to_string();
        if api_base.is_empty() {
            bail!("model server URL is empty");
        }
        let http = HttpClient::builder()
            .timeout(None::<Duration>)
            .build()
            .context("failed to build HTTP client")?;

        let response = http
            .get(format!("{api_base}/sdapi/v1/sd-models"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .with_context(|| format!("model server not reachable at {api_base}"))?;
        let payload = response_json_or_error("sd-models", response)?;
        let checkpoints: Vec<CheckpointInfo> =
            serde_json::from_value(payload).context("unexpected checkpoint listing")?;
        let checkpoint = checkpoints
            .into_iter()
            .map(|info| {
                if info.model_name.trim().is_empty() {
                    info.title
                } else {
                    info.model_name
                }
            })
            .find(|name| !name.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("model server at {api_base} has no checkpoint loaded"))?;

        Ok(Self {
            api_base,
            http,
            checkpoint,
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn checkpoint(&self) -> &str {
        &self.checkpoint
    }

    fn post_generation<P: Serialize>(&self, endpoint: &str, payload: &P) -> Result<DynamicImage> {
        let url = format!("{}/sdapi/v1/{endpoint}", self.api_base);
        let response = self
            .http
            .post(&url)
            .json(payload)
            .send()
            .with_context(|| format!("{endpoint} request failed"))?;
        let body = response_json_or_error(endpoint, response)?;
        decode_first_image(&body)
    }
}

impl ImageModel for LocalDiffusionModel {
    fn name(&self) -> &str {
        "local-diffusion"
    }

    fn text_to_image(&self, prompt: &str) -> Result<DynamicImage> {
        let payload = TextToImagePayload {
            prompt,
            steps: TEXT_TO_IMAGE_STEPS,
            cfg_scale: GUIDANCE_SCALE,
            width: IMAGE_SIZE,
            height: IMAGE_SIZE,
            batch_size: 1,
        };
        self.post_generation("txt2img", &payload)
    }

    fn image_to_image(&self, prompt: &str, source: &DynamicImage) -> Result<DynamicImage> {
        let resized = source.resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::Lanczos3);
        let payload = ImageToImagePayload {
            prompt,
            init_images: vec![encode_png_base64(&resized)?],
            denoising_strength: IMAGE_TO_IMAGE_STRENGTH,
            steps: image_to_image_steps(IMAGE_TO_IMAGE_STEPS, IMAGE_TO_IMAGE_STRENGTH),
            cfg_scale: GUIDANCE_SCALE,
            width: IMAGE_SIZE,
            height: IMAGE_SIZE,
            batch_size: 1,
        };
        self.post_generation("img2img", &payload)
    }
}

fn encode_png_base64(image: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image.to_rgb8())
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("source image PNG encoding failed")?;
    Ok(BASE64.encode(bytes))
}

fn decode_first_image(payload: &Value) -> Result<DynamicImage> {
    let encoded = payload
        .get("images")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow::anyhow!("model server response missing images"))?;
    let encoded = match (encoded.starts_with("data:"), encoded.find("base64,")) {
        (true, Some(idx)) => &encoded[idx + "base64,".len()..],
        _ => encoded,
    };
    let bytes = BASE64
        .decode(encoded.as_bytes())
        .context("image base64 decode failed")?;
    image::load_from_memory(&bytes).context("model server returned an undecodable image")
}

fn response_json_or_error(endpoint: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{endpoint} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{endpoint} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{endpoint} returned invalid JSON payload"))?;
    Ok(parsed)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;

    use image::GenericImageView;
    use serde_json::json;

    use super::*;

    fn png_base64(width: u32, height: u32, color: [u8; 3]) -> String {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)));
        encode_png_base64(&image).unwrap_or_default()
    }

    /// Answers each connection with the next canned JSON body and reports
    /// the request line and body it received.
    fn serve_json(
        responses: Vec<(u16, String)>,
    ) -> anyhow::Result<(String, mpsc::Receiver<(String, String)>)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let base = format!("http://{}", listener.local_addr()?);
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for (status, body) in responses {
                let Ok((stream, _)) = listener.accept() else {
                    return;
                };
                if let Ok(request) = read_request(&stream) {
                    let _ = tx.send(request);
                }
                let mut stream = stream;
                let reply = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes());
            }
        });
        Ok((base, rx))
    }

    fn read_request(stream: &TcpStream) -> std::io::Result<(String, String)> {
        let mut reader = BufReader::new(stream);
        let mut request_line = String::new();
        reader.read_line(&mut request_line)?;
        let mut content_length = 0usize;
        loop {
            let mut header = String::new();
            reader.read_line(&mut header)?;
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body)?;
        Ok((
            request_line.trim_end().to_string(),
            String::from_utf8_lossy(&body).to_string(),
        ))
    }

    #[test]
    fn dryrun_is_deterministic_per_prompt() -> anyhow::Result<()> {
        let model = DryrunModel;
        let a = model.text_to_image("a red circle")?;
        let b = model.text_to_image("a red circle")?;
        let c = model.text_to_image("a blue square")?;
        assert_eq!(a.dimensions(), (IMAGE_SIZE, IMAGE_SIZE));
        assert_eq!(a, b);
        assert_ne!(a, c);
        Ok(())
    }

    #[test]
    fn dryrun_image_to_image_resizes_and_blends() -> anyhow::Result<()> {
        let source = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 20, Rgb([0, 0, 0])));
        let out = DryrunModel.image_to_image("tint", &source)?;
        assert_eq!(out.dimensions(), (IMAGE_SIZE, IMAGE_SIZE));

        let (r, g, b) = color_from_prompt("tint", 0);
        let expected = Rgb([
            lerp_channel(0, r, IMAGE_TO_IMAGE_STRENGTH),
            lerp_channel(0, g, IMAGE_TO_IMAGE_STRENGTH),
            lerp_channel(0, b, IMAGE_TO_IMAGE_STRENGTH),
        ]);
        assert_eq!(*out.to_rgb8().get_pixel(5, 5), expected);
        Ok(())
    }

    #[test]
    fn image_to_image_is_optional_for_backends() {
        struct TextOnly;
        impl ImageModel for TextOnly {
            fn name(&self) -> &str {
                "text-only"
            }
            fn text_to_image(&self, _prompt: &str) -> Result<DynamicImage> {
                Ok(DynamicImage::new_rgb8(1, 1))
            }
        }

        let err = TextOnly
            .image_to_image("x", &DynamicImage::new_rgb8(1, 1))
            .unwrap_err();
        assert!(err.to_string().contains("not supported by text-only"));
    }

    #[test]
    fn steps_cover_at_least_one_denoising_step() {
        assert_eq!(image_to_image_steps(2, 0.5), 2);
        assert_eq!(image_to_image_steps(1, 0.5), 2);
        assert_eq!(image_to_image_steps(2, 0.3), 4);
        assert_eq!(image_to_image_steps(0, 1.0), 1);
        assert_eq!(image_to_image_steps(3, 0.0), 3);
    }

    #[test]
    fn decode_first_image_accepts_data_urls() -> anyhow::Result<()> {
        let raw = png_base64(2, 3, [9, 8, 7]);
        let plain = decode_first_image(&json!({ "images": [raw.clone()] }))?;
        let prefixed =
            decode_first_image(&json!({ "images": [format!("data:image/png;base64,{raw}")] }))?;
        assert_eq!(plain.dimensions(), (2, 3));
        assert_eq!(plain, prefixed);

        assert!(decode_first_image(&json!({ "images": [] })).is_err());
        assert!(decode_first_image(&json!({ "images": ["not base64!"] })).is_err());
        Ok(())
    }

    #[test]
    fn connect_fails_when_server_is_down() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        let err = match LocalDiffusionModel::connect(&format!("http://{addr}")) {
            Ok(_) => anyhow::bail!("connect unexpectedly succeeded"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("not reachable"));
        Ok(())
    }

    #[test]
    fn connect_requires_a_checkpoint() -> anyhow::Result<()> {
        let (base, _requests) = serve_json(vec![(200, "[]".to_string())])?;
        let err = match LocalDiffusionModel::connect(&base) {
            Ok(_) => anyhow::bail!("connect unexpectedly succeeded"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("no checkpoint"));
        Ok(())
    }

    #[test]
    fn local_model_round_trips_through_webui_api() -> anyhow::Result<()> {
        let listing = json!([{ "title": "sdxl_turbo [abc]", "model_name": "sdxl_turbo" }]);
        let generated = json!({ "images": [png_base64(4, 4, [1, 2, 3])] });
        let (base, requests) = serve_json(vec![
            (200, listing.to_string()),
            (200, generated.to_string()),
            (200, generated.to_string()),
            (500, "{\"error\":\"CUDA out of memory\"}".to_string()),
        ])?;

        let model = LocalDiffusionModel::connect(&format!("{base}/"))?;
        assert_eq!(model.checkpoint(), "sdxl_turbo");
        assert_eq!(model.api_base(), base);
        let (probe_line, _) = requests.recv()?;
        assert!(probe_line.starts_with("GET /sdapi/v1/sd-models"));

        let image = model.text_to_image("a red circle")?;
        assert_eq!(image.dimensions(), (4, 4));
        let (line, body) = requests.recv()?;
        assert!(line.starts_with("POST /sdapi/v1/txt2img"));
        let sent: Value = serde_json::from_str(&body)?;
        assert_eq!(sent["prompt"], json!("a red circle"));
        assert_eq!(sent["steps"], json!(TEXT_TO_IMAGE_STEPS));
        assert_eq!(sent["cfg_scale"], json!(GUIDANCE_SCALE));

        let source = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([5, 5, 5])));
        model.image_to_image("fix this", &source)?;
        let (line, body) = requests.recv()?;
        assert!(line.starts_with("POST /sdapi/v1/img2img"));
        let sent: Value = serde_json::from_str(&body)?;
        assert_eq!(sent["denoising_strength"], json!(IMAGE_TO_IMAGE_STRENGTH));
        assert_eq!(sent["init_images"].as_array().map(Vec::len), Some(1));

        let err = model.text_to_image("again").unwrap_err();
        assert!(err.to_string().contains("(500)"));
        assert!(err.to_string().contains("CUDA out of memory"));
        Ok(())
    }
}
