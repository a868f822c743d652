use std::collections::BTreeMap;
use std::env;
use std::io::Cursor;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bulkgen_contracts::images::GenerationRequest;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::truncate_text;

const DEFAULT_IMAGEN_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DRYRUN_LONG_EDGE: u32 = 64;

/// External text-to-image client. One call produces one image reference.
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry() -> ImageProviderRegistry {
    let mut providers = ImageProviderRegistry::new();
    providers.register(DryrunProvider);
    providers.register(ImagenProvider::from_env());
    providers
}

/// Offline provider: a solid-colour JPEG keyed on prompt and unit index,
/// returned as a `data:` URL.
pub struct DryrunProvider;

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let (width, height) = request.aspect_ratio.dimensions(DRYRUN_LONG_EDGE);
        let (r, g, b) = color_from_prompt(request.prompt.as_str(), request.unit_index);
        let mut canvas = RgbImage::new(width, height);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(canvas)
            .write_to(&mut bytes, ImageFormat::Jpeg)
            .context("dryrun JPEG encode failed")?;
        Ok(data_url("image/jpeg", &bytes.into_inner()))
    }
}

pub struct ImagenProvider {
    api_base: String,
    http: HttpClient,
}

impl ImagenProvider {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Self {
        let api_base = env::var("IMAGEN_API_BASE")
            .ok()
            .or_else(|| env::var("GEMINI_API_BASE").ok())
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_IMAGEN_API_BASE.to_string());
        Self::new(api_base)
    }

    fn endpoint(&self, model: &str) -> String {
        let model = model.trim().trim_start_matches("models/");
        format!("{}/models/{}:predict", self.api_base, model)
    }

    fn build_payload(request: &GenerationRequest) -> Value {
        json!({
            "instances": [{
                "prompt": request.prompt.as_str(),
            }],
            "parameters": {
                "sampleCount": 1,
                "aspectRatio": request.aspect_ratio.label(),
                "outputOptions": {
                    "mimeType": "image/jpeg",
                },
            },
        })
    }

    /// Pulls the first image out of a `:predict` response as a data URL.
    fn extract_reference(response_payload: &Value) -> Result<String> {
        let predictions = response_payload
            .get("predictions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut filtered_reasons = Vec::new();
        for row in predictions {
            let Some(obj) = row.as_object() else {
                continue;
            };
            let nested = obj
                .get("image")
                .and_then(Value::as_object)
                .or_else(|| obj.get("generatedImage").and_then(Value::as_object));
            let encoded = obj
                .get("bytesBase64Encoded")
                .or_else(|| obj.get("bytes_base64_encoded"))
                .or_else(|| nested.and_then(|image| image.get("imageBytes")))
                .or_else(|| nested.and_then(|image| image.get("bytesBase64Encoded")))
                .and_then(Value::as_str);
            if let Some(encoded) = encoded {
                // Validate before handing the payload on.
                BASE64
                    .decode(encoded.as_bytes())
                    .context("Imagen image base64 decode failed")?;
                let mime_type = obj
                    .get("mimeType")
                    .or_else(|| obj.get("mime_type"))
                    .or_else(|| nested.and_then(|image| image.get("mimeType")))
                    .and_then(Value::as_str)
                    .unwrap_or("image/jpeg");
                return Ok(format!("data:{mime_type};base64,{encoded}"));
            }
            if let Some(reason) = obj.get("raiFilteredReason").and_then(Value::as_str) {
                filtered_reasons.push(reason.to_string());
            }
        }
        if let Some(reason) = filtered_reasons.first() {
            bail!("Imagen returned no images: {}", truncate_text(reason, 256));
        }
        bail!("Imagen returned no images")
    }
}

impl ImageProvider for ImagenProvider {
    fn name(&self) -> &str {
        "imagen"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let endpoint = self.endpoint(&request.model);
        let payload = Self::build_payload(request);
        tracing::debug!(
            endpoint = %endpoint,
            aspect_ratio = %request.aspect_ratio,
            unit = request.unit_index,
            "sending Imagen predict request"
        );
        let response = self
            .http
            .post(&endpoint)
            .header("x-goog-api-key", request.credential.as_str())
            .json(&payload)
            .send()
            .with_context(|| format!("Imagen request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Imagen", response)?;
        Self::extract_reference(&response_payload)
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        let detail = provider_error_message(&body).unwrap_or(body);
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&detail, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

/// `{"error": {"message": ...}}` bodies carry the human-readable cause.
fn provider_error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(str::to_string)
}

pub(crate) fn data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", BASE64.encode(bytes))
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
