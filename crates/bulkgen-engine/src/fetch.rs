use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;

use crate::truncate_text;

/// Resolves an image reference to its raw bytes.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, reference: &str) -> Result<Vec<u8>>;
}

/// Decodes `data:` URLs in place and downloads `http(s)://` URLs.
pub struct HttpImageFetcher {
    http: HttpClient,
}

impl HttpImageFetcher {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }
}

impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageFetcher for HttpImageFetcher {
    fn fetch(&self, reference: &str) -> Result<Vec<u8>> {
        let trimmed = reference.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("data:") {
            return decode_data_url(trimmed);
        }
        if !(lower.starts_with("https://") || lower.starts_with("http://")) {
            bail!(
                "unsupported image reference '{}'",
                truncate_text(trimmed, 64)
            );
        }
        let response = self
            .http
            .get(trimmed)
            .send()
            .with_context(|| format!("image download failed ({})", truncate_text(trimmed, 128)))?;
        let status = response.status();
        if !status.is_success() {
            bail!("image download failed ({})", status.as_u16());
        }
        let bytes = response
            .bytes()
            .context("image download body read failed")?;
        Ok(bytes.to_vec())
    }
}

/// Only base64 payloads are accepted; image bytes are never percent-encoded
/// by the providers in this crate.
pub fn decode_data_url(reference: &str) -> Result<Vec<u8>> {
    let is_data_url = reference
        .get(..5)
        .map(|scheme| scheme.eq_ignore_ascii_case("data:"))
        .unwrap_or(false);
    if !is_data_url {
        bail!("not a data URL");
    }
    let rest = &reference[5..];
    let Some((meta, payload)) = rest.split_once(',') else {
        bail!("malformed data URL: missing ','");
    };
    if !meta
        .split(';')
        .any(|part| part.trim().eq_ignore_ascii_case("base64"))
    {
        bail!("data URL is not base64 encoded");
    }
    BASE64
        .decode(payload.trim().as_bytes())
        .context("data URL base64 decode failed")
}

#[cfg(test)]
mod tests {
    use super::{decode_data_url, HttpImageFetcher, ImageFetcher};
    use crate::providers::data_url;

    #[test]
    fn data_urls_decode_without_network() -> anyhow::Result<()> {
        let reference = data_url("image/jpeg", b"\xff\xd8\xffjpeg");
        assert_eq!(HttpImageFetcher::new().fetch(&reference)?, b"\xff\xd8\xffjpeg");
        Ok(())
    }

    #[test]
    fn data_url_without_base64_marker_is_rejected() {
        let err = decode_data_url("data:text/plain,hello")
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert_eq!(err, "data URL is not base64 encoded");
        assert!(decode_data_url("data:image/jpeg;base64").is_err());
        assert!(decode_data_url("DATA:image/jpeg;base64,!!!").is_err());
    }

    #[test]
    fn unsupported_schemes_are_rejected() {
        let err = HttpImageFetcher::new()
            .fetch("file:///etc/passwd")
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.starts_with("unsupported image reference"), "{err}");
    }
}
