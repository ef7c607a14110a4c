use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

/// Registries reject `+` in tags, k0s publishes versions as `v1.33.4+k0s.0`.
pub fn normalize_version_tag(version: &str) -> String {
    version.trim().replace('+', "-")
}

/// Normalizes only the tag part of an image reference. References without a
/// colon are returned unchanged.
pub fn normalize_image_tag(image: &str) -> String {
    let image = image.trim();
    match image.rfind(':') {
        Some(idx) => format!("{}:{}", &image[..idx], normalize_version_tag(&image[idx + 1..])),
        None => image.to_string(),
    }
}

pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Fetches the published stable k0s version, e.g. `v1.33.4+k0s.0`.
pub async fn fetch_stable_version(client: &reqwest::Client, url: &str) -> Result<String> {
    debug!("Fetching stable k0s version from {}", url);
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(Error::staging(
            "stable version",
            format!("unexpected status {} from {}", response.status(), url),
        ));
    }
    let body = response.text().await?;
    Ok(body.trim().to_string())
}

/// Any normalized difference from the compiled default counts as newer.
pub fn is_newer_than_default(stable: &str, default_version: &str) -> bool {
    let stable = normalize_version_tag(stable);
    !stable.is_empty() && stable != normalize_version_tag(default_version)
}
