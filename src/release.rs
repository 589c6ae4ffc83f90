//! Release descriptor for published instance images.
//!
//! The project publishes a JSON index mapping release versions to
//! per-provider image artefacts. The deploy pipeline uses it to import an
//! image when the target cloud does not hold one yet.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cloud::ProviderKind;

/// Default location of the published release index.
pub const DEFAULT_RELEASES_URL: &str =
    "https://releases.stratus.sh/index.json";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Errors raised while fetching or interrogating the release index.
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// Raised when the index cannot be fetched or parsed.
    #[error("failed to fetch release index from {url}: {message}")]
    Fetch {
        /// URL that was queried.
        url: String,
        /// Human-readable failure detail.
        message: String,
    },
    /// Raised when the requested version is not in the index.
    #[error("release version '{version}' not found")]
    UnknownVersion {
        /// The version that was requested.
        version: String,
    },
    /// Raised when a release carries no image for the target provider.
    #[error("release '{version}' has no image for provider '{provider}'")]
    UnsupportedRelease {
        /// The release version.
        version: String,
        /// The provider that has no artefact.
        provider: ProviderKind,
    },
}

/// An image artefact published for one cloud provider.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CloudImage {
    /// Download URL of the raw image.
    pub url: String,
    /// SHA-256 digest of the image contents.
    pub digest: String,
}

/// One published release.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Release {
    /// Release version string, for example `1.0`.
    pub version: String,
    /// Image artefacts keyed by provider name.
    #[serde(default)]
    pub cloud_images: BTreeMap<String, CloudImage>,
}

impl Release {
    /// Returns the image artefact for the given provider.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::UnsupportedRelease`] when the release carries
    /// no artefact for the provider.
    pub fn image_for(&self, provider: ProviderKind) -> Result<&CloudImage, ReleaseError> {
        self.cloud_images
            .get(provider.name())
            .ok_or_else(|| ReleaseError::UnsupportedRelease {
                version: self.version.clone(),
                provider,
            })
    }
}

/// The published index of all releases.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ReleaseIndex {
    /// Version string of the newest stable release.
    pub latest: String,
    /// All published releases keyed by version.
    #[serde(default)]
    pub releases: BTreeMap<String, Release>,
}

impl ReleaseIndex {
    /// Fetches and parses the index from the given URL.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::Fetch`] when the request fails or the body is
    /// not a valid index document.
    pub async fn fetch(url: &str) -> Result<Self, ReleaseError> {
        let fetch_err = |message: String| ReleaseError::Fetch {
            url: url.to_owned(),
            message,
        };

        let response = HTTP_CLIENT
            .get(url)
            .send()
            .await
            .map_err(|err| fetch_err(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fetch_err(format!("unexpected status {status}")));
        }
        response
            .json()
            .await
            .map_err(|err| fetch_err(err.to_string()))
    }

    /// Returns the latest release.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::UnknownVersion`] when the `latest` pointer
    /// does not resolve to a published release.
    pub fn latest(&self) -> Result<&Release, ReleaseError> {
        self.version(&self.latest)
    }

    /// Returns the release with the given version.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::UnknownVersion`] when the version is absent.
    pub fn version(&self, version: &str) -> Result<&Release, ReleaseError> {
        self.releases
            .get(version)
            .ok_or_else(|| ReleaseError::UnknownVersion {
                version: version.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_INDEX: &str = r#"{
        "latest": "1.1",
        "releases": {
            "1.0": {
                "version": "1.0",
                "cloud_images": {
                    "scaleway": {
                        "url": "https://example.org/stratus-1.0.img",
                        "digest": "abc123"
                    }
                }
            },
            "1.1": {
                "version": "1.1",
                "cloud_images": {}
            }
        }
    }"#;

    fn sample_index() -> ReleaseIndex {
        serde_json::from_str(SAMPLE_INDEX).unwrap_or_else(|err| panic!("parse index: {err}"))
    }

    #[test]
    fn latest_pointer_resolves() {
        let index = sample_index();
        let latest = index.latest().unwrap_or_else(|err| panic!("latest: {err}"));
        assert_eq!(latest.version, "1.1");
    }

    #[test]
    fn unknown_version_is_rejected() {
        let index = sample_index();
        assert!(matches!(
            index.version("9.9"),
            Err(ReleaseError::UnknownVersion { version }) if version == "9.9"
        ));
    }

    #[test]
    fn image_for_returns_provider_artefact() {
        let index = sample_index();
        let release = index
            .version("1.0")
            .unwrap_or_else(|err| panic!("version: {err}"));
        let image = release
            .image_for(ProviderKind::Scaleway)
            .unwrap_or_else(|err| panic!("image: {err}"));
        assert_eq!(image.digest, "abc123");
    }

    #[test]
    fn release_without_provider_image_is_unsupported() {
        let index = sample_index();
        let release = index
            .version("1.1")
            .unwrap_or_else(|err| panic!("version: {err}"));
        assert!(matches!(
            release.image_for(ProviderKind::Scaleway),
            Err(ReleaseError::UnsupportedRelease { .. })
        ));
    }
}
