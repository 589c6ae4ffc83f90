//! Scaleway implementation of the cloud provider capability.
//!
//! Instance creation, deletion and power actions go through the
//! `scaleway-rs` SDK. Image listing and import, volume management and
//! attachment are not covered by the SDK, so those calls go straight to the
//! Scaleway instance API over `reqwest`.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use std::time::Duration;

use reqwest::RequestBuilder;
use scaleway_rs::{ScalewayApi, ScalewayCreateInstanceBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cloud::{
    CloudProvider, InstanceSnapshot, ProviderError, ProviderFuture, ProviderKind, VolumeSummary,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";

/// Commercial type used for every deployed instance.
const INSTANCE_TYPE: &str = "DEV1-M";
/// Block storage volume type.
const VOLUME_TYPE_BLOCK: &str = "b_ssd";
/// Scaleway sizes volumes in bytes; record sizes are in megabytes.
const BYTES_PER_MB: u64 = 1_000_000;

const AUTH_SECRET_KEY: &str = "secret_key";
const AUTH_PROJECT_ID: &str = "project_id";
const AUTH_ORGANIZATION_ID: &str = "organization_id";

const AUTH_FIELDS: &[&str] = &[AUTH_SECRET_KEY, AUTH_PROJECT_ID, AUTH_ORGANIZATION_ID];
const LOCATIONS: &[&str] = &["fr-par-1", "fr-par-2", "nl-ams-1", "pl-waw-1"];

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Credentials and location captured by a successful `init`.
#[derive(Clone)]
struct BoundClient {
    api: ScalewayApi,
    secret_key: String,
    project_id: String,
    organization_id: Option<String>,
    zone: String,
}

impl BoundClient {
    fn url(&self, path: &str) -> String {
        format!("{SCALEWAY_INSTANCE_API_BASE}/zones/{}/{path}", self.zone)
    }

    async fn send(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Vec<u8>, ProviderError> {
        let response = request
            .header("X-Auth-Token", &self.secret_key)
            .send()
            .await
            .map_err(|err| ProviderError::api(operation, err))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ProviderError::api(operation, err))?;

        if status.is_success() {
            return Ok(body.to_vec());
        }

        Err(ProviderError::Api {
            operation,
            message: format!("{status}: {}", String::from_utf8_lossy(&body)),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
    ) -> Result<T, ProviderError> {
        let body = self
            .send(operation, HTTP_CLIENT.get(self.url(path)))
            .await?;
        serde_json::from_slice(&body).map_err(|err| ProviderError::api(operation, err))
    }

    async fn fetch_server(
        &self,
        operation: &'static str,
        vm_id: &str,
    ) -> Result<ServerDetails, ProviderError> {
        let response: GetServerResponse = self
            .get_json(operation, &format!("servers/{vm_id}"))
            .await?;
        Ok(response.server)
    }
}

/// [`CloudProvider`] backed by the Scaleway instance API.
#[derive(Default)]
pub struct ScalewayProvider {
    bound: Option<BoundClient>,
}

impl ScalewayProvider {
    /// Creates a provider that is not yet bound to credentials.
    #[must_use]
    pub const fn new() -> Self {
        Self { bound: None }
    }

    fn client(&self) -> Result<&BoundClient, ProviderError> {
        self.bound.as_ref().ok_or(ProviderError::NotInitialised)
    }
}

fn require_field<'a>(
    auth: &'a BTreeMap<String, String>,
    field: &'static str,
) -> Result<&'a str, ProviderError> {
    auth.get(field)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or(ProviderError::MissingCredential { field })
}

/// Scaleway has no key injection API for bare images, so the public key is
/// smuggled in through an instance tag which the in-image agent reads at
/// boot. Tag values cannot contain spaces.
fn authorized_key_tag(public_key: &str) -> String {
    format!("AUTHORIZED_KEY={}", public_key.trim().replace(' ', "_"))
}

#[derive(Deserialize)]
struct ListImagesResponse {
    images: Vec<ImageSummary>,
}

#[derive(Deserialize)]
struct ImageSummary {
    id: String,
    name: String,
}

#[derive(Serialize)]
struct ImportImageRequest {
    name: String,
    arch: String,
    external: ExternalImageSource,
    project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<String>,
}

#[derive(Serialize)]
struct ExternalImageSource {
    url: String,
    sha256: String,
}

#[derive(Deserialize)]
struct ImportImageResponse {
    image: ImageSummary,
}

#[derive(Deserialize)]
struct GetServerResponse {
    server: ServerDetails,
}

#[derive(Deserialize)]
struct ServerDetails {
    id: String,
    name: String,
    #[serde(default)]
    public_ip: Option<ServerIp>,
    #[serde(default)]
    volumes: HashMap<String, ServerVolume>,
}

#[derive(Deserialize)]
struct ServerIp {
    address: String,
}

#[derive(Deserialize)]
struct ServerVolume {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Serialize)]
struct CreateVolumeRequest {
    name: String,
    size: u64,
    volume_type: String,
    project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<String>,
}

#[derive(Deserialize)]
struct CreateVolumeResponse {
    volume: VolumeDetails,
}

#[derive(Deserialize)]
struct VolumeDetails {
    id: String,
}

#[derive(Serialize)]
struct VolumeAttachment {
    id: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    boot: bool,
}

#[derive(Serialize)]
struct UpdateServerVolumesRequest {
    volumes: BTreeMap<String, VolumeAttachment>,
}

/// Scaleway keys attached volumes by stringified slot index. Ordering by
/// the numeric value keeps the boot volume first.
fn volumes_in_index_order(volumes: HashMap<String, ServerVolume>) -> Vec<VolumeSummary> {
    let mut entries: Vec<(u32, ServerVolume)> = volumes
        .into_iter()
        .filter_map(|(index, volume)| index.parse::<u32>().ok().map(|slot| (slot, volume)))
        .collect();
    entries.sort_by_key(|(slot, _)| *slot);
    entries
        .into_iter()
        .map(|(_, volume)| VolumeSummary {
            name: volume.name,
            volume_id: volume.id,
        })
        .collect()
}

fn snapshot_from_server(server: ServerDetails, location: &str) -> InstanceSnapshot {
    InstanceSnapshot {
        vm_id: server.id,
        name: server.name,
        location: location.to_owned(),
        public_ip: server.public_ip.map(|ip| ip.address),
        volumes: volumes_in_index_order(server.volumes),
    }
}

impl CloudProvider for ScalewayProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Scaleway
    }

    fn auth_fields(&self) -> &'static [&'static str] {
        AUTH_FIELDS
    }

    fn supported_locations(&self) -> &'static [&'static str] {
        LOCATIONS
    }

    fn init<'a>(
        &'a mut self,
        auth: &'a BTreeMap<String, String>,
        location: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let secret_key = require_field(auth, AUTH_SECRET_KEY)?.to_owned();
            let project_id = require_field(auth, AUTH_PROJECT_ID)?.to_owned();
            let organization_id = auth
                .get(AUTH_ORGANIZATION_ID)
                .filter(|value| !value.is_empty())
                .cloned();

            let candidate = BoundClient {
                api: ScalewayApi::new(&secret_key),
                secret_key,
                project_id,
                organization_id,
                zone: location.to_owned(),
            };

            // A cheap authenticated read proves the credentials and the
            // zone before any mutation is attempted.
            candidate
                .get_json::<ListImagesResponse>("init", "images?per_page=1")
                .await?;

            self.bound = Some(candidate);
            Ok(())
        })
    }

    fn list_images(&self) -> ProviderFuture<'_, BTreeMap<String, String>> {
        Box::pin(async move {
            let client = self.client()?;
            let response: ListImagesResponse = client
                .get_json("list images", "images?per_page=100")
                .await?;
            Ok(response
                .images
                .into_iter()
                .map(|image| (image.name, image.id))
                .collect())
        })
    }

    fn add_image<'a>(
        &'a self,
        url: &'a str,
        digest: &'a str,
        version: &'a str,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let client = self.client()?;
            let payload = ImportImageRequest {
                name: format!("stratus-{version}"),
                arch: String::from("x86_64"),
                external: ExternalImageSource {
                    url: url.to_owned(),
                    sha256: digest.to_owned(),
                },
                project: client.project_id.clone(),
                organization: client.organization_id.clone(),
            };
            let body = client
                .send(
                    "import image",
                    HTTP_CLIENT.post(client.url("images")).json(&payload),
                )
                .await?;
            let parsed: ImportImageResponse = serde_json::from_slice(&body)
                .map_err(|err| ProviderError::api("import image", err))?;
            Ok(parsed.image.id)
        })
    }

    fn create_instance<'a>(
        &'a self,
        name: &'a str,
        image_id: &'a str,
        public_key: &'a str,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let client = self.client()?;
            let server = ScalewayCreateInstanceBuilder::new(
                client.api.clone(),
                &client.zone,
                name,
                INSTANCE_TYPE,
            )
            .image(image_id)
            .project(&client.project_id)
            .routed_ip_enabled(true)
            .tags(vec![
                String::from("stratus"),
                authorized_key_tag(public_key),
            ])
            .run_async()
            .await
            .map_err(|err| ProviderError::api("create instance", err))?;
            Ok(server.id)
        })
    }

    fn instance_info<'a>(&'a self, vm_id: &'a str) -> ProviderFuture<'a, InstanceSnapshot> {
        Box::pin(async move {
            let client = self.client()?;
            let server = client.fetch_server("instance info", vm_id).await?;
            Ok(snapshot_from_server(server, &client.zone))
        })
    }

    fn start_instance<'a>(&'a self, vm_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let client = self.client()?;
            client
                .api
                .perform_instance_action_async(&client.zone, vm_id, "poweron")
                .await
                .map_err(|err| ProviderError::api("start instance", err))?;
            Ok(())
        })
    }

    fn stop_instance<'a>(&'a self, vm_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let client = self.client()?;
            client
                .api
                .perform_instance_action_async(&client.zone, vm_id, "poweroff")
                .await
                .map_err(|err| ProviderError::api("stop instance", err))?;
            Ok(())
        })
    }

    fn delete_instance<'a>(&'a self, vm_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let client = self.client()?;
            client
                .api
                .delete_instance_async(&client.zone, vm_id)
                .await
                .map_err(|err| ProviderError::api("delete instance", err))?;
            Ok(())
        })
    }

    fn create_volume<'a>(&'a self, name: &'a str, size_mb: u64) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let client = self.client()?;
            let payload = CreateVolumeRequest {
                name: name.to_owned(),
                size: size_mb.saturating_mul(BYTES_PER_MB),
                volume_type: String::from(VOLUME_TYPE_BLOCK),
                project: client.project_id.clone(),
                organization: client.organization_id.clone(),
            };
            let body = client
                .send(
                    "create volume",
                    HTTP_CLIENT.post(client.url("volumes")).json(&payload),
                )
                .await?;
            let parsed: CreateVolumeResponse = serde_json::from_slice(&body)
                .map_err(|err| ProviderError::api("create volume", err))?;
            Ok(parsed.volume.id)
        })
    }

    fn attach_volume<'a>(&'a self, volume_id: &'a str, vm_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let client = self.client()?;
            let server = client.fetch_server("attach volume", vm_id).await?;

            let mut volumes = BTreeMap::new();
            let mut highest_slot = 0u32;
            for (index, volume) in &server.volumes {
                let slot = index
                    .parse::<u32>()
                    .map_err(|err| ProviderError::api("attach volume", err))?;
                highest_slot = highest_slot.max(slot);
                volumes.insert(
                    index.clone(),
                    VolumeAttachment {
                        id: volume.id.clone(),
                        boot: index == "0",
                    },
                );
            }
            let next_slot = if server.volumes.is_empty() {
                0
            } else {
                highest_slot.saturating_add(1)
            };
            volumes.insert(
                next_slot.to_string(),
                VolumeAttachment {
                    id: volume_id.to_owned(),
                    boot: false,
                },
            );

            let payload = UpdateServerVolumesRequest { volumes };
            client
                .send(
                    "attach volume",
                    HTTP_CLIENT
                        .patch(client.url(&format!("servers/{vm_id}")))
                        .json(&payload),
                )
                .await?;
            Ok(())
        })
    }

    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let client = self.client()?;
            client
                .send(
                    "delete volume",
                    HTTP_CLIENT.delete(client.url(&format!("volumes/{volume_id}"))),
                )
                .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorized_key_tag_replaces_spaces() {
        let tag = authorized_key_tag("ssh-ed25519 AAAA stratus");
        assert_eq!(tag, "AUTHORIZED_KEY=ssh-ed25519_AAAA_stratus");
        assert!(!tag.contains(' '));
    }

    #[tokio::test]
    async fn operations_before_init_fail() {
        let provider = ScalewayProvider::new();
        let result = provider.list_images().await;
        assert!(matches!(result, Err(ProviderError::NotInitialised)));
    }

    #[test]
    fn volumes_are_ordered_by_slot_index() {
        let mut raw = HashMap::new();
        raw.insert(
            String::from("1"),
            ServerVolume {
                id: String::from("vol-b"),
                name: String::from("data"),
            },
        );
        raw.insert(
            String::from("0"),
            ServerVolume {
                id: String::from("vol-a"),
                name: String::from("boot"),
            },
        );

        let ordered = volumes_in_index_order(raw);
        let ids: Vec<&str> = ordered
            .iter()
            .map(|volume| volume.volume_id.as_str())
            .collect();
        assert_eq!(ids, vec!["vol-a", "vol-b"]);
    }

    #[test]
    fn non_boot_attachment_omits_boot_flag() {
        let attachment = VolumeAttachment {
            id: String::from("vol-b"),
            boot: false,
        };
        let rendered =
            serde_json::to_string(&attachment).unwrap_or_else(|err| panic!("serialise: {err}"));
        assert_eq!(rendered, r#"{"id":"vol-b"}"#);
    }
}
