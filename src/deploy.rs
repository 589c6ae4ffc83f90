//! Provisioning pipeline for instances.
//!
//! Deployment is an explicit state machine. Each call to
//! [`Deployment::advance`] performs exactly one provider-facing step and
//! moves to the next state, so partial progress is inspectable and each
//! transition can be exercised in isolation.

use thiserror::Error;
use tracing::{info, warn};

use crate::cloud::{new_provider, CloudProvider, ProviderError};
use crate::keys::{KeyError, KeyPair};
use crate::release::{Release, ReleaseError};
use crate::store::{InstanceRecord, Store, StoreError, VolumeRecord};

/// Size of the data volume attached to every instance, in megabytes.
pub const VOLUME_SIZE_MB: u64 = 30_000;

/// Errors raised by the provisioning pipeline.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Raised when a provider operation fails during a pipeline step.
    #[error("deployment step '{step}' failed: {source}")]
    Provider {
        /// The pipeline step that failed.
        step: &'static str,
        /// The underlying provider failure.
        #[source]
        source: ProviderError,
    },
    /// Raised when the local record store fails.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Raised when key generation fails.
    #[error(transparent)]
    Key(#[from] KeyError),
    /// Raised when the release descriptor cannot supply an image.
    #[error(transparent)]
    Release(#[from] ReleaseError),
    /// Raised when an instance with the requested name already exists.
    #[error("instance '{name}' already exists")]
    AlreadyExists {
        /// The conflicting instance name.
        name: String,
    },
}

fn step_err(step: &'static str) -> impl FnOnce(ProviderError) -> DeployError {
    move |source| DeployError::Provider { step, source }
}

/// Progress marker for a deployment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeployState {
    /// Nothing has happened yet.
    Requested,
    /// The instance image exists on the target cloud.
    ImageReady,
    /// A fresh key pair has been generated.
    KeyReady,
    /// The virtual machine exists and its identifier is persisted.
    InstanceCreated,
    /// The data volume exists.
    VolumeCreated,
    /// The data volume is attached to the virtual machine.
    VolumeAttached,
    /// The virtual machine is powered on.
    Started,
    /// The final record, including the key seed, is persisted.
    Recorded,
}

/// Immutable inputs to a deployment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeployRequest {
    /// Name for the new instance, unique in the local store.
    pub name: String,
    /// Name of the stored cloud account to deploy through.
    pub cloud: String,
    /// Provider location to deploy into.
    pub location: String,
}

/// A deployment in progress.
pub struct Deployment<'a> {
    provider: &'a dyn CloudProvider,
    store: &'a dyn Store,
    request: DeployRequest,
    release: Release,
    state: DeployState,
    image_id: Option<String>,
    key: Option<KeyPair>,
    vm_id: Option<String>,
    volume_id: Option<String>,
}

impl<'a> Deployment<'a> {
    /// Starts a deployment against an already initialised provider.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::AlreadyExists`] when the store already holds
    /// an instance with the requested name.
    pub fn new(
        provider: &'a dyn CloudProvider,
        store: &'a dyn Store,
        request: DeployRequest,
        release: Release,
    ) -> Result<Self, DeployError> {
        if store.get_instance(&request.name).is_ok() {
            return Err(DeployError::AlreadyExists { name: request.name });
        }
        Ok(Self {
            provider,
            store,
            request,
            release,
            state: DeployState::Requested,
            image_id: None,
            key: None,
            vm_id: None,
            volume_id: None,
        })
    }

    /// Returns the current progress marker.
    #[must_use]
    pub const fn state(&self) -> DeployState {
        self.state
    }

    /// Performs the next pipeline step and returns the state reached.
    ///
    /// Calling this in the [`DeployState::Recorded`] state is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError`] when the step's provider call, key
    /// generation or persistence fails. The deployment stays in its
    /// current state and already created resources are left in place for
    /// `teardown` to reclaim.
    pub async fn advance(&mut self) -> Result<DeployState, DeployError> {
        match self.state {
            DeployState::Requested => self.ensure_image().await?,
            DeployState::ImageReady => self.generate_key()?,
            DeployState::KeyReady => self.create_instance().await?,
            DeployState::InstanceCreated => self.create_volume().await?,
            DeployState::VolumeCreated => self.attach_volume().await?,
            DeployState::VolumeAttached => self.start_instance().await?,
            DeployState::Started => self.record().await?,
            DeployState::Recorded => {}
        }
        Ok(self.state)
    }

    /// Runs the pipeline to completion and returns the final record.
    ///
    /// # Errors
    ///
    /// Returns the first [`DeployError`] encountered; see [`Self::advance`].
    pub async fn run(mut self) -> Result<InstanceRecord, DeployError> {
        while self.state != DeployState::Recorded {
            let reached = self.advance().await?;
            info!(instance = %self.request.name, state = ?reached, "deployment advanced");
        }
        self.store.get_instance(&self.request.name).map_err(Into::into)
    }

    async fn ensure_image(&mut self) -> Result<(), DeployError> {
        let image_name = format!("stratus-{}", self.release.version);
        let images = self
            .provider
            .list_images()
            .await
            .map_err(step_err("list images"))?;

        if let Some(id) = images.get(&image_name) {
            info!(image = %image_name, id = %id, "image already present");
            self.image_id = Some(id.clone());
        } else {
            let artefact = self.release.image_for(self.provider.kind())?;
            info!(image = %image_name, url = %artefact.url, "importing image");
            let id = self
                .provider
                .add_image(&artefact.url, &artefact.digest, &self.release.version)
                .await
                .map_err(step_err("import image"))?;
            self.image_id = Some(id);
        }
        self.state = DeployState::ImageReady;
        Ok(())
    }

    fn generate_key(&mut self) -> Result<(), DeployError> {
        self.key = Some(KeyPair::generate()?);
        self.state = DeployState::KeyReady;
        Ok(())
    }

    async fn create_instance(&mut self) -> Result<(), DeployError> {
        let image_id = self.image_id.as_deref().unwrap_or_default();
        let public_key = self
            .key
            .as_ref()
            .map(KeyPair::public_openssh)
            .transpose()?
            .unwrap_or_default();

        let vm_id = self
            .provider
            .create_instance(&self.request.name, image_id, &public_key)
            .await
            .map_err(step_err("create instance"))?;

        // First checkpoint: the machine exists and must be findable even if
        // a later step fails. The key seed is withheld until the instance
        // has started.
        self.store.save_instance(&InstanceRecord {
            name: self.request.name.clone(),
            cloud_name: self.request.cloud.clone(),
            vm_id: vm_id.clone(),
            location: self.request.location.clone(),
            ..InstanceRecord::default()
        })?;

        self.vm_id = Some(vm_id);
        self.state = DeployState::InstanceCreated;
        Ok(())
    }

    async fn create_volume(&mut self) -> Result<(), DeployError> {
        let volume_id = self
            .provider
            .create_volume(&self.request.name, VOLUME_SIZE_MB)
            .await
            .map_err(step_err("create volume"))?;
        self.volume_id = Some(volume_id);
        self.state = DeployState::VolumeCreated;
        Ok(())
    }

    async fn attach_volume(&mut self) -> Result<(), DeployError> {
        let volume_id = self.volume_id.as_deref().unwrap_or_default();
        let vm_id = self.vm_id.as_deref().unwrap_or_default();
        self.provider
            .attach_volume(volume_id, vm_id)
            .await
            .map_err(step_err("attach volume"))?;
        self.state = DeployState::VolumeAttached;
        Ok(())
    }

    async fn start_instance(&mut self) -> Result<(), DeployError> {
        let vm_id = self.vm_id.as_deref().unwrap_or_default();
        self.provider
            .start_instance(vm_id)
            .await
            .map_err(step_err("start instance"))?;
        self.state = DeployState::Started;
        Ok(())
    }

    async fn record(&mut self) -> Result<(), DeployError> {
        let vm_id = self.vm_id.as_deref().unwrap_or_default();
        let snapshot = self
            .provider
            .instance_info(vm_id)
            .await
            .map_err(step_err("instance info"))?;

        let key_seed = self
            .key
            .as_ref()
            .map(|key| key.seed().to_vec())
            .unwrap_or_default();

        // Second checkpoint: the complete record. Only from here on can the
        // tunnel and key commands reconstruct the pair.
        self.store.save_instance(&InstanceRecord {
            name: self.request.name.clone(),
            cloud_name: self.request.cloud.clone(),
            vm_id: snapshot.vm_id,
            location: self.request.location.clone(),
            public_ip: snapshot.public_ip.unwrap_or_default(),
            volumes: snapshot
                .volumes
                .into_iter()
                .map(|volume| VolumeRecord {
                    name: volume.name,
                    volume_id: volume.volume_id,
                })
                .collect(),
            key_seed,
        })?;

        self.state = DeployState::Recorded;
        Ok(())
    }
}

/// Outcome of a teardown, reporting volume cleanup results.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TeardownOutcome {
    /// Identifiers of volumes that were deleted.
    pub deleted_volumes: Vec<String>,
    /// Identifiers of volumes whose deletion failed.
    pub failed_volumes: Vec<String>,
}

/// Tears down a deployed instance in the inverse order of deployment.
///
/// The virtual machine is stopped and deleted first. Volume deletion is
/// best effort: failures are logged and collected rather than aborting the
/// teardown. The local record is removed last so a failed teardown can be
/// retried.
///
/// # Errors
///
/// Returns [`DeployError`] when the record is missing or when stopping,
/// inspecting or deleting the virtual machine fails.
pub async fn teardown(
    provider: &dyn CloudProvider,
    store: &dyn Store,
    name: &str,
) -> Result<TeardownOutcome, DeployError> {
    let record = store.get_instance(name)?;

    provider
        .stop_instance(&record.vm_id)
        .await
        .map_err(step_err("stop instance"))?;
    let snapshot = provider
        .instance_info(&record.vm_id)
        .await
        .map_err(step_err("instance info"))?;
    provider
        .delete_instance(&record.vm_id)
        .await
        .map_err(step_err("delete instance"))?;

    let mut outcome = TeardownOutcome::default();
    for volume in snapshot.volumes {
        match provider.delete_volume(&volume.volume_id).await {
            Ok(()) => outcome.deleted_volumes.push(volume.volume_id),
            Err(err) => {
                warn!(volume = %volume.volume_id, error = %err, "volume deletion failed");
                outcome.failed_volumes.push(volume.volume_id);
            }
        }
    }

    store.delete_instance(name)?;
    info!(instance = %name, "instance deleted");
    Ok(outcome)
}

/// A stored instance together with a provider initialised for its cloud
/// account and location.
pub struct InstanceContext {
    /// The stored record.
    pub record: InstanceRecord,
    /// Provider bound to the owning account.
    pub provider: Box<dyn CloudProvider>,
}

/// Resolves an instance record and initialises a provider for it.
///
/// Shared by the delete, start, stop and tunnel commands.
///
/// # Errors
///
/// Returns [`DeployError`] when the record or its cloud account is missing
/// or when provider initialisation fails.
pub async fn instance_context(
    store: &dyn Store,
    name: &str,
) -> Result<InstanceContext, DeployError> {
    let record = store.get_instance(name)?;
    let cloud = store.get_cloud(&record.cloud_name)?;
    let mut provider = new_provider(cloud.kind);
    provider
        .init(&cloud.auth, &record.location)
        .await
        .map_err(step_err("initialise provider"))?;
    Ok(InstanceContext { record, provider })
}
