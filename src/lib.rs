//! Core library for the stratus deployment tool.
//!
//! The crate provisions virtual-machine instances on third-party clouds
//! (image → key pair → instance → volume → start → record) and opens
//! SSH-based tunnels to the dashboard running on each instance. Cloud
//! accounts and deployed instances are tracked in a local JSON store.

pub mod cli;
pub mod cloud;
pub mod config;
pub mod deploy;
pub mod keys;
pub mod release;
pub mod scaleway;
pub mod store;
pub mod test_support;
pub mod tunnel;

pub use cloud::{
    new_provider, provider_for_name, supported_providers, CloudProvider, InstanceSnapshot,
    ProviderError, ProviderKind, VolumeSummary,
};
pub use config::{AppConfig, ConfigError};
pub use deploy::{
    instance_context, teardown, DeployError, DeployRequest, DeployState, Deployment,
    InstanceContext, TeardownOutcome, VOLUME_SIZE_MB,
};
pub use keys::{KeyError, KeyPair, SEED_LEN};
pub use release::{CloudImage, Release, ReleaseError, ReleaseIndex};
pub use scaleway::ScalewayProvider;
pub use store::{CloudRecord, FileStore, InstanceRecord, Store, StoreError, VolumeRecord};
pub use tunnel::{ForwardTarget, RelayStream, Tunnel, TunnelError};
