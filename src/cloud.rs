//! Cloud provider capability boundary.
//!
//! Every supported cloud implements [`CloudProvider`]. The trait uses boxed
//! futures so providers stay object safe and can be handed around as
//! `Box<dyn CloudProvider>` from the string-keyed factory.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scaleway::ScalewayProvider;

/// Boxed future type returned by [`CloudProvider`] operations.
pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Errors raised by cloud providers and the provider factory.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Raised when a remote API call fails.
    #[error("{operation} failed: {message}")]
    Api {
        /// The provider operation that failed.
        operation: &'static str,
        /// Human-readable failure detail from the transport or API.
        message: String,
    },
    /// Raised when a provider name is not recognised.
    #[error("unsupported cloud provider '{name}'")]
    Unsupported {
        /// The rejected provider name.
        name: String,
    },
    /// Raised when a required credential field is missing from the
    /// account's auth map.
    #[error("missing credential field '{field}'")]
    MissingCredential {
        /// Name of the absent field.
        field: &'static str,
    },
    /// Raised when an operation is invoked before [`CloudProvider::init`].
    #[error("provider has not been initialised")]
    NotInitialised,
}

impl ProviderError {
    pub(crate) fn api(operation: &'static str, err: impl fmt::Display) -> Self {
        Self::Api {
            operation,
            message: err.to_string(),
        }
    }
}

/// Identifies a supported cloud provider.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Scaleway elastic metal and instance API.
    Scaleway,
}

impl ProviderKind {
    /// Returns the canonical lowercase name of the provider.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Scaleway => "scaleway",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scaleway" => Ok(Self::Scaleway),
            other => Err(ProviderError::Unsupported {
                name: other.to_owned(),
            }),
        }
    }
}

/// Returns every provider the factory can construct.
#[must_use]
pub const fn supported_providers() -> &'static [ProviderKind] {
    &[ProviderKind::Scaleway]
}

/// A volume as reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeSummary {
    /// Human-friendly volume name.
    pub name: String,
    /// Provider-assigned volume identifier.
    pub volume_id: String,
}

/// Point-in-time view of a virtual machine as reported by the provider.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceSnapshot {
    /// Provider-assigned virtual machine identifier.
    pub vm_id: String,
    /// Instance name.
    pub name: String,
    /// Deployment location.
    pub location: String,
    /// Public IPv4 address, when one is attached.
    pub public_ip: Option<String>,
    /// Attached volumes in attachment order.
    pub volumes: Vec<VolumeSummary>,
}

/// Operations every cloud provider must support.
///
/// All remote calls surface failures as [`ProviderError::Api`] carrying the
/// operation name; none of them retries.
pub trait CloudProvider: Send + Sync {
    /// Returns which provider this is.
    fn kind(&self) -> ProviderKind;

    /// Returns the credential field names the provider requires. Fields
    /// ending in `(optional)` semantics are documented per provider.
    fn auth_fields(&self) -> &'static [&'static str];

    /// Returns the locations instances can be deployed to.
    fn supported_locations(&self) -> &'static [&'static str];

    /// Validates the credentials and binds the provider to a location.
    ///
    /// May be called again to rebind to a different location.
    fn init<'a>(
        &'a mut self,
        auth: &'a BTreeMap<String, String>,
        location: &'a str,
    ) -> ProviderFuture<'a, ()>;

    /// Lists available images as a name to identifier map.
    fn list_images(&self) -> ProviderFuture<'_, BTreeMap<String, String>>;

    /// Imports an image from an external URL and returns its identifier.
    fn add_image<'a>(
        &'a self,
        url: &'a str,
        digest: &'a str,
        version: &'a str,
    ) -> ProviderFuture<'a, String>;

    /// Creates a stopped instance from an image, injecting the public key,
    /// and returns the new virtual machine identifier.
    fn create_instance<'a>(
        &'a self,
        name: &'a str,
        image_id: &'a str,
        public_key: &'a str,
    ) -> ProviderFuture<'a, String>;

    /// Fetches the current state of a virtual machine.
    fn instance_info<'a>(&'a self, vm_id: &'a str) -> ProviderFuture<'a, InstanceSnapshot>;

    /// Powers the virtual machine on.
    fn start_instance<'a>(&'a self, vm_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Powers the virtual machine off.
    fn stop_instance<'a>(&'a self, vm_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Deletes the virtual machine. Attached volumes survive and must be
    /// deleted separately.
    fn delete_instance<'a>(&'a self, vm_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Creates a block volume of the given size in megabytes and returns
    /// its identifier.
    fn create_volume<'a>(&'a self, name: &'a str, size_mb: u64) -> ProviderFuture<'a, String>;

    /// Attaches a volume to a virtual machine.
    fn attach_volume<'a>(&'a self, volume_id: &'a str, vm_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Deletes a volume.
    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> ProviderFuture<'a, ()>;
}

/// Constructs an uninitialised provider of the given kind.
#[must_use]
pub fn new_provider(kind: ProviderKind) -> Box<dyn CloudProvider> {
    match kind {
        ProviderKind::Scaleway => Box::new(ScalewayProvider::new()),
    }
}

/// Constructs an uninitialised provider from its string name.
///
/// # Errors
///
/// Returns [`ProviderError::Unsupported`] when the name does not match a
/// known provider.
pub fn provider_for_name(name: &str) -> Result<Box<dyn CloudProvider>, ProviderError> {
    Ok(new_provider(name.parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_rejects_unknown_provider() {
        let result = provider_for_name("digitalocean");
        assert!(matches!(
            result,
            Err(ProviderError::Unsupported { name }) if name == "digitalocean"
        ));
    }

    #[test]
    fn factory_builds_scaleway() {
        let provider =
            provider_for_name("scaleway").unwrap_or_else(|err| panic!("factory: {err}"));
        assert_eq!(provider.kind(), ProviderKind::Scaleway);
        assert!(provider.auth_fields().contains(&"secret_key"));
    }

    #[test]
    fn kind_name_round_trips() {
        for kind in supported_providers() {
            let parsed: ProviderKind = kind
                .name()
                .parse()
                .unwrap_or_else(|err| panic!("parse: {err}"));
            assert_eq!(parsed, *kind);
        }
    }
}
