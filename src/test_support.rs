//! Test support utilities shared across unit and integration tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::cloud::{
    CloudProvider, InstanceSnapshot, ProviderError, ProviderFuture, ProviderKind,
};
use crate::store::{CloudRecord, InstanceRecord, Store, StoreError};

/// One provider operation observed by [`StubProvider`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Call {
    /// `init` with the bound location.
    Init(String),
    /// `list_images`.
    ListImages,
    /// `add_image(url, digest, version)`.
    AddImage(String, String, String),
    /// `create_instance(name, image_id, public_key)`.
    CreateInstance(String, String, String),
    /// `instance_info(vm_id)`.
    InstanceInfo(String),
    /// `start_instance(vm_id)`.
    StartInstance(String),
    /// `stop_instance(vm_id)`.
    StopInstance(String),
    /// `delete_instance(vm_id)`.
    DeleteInstance(String),
    /// `create_volume(name, size_mb)`.
    CreateVolume(String, u64),
    /// `attach_volume(volume_id, vm_id)`.
    AttachVolume(String, String),
    /// `delete_volume(volume_id)`.
    DeleteVolume(String),
}

impl Call {
    /// Returns a short operation label, handy for call-order assertions.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::ListImages => "list_images",
            Self::AddImage(..) => "add_image",
            Self::CreateInstance(..) => "create_instance",
            Self::InstanceInfo(_) => "instance_info",
            Self::StartInstance(_) => "start_instance",
            Self::StopInstance(_) => "stop_instance",
            Self::DeleteInstance(_) => "delete_instance",
            Self::CreateVolume(..) => "create_volume",
            Self::AttachVolume(..) => "attach_volume",
            Self::DeleteVolume(_) => "delete_volume",
        }
    }
}

#[derive(Debug, Default)]
struct StubState {
    calls: Vec<Call>,
    images: BTreeMap<String, String>,
    failures: Vec<&'static str>,
    one_shot_failures: Vec<&'static str>,
    snapshot: InstanceSnapshot,
}

/// In-memory [`CloudProvider`] that records calls and returns scripted
/// results.
#[derive(Debug, Default)]
pub struct StubProvider {
    state: Mutex<StubState>,
}

impl StubProvider {
    /// Creates a stub with no pre-seeded images and no scripted failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeds an image as already present on the cloud.
    pub fn seed_image(&self, name: &str, id: &str) {
        self.lock().images.insert(name.to_owned(), id.to_owned());
    }

    /// Scripts the named operation to fail on every call.
    pub fn fail_on(&self, operation: &'static str) {
        self.lock().failures.push(operation);
    }

    /// Scripts the named operation to fail exactly once, then succeed.
    pub fn fail_once(&self, operation: &'static str) {
        self.lock().one_shot_failures.push(operation);
    }

    /// Sets the snapshot returned by `instance_info`.
    pub fn set_snapshot(&self, snapshot: InstanceSnapshot) {
        self.lock().snapshot = snapshot;
    }

    /// Returns every call observed so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Returns the operation labels of every call, in order.
    #[must_use]
    pub fn call_labels(&self) -> Vec<&'static str> {
        self.lock().calls.iter().map(Call::label).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StubState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn observe(&self, operation: &'static str, call: Call) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.calls.push(call);
        if let Some(index) = state
            .one_shot_failures
            .iter()
            .position(|scripted| *scripted == operation)
        {
            state.one_shot_failures.remove(index);
            return Err(ProviderError::Api {
                operation,
                message: String::from("scripted failure"),
            });
        }
        if state.failures.contains(&operation) {
            return Err(ProviderError::Api {
                operation,
                message: String::from("scripted failure"),
            });
        }
        Ok(())
    }
}

impl CloudProvider for StubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Scaleway
    }

    fn auth_fields(&self) -> &'static [&'static str] {
        &["secret_key"]
    }

    fn supported_locations(&self) -> &'static [&'static str] {
        &["test-zone-1"]
    }

    fn init<'a>(
        &'a mut self,
        _auth: &'a BTreeMap<String, String>,
        location: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move { self.observe("init", Call::Init(location.to_owned())) })
    }

    fn list_images(&self) -> ProviderFuture<'_, BTreeMap<String, String>> {
        Box::pin(async move {
            self.observe("list_images", Call::ListImages)?;
            Ok(self.lock().images.clone())
        })
    }

    fn add_image<'a>(
        &'a self,
        url: &'a str,
        digest: &'a str,
        version: &'a str,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            self.observe(
                "add_image",
                Call::AddImage(url.to_owned(), digest.to_owned(), version.to_owned()),
            )?;
            let id = format!("img-{version}");
            self.lock()
                .images
                .insert(format!("stratus-{version}"), id.clone());
            Ok(id)
        })
    }

    fn create_instance<'a>(
        &'a self,
        name: &'a str,
        image_id: &'a str,
        public_key: &'a str,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            self.observe(
                "create_instance",
                Call::CreateInstance(
                    name.to_owned(),
                    image_id.to_owned(),
                    public_key.to_owned(),
                ),
            )?;
            Ok(format!("vm-{name}"))
        })
    }

    fn instance_info<'a>(&'a self, vm_id: &'a str) -> ProviderFuture<'a, InstanceSnapshot> {
        Box::pin(async move {
            self.observe("instance_info", Call::InstanceInfo(vm_id.to_owned()))?;
            let mut snapshot = self.lock().snapshot.clone();
            if snapshot.vm_id.is_empty() {
                snapshot.vm_id = vm_id.to_owned();
            }
            Ok(snapshot)
        })
    }

    fn start_instance<'a>(&'a self, vm_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.observe("start_instance", Call::StartInstance(vm_id.to_owned()))
        })
    }

    fn stop_instance<'a>(&'a self, vm_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.observe("stop_instance", Call::StopInstance(vm_id.to_owned()))
        })
    }

    fn delete_instance<'a>(&'a self, vm_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.observe("delete_instance", Call::DeleteInstance(vm_id.to_owned()))
        })
    }

    fn create_volume<'a>(&'a self, name: &'a str, size_mb: u64) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            self.observe("create_volume", Call::CreateVolume(name.to_owned(), size_mb))?;
            Ok(format!("vol-{name}"))
        })
    }

    fn attach_volume<'a>(&'a self, volume_id: &'a str, vm_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.observe(
                "attach_volume",
                Call::AttachVolume(volume_id.to_owned(), vm_id.to_owned()),
            )
        })
    }

    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.observe("delete_volume", Call::DeleteVolume(volume_id.to_owned()))
        })
    }
}

/// In-memory [`Store`] for orchestrator tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    clouds: Mutex<BTreeMap<String, CloudRecord>>,
    instances: Mutex<BTreeMap<String, InstanceRecord>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn clouds(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, CloudRecord>> {
        self.clouds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn instances(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, InstanceRecord>> {
        self.instances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Store for MemoryStore {
    fn get_all_clouds(&self) -> Result<Vec<CloudRecord>, StoreError> {
        Ok(self.clouds().values().cloned().collect())
    }

    fn get_cloud(&self, name: &str) -> Result<CloudRecord, StoreError> {
        self.clouds()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::cloud_not_found(name))
    }

    fn save_cloud(&self, record: &CloudRecord) -> Result<(), StoreError> {
        self.clouds().insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn delete_cloud(&self, name: &str) -> Result<(), StoreError> {
        self.clouds()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::cloud_not_found(name))
    }

    fn get_all_instances(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        Ok(self.instances().values().cloned().collect())
    }

    fn get_instance(&self, name: &str) -> Result<InstanceRecord, StoreError> {
        self.instances()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::instance_not_found(name))
    }

    fn save_instance(&self, record: &InstanceRecord) -> Result<(), StoreError> {
        self.instances().insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn delete_instance(&self, name: &str) -> Result<(), StoreError> {
        self.instances()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::instance_not_found(name))
    }
}
