//! Behaviour tests for the provisioning pipeline against a stub provider.

use std::collections::BTreeMap;

use stratus::cloud::{InstanceSnapshot, VolumeSummary};
use stratus::deploy::{teardown, DeployError, DeployRequest, DeployState, Deployment};
use stratus::release::{CloudImage, Release};
use stratus::store::{InstanceRecord, Store};
use stratus::test_support::{MemoryStore, StubProvider};
use stratus::SEED_LEN;

fn release_with_image() -> Release {
    Release {
        version: String::from("1.0"),
        cloud_images: BTreeMap::from([(
            String::from("scaleway"),
            CloudImage {
                url: String::from("https://example.org/stratus-1.0.img"),
                digest: String::from("abc123"),
            },
        )]),
    }
}

fn request(name: &str) -> DeployRequest {
    DeployRequest {
        name: name.to_owned(),
        cloud: String::from("scw-main"),
        location: String::from("test-zone-1"),
    }
}

fn started_snapshot(name: &str) -> InstanceSnapshot {
    InstanceSnapshot {
        vm_id: format!("vm-{name}"),
        name: name.to_owned(),
        location: String::from("test-zone-1"),
        public_ip: Some(String::from("192.0.2.7")),
        volumes: vec![VolumeSummary {
            name: name.to_owned(),
            volume_id: format!("vol-{name}"),
        }],
    }
}

#[tokio::test]
async fn vm_id_is_persisted_before_key_seed() {
    let provider = StubProvider::new();
    provider.seed_image("stratus-1.0", "img-1.0");
    provider.set_snapshot(started_snapshot("web1"));
    let store = MemoryStore::new();

    let mut deployment =
        Deployment::new(&provider, &store, request("web1"), release_with_image())
            .unwrap_or_else(|err| panic!("new: {err}"));

    while deployment.state() != DeployState::InstanceCreated {
        deployment
            .advance()
            .await
            .unwrap_or_else(|err| panic!("advance: {err}"));
    }

    // First checkpoint: the machine identifier is recoverable, the key is
    // not yet committed.
    let partial = store
        .get_instance("web1")
        .unwrap_or_else(|err| panic!("get: {err}"));
    assert_eq!(partial.vm_id, "vm-web1");
    assert!(partial.key_seed.is_empty());
    assert!(partial.public_ip.is_empty());

    while deployment.state() != DeployState::Recorded {
        deployment
            .advance()
            .await
            .unwrap_or_else(|err| panic!("advance: {err}"));
    }

    let complete = store
        .get_instance("web1")
        .unwrap_or_else(|err| panic!("get: {err}"));
    assert_eq!(complete.key_seed.len(), SEED_LEN);
    assert_eq!(complete.public_ip, "192.0.2.7");
    assert_eq!(complete.volumes.len(), 1);
}

#[tokio::test]
async fn missing_image_is_imported_before_instance_creation() {
    let provider = StubProvider::new();
    provider.set_snapshot(started_snapshot("web1"));
    let store = MemoryStore::new();

    Deployment::new(&provider, &store, request("web1"), release_with_image())
        .unwrap_or_else(|err| panic!("new: {err}"))
        .run()
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    let labels = provider.call_labels();
    let add_index = labels
        .iter()
        .position(|label| *label == "add_image")
        .unwrap_or_else(|| panic!("add_image not called: {labels:?}"));
    let create_index = labels
        .iter()
        .position(|label| *label == "create_instance")
        .unwrap_or_else(|| panic!("create_instance not called: {labels:?}"));
    assert!(add_index < create_index);

    let calls = provider.calls();
    let imported = calls.iter().any(|call| {
        matches!(
            call,
            stratus::test_support::Call::AddImage(url, digest, version)
                if url == "https://example.org/stratus-1.0.img"
                    && digest == "abc123"
                    && version == "1.0"
        )
    });
    assert!(imported, "import did not use the release artefact: {calls:?}");
}

#[tokio::test]
async fn present_image_is_not_reimported() {
    let provider = StubProvider::new();
    provider.seed_image("stratus-1.0", "img-1.0");
    provider.set_snapshot(started_snapshot("web1"));
    let store = MemoryStore::new();

    Deployment::new(&provider, &store, request("web1"), release_with_image())
        .unwrap_or_else(|err| panic!("new: {err}"))
        .run()
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    assert!(!provider.call_labels().contains(&"add_image"));
}

#[tokio::test]
async fn duplicate_instance_name_is_rejected() {
    let provider = StubProvider::new();
    let store = MemoryStore::new();
    store
        .save_instance(&InstanceRecord {
            name: String::from("web1"),
            ..InstanceRecord::default()
        })
        .unwrap_or_else(|err| panic!("save: {err}"));

    let result = Deployment::new(&provider, &store, request("web1"), release_with_image());
    assert!(matches!(
        result,
        Err(DeployError::AlreadyExists { name }) if name == "web1"
    ));
}

#[tokio::test]
async fn attach_failure_leaves_recoverable_record() {
    let provider = StubProvider::new();
    provider.seed_image("stratus-1.0", "img-1.0");
    provider.fail_on("attach_volume");
    let store = MemoryStore::new();

    let result = Deployment::new(&provider, &store, request("web1"), release_with_image())
        .unwrap_or_else(|err| panic!("new: {err}"))
        .run()
        .await;
    assert!(matches!(result, Err(DeployError::Provider { .. })));

    // The first checkpoint survives the failure, so teardown can find the
    // machine.
    let partial = store
        .get_instance("web1")
        .unwrap_or_else(|err| panic!("get: {err}"));
    assert_eq!(partial.vm_id, "vm-web1");
    assert!(partial.volumes.is_empty());
    assert!(partial.key_seed.is_empty());

    let cleanup = StubProvider::new();
    let outcome = teardown(&cleanup, &store, "web1")
        .await
        .unwrap_or_else(|err| panic!("teardown: {err}"));
    assert!(outcome.failed_volumes.is_empty());
    assert!(store.get_instance("web1").is_err());
    assert!(cleanup.call_labels().contains(&"delete_instance"));
}

#[tokio::test]
async fn teardown_tolerates_one_failing_volume() {
    let provider = StubProvider::new();
    provider.set_snapshot(InstanceSnapshot {
        vm_id: String::from("vm-web1"),
        name: String::from("web1"),
        location: String::from("test-zone-1"),
        public_ip: Some(String::from("192.0.2.7")),
        volumes: vec![
            VolumeSummary {
                name: String::from("boot"),
                volume_id: String::from("vol-boot"),
            },
            VolumeSummary {
                name: String::from("data"),
                volume_id: String::from("vol-data"),
            },
        ],
    });
    provider.fail_once("delete_volume");

    let store = MemoryStore::new();
    store
        .save_instance(&InstanceRecord {
            name: String::from("web1"),
            vm_id: String::from("vm-web1"),
            ..InstanceRecord::default()
        })
        .unwrap_or_else(|err| panic!("save: {err}"));

    let outcome = teardown(&provider, &store, "web1")
        .await
        .unwrap_or_else(|err| panic!("teardown: {err}"));

    assert_eq!(outcome.failed_volumes, vec![String::from("vol-boot")]);
    assert_eq!(outcome.deleted_volumes, vec![String::from("vol-data")]);
    // The record goes away even though one volume leaked.
    assert!(store.get_instance("web1").is_err());
}

#[tokio::test]
async fn teardown_order_is_stop_info_delete() {
    let provider = StubProvider::new();
    provider.set_snapshot(started_snapshot("web1"));
    let store = MemoryStore::new();
    store
        .save_instance(&InstanceRecord {
            name: String::from("web1"),
            vm_id: String::from("vm-web1"),
            ..InstanceRecord::default()
        })
        .unwrap_or_else(|err| panic!("save: {err}"));

    teardown(&provider, &store, "web1")
        .await
        .unwrap_or_else(|err| panic!("teardown: {err}"));

    assert_eq!(
        provider.call_labels(),
        vec![
            "stop_instance",
            "instance_info",
            "delete_instance",
            "delete_volume"
        ]
    );
}
