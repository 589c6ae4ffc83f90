//! Binary entry point for the stratus CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use dialoguer::{Password, Select};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stratus::cli::{Cli, CloudCommand, Command, InstanceCommand};
use stratus::cloud::{new_provider, supported_providers, CloudProvider, ProviderError};
use stratus::config::{AppConfig, ConfigError};
use stratus::deploy::{instance_context, teardown, DeployError, DeployRequest, Deployment};
use stratus::keys::{KeyError, KeyPair};
use stratus::release::{ReleaseError, ReleaseIndex};
use stratus::store::{CloudRecord, FileStore, Store, StoreError};
use stratus::tunnel::{Tunnel, TunnelError};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Deploy(#[from] DeployError),
    #[error(transparent)]
    Release(#[from] ReleaseError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error("prompt failed: {0}")]
    Prompt(String),
    #[error("instance '{name}' has not completed deployment")]
    NotReady { name: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let config = AppConfig::load_from_sources()?;
    let store = FileStore::new(config.store_path()?);

    match cli.command {
        Command::Cloud(command) => cloud_command(command, &store).await,
        Command::Instance(command) => instance_command(command, &config, &store).await,
    }
}

async fn cloud_command(command: CloudCommand, store: &FileStore) -> Result<(), CliError> {
    match command {
        CloudCommand::Ls => cloud_ls(store),
        CloudCommand::Add { name } => cloud_add(store, &name).await,
        CloudCommand::Delete { name } => {
            store.delete_cloud(&name)?;
            info!(cloud = %name, "cloud account removed");
            Ok(())
        }
        CloudCommand::Info { name } => cloud_info(store, &name).await,
    }
}

fn cloud_ls(store: &FileStore) -> Result<(), CliError> {
    let clouds = store.get_all_clouds()?;
    let mut out = io::stdout();
    writeln!(out, "{:<24} {:<12}", "NAME", "PROVIDER").ok();
    for cloud in clouds {
        writeln!(out, "{:<24} {:<12}", cloud.name, cloud.kind).ok();
    }
    Ok(())
}

async fn cloud_add(store: &FileStore, name: &str) -> Result<(), CliError> {
    let kinds = supported_providers();
    let labels: Vec<&str> = kinds.iter().map(|kind| kind.name()).collect();
    let selection = Select::new()
        .with_prompt("Cloud provider")
        .items(&labels)
        .default(0)
        .interact()
        .map_err(|err| CliError::Prompt(err.to_string()))?;
    let kind = kinds
        .get(selection)
        .copied()
        .ok_or_else(|| CliError::Prompt(String::from("invalid provider selection")))?;

    let mut provider = new_provider(kind);
    let mut auth = std::collections::BTreeMap::new();
    for field in provider.auth_fields() {
        let value = Password::new()
            .with_prompt(*field)
            .allow_empty_password(true)
            .interact()
            .map_err(|err| CliError::Prompt(err.to_string()))?;
        auth.insert((*field).to_owned(), value);
    }

    // Prove the credentials against a real location before persisting.
    let location = provider
        .supported_locations()
        .first()
        .copied()
        .unwrap_or_default();
    provider.init(&auth, location).await?;

    store.save_cloud(&CloudRecord {
        name: name.to_owned(),
        kind,
        auth,
    })?;
    info!(cloud = %name, provider = %kind, "cloud account added");
    Ok(())
}

async fn cloud_info(store: &FileStore, name: &str) -> Result<(), CliError> {
    let cloud = store.get_cloud(name)?;
    let mut provider = new_provider(cloud.kind);
    let rendered = render_cloud_info(&cloud, provider.as_mut()).await;
    let mut out = io::stdout();
    write!(out, "{rendered}").ok();
    Ok(())
}

/// Probes the stored credentials with a provider `init` so the status line
/// reflects whether the account is currently usable.
async fn render_cloud_info(cloud: &CloudRecord, provider: &mut dyn CloudProvider) -> String {
    let location = provider
        .supported_locations()
        .first()
        .copied()
        .unwrap_or_default();
    let status = match provider.init(&cloud.auth, location).await {
        Ok(()) => String::from("reachable"),
        Err(err) => format!("unreachable ({err})"),
    };
    format!(
        "Name:      {}\nProvider:  {}\nLocations: {}\nCredential fields: {}\nStatus:    {}\n",
        cloud.name,
        cloud.kind,
        provider.supported_locations().join(", "),
        provider.auth_fields().join(", "),
        status
    )
}

async fn instance_command(
    command: InstanceCommand,
    config: &AppConfig,
    store: &FileStore,
) -> Result<(), CliError> {
    match command {
        InstanceCommand::Ls => instance_ls(store),
        InstanceCommand::Deploy {
            name,
            cloud,
            location,
            version,
        } => {
            instance_deploy(config, store, name, cloud, location, version).await
        }
        InstanceCommand::Delete { name } => instance_delete(store, &name).await,
        InstanceCommand::Start { name } => {
            let context = instance_context(store, &name).await?;
            context
                .provider
                .start_instance(&context.record.vm_id)
                .await?;
            info!(instance = %name, "instance started");
            Ok(())
        }
        InstanceCommand::Stop { name } => {
            let context = instance_context(store, &name).await?;
            context
                .provider
                .stop_instance(&context.record.vm_id)
                .await?;
            info!(instance = %name, "instance stopped");
            Ok(())
        }
        InstanceCommand::Tunnel { name } => instance_tunnel(store, &name).await,
        InstanceCommand::Key { name } => instance_key(store, &name),
    }
}

fn instance_ls(store: &FileStore) -> Result<(), CliError> {
    let instances = store.get_all_instances()?;
    let mut out = io::stdout();
    writeln!(
        out,
        "{:<24} {:<16} {:<12} {:<16} {}",
        "NAME", "CLOUD", "LOCATION", "PUBLIC IP", "VM ID"
    )
    .ok();
    for instance in instances {
        writeln!(
            out,
            "{:<24} {:<16} {:<12} {:<16} {}",
            instance.name, instance.cloud_name, instance.location, instance.public_ip,
            instance.vm_id
        )
        .ok();
    }
    Ok(())
}

async fn instance_deploy(
    config: &AppConfig,
    store: &FileStore,
    name: String,
    cloud: String,
    location: String,
    version: Option<String>,
) -> Result<(), CliError> {
    let index = ReleaseIndex::fetch(&config.releases_url).await?;
    let release = match &version {
        Some(requested) => index.version(requested)?,
        None => index.latest()?,
    }
    .clone();

    let account = store.get_cloud(&cloud)?;
    let mut provider = new_provider(account.kind);
    provider.init(&account.auth, &location).await?;

    let request = DeployRequest {
        name: name.clone(),
        cloud,
        location,
    };
    let record = Deployment::new(provider.as_ref(), store, request, release)?
        .run()
        .await?;
    info!(instance = %name, ip = %record.public_ip, "instance deployed");
    Ok(())
}

async fn instance_delete(store: &FileStore, name: &str) -> Result<(), CliError> {
    let context = instance_context(store, name).await?;
    let outcome = teardown(context.provider.as_ref(), store, name).await?;
    if !outcome.failed_volumes.is_empty() {
        let mut out = io::stdout();
        writeln!(
            out,
            "warning: {} volume(s) could not be deleted: {}",
            outcome.failed_volumes.len(),
            outcome.failed_volumes.join(", ")
        )
        .ok();
    }
    Ok(())
}

async fn instance_tunnel(store: &FileStore, name: &str) -> Result<(), CliError> {
    let context = instance_context(store, name).await?;
    let record = context.record;
    if record.public_ip.is_empty() || record.key_seed.is_empty() {
        return Err(CliError::NotReady {
            name: name.to_owned(),
        });
    }

    let key = KeyPair::from_seed(&record.key_seed)?;
    let mut tunnel = Tunnel::start(&record.public_ip, key.credential()).await?;

    let mut out = io::stdout();
    writeln!(
        out,
        "Tunnel open: http://localhost:{} -> {} (press Ctrl-C to close)",
        tunnel.local_port(),
        record.public_ip
    )
    .ok();

    tokio::signal::ctrl_c().await.ok();
    tunnel.close().await;
    writeln!(out, "Tunnel closed").ok();
    Ok(())
}

fn instance_key(store: &FileStore, name: &str) -> Result<(), CliError> {
    let record = store.get_instance(name)?;
    if record.key_seed.is_empty() {
        return Err(CliError::NotReady {
            name: name.to_owned(),
        });
    }
    let key = KeyPair::from_seed(&record.key_seed)?;
    let mut out = io::stdout();
    write!(out, "{}", key.private_pem()?).ok();
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use stratus::cloud::ProviderKind;
    use stratus::test_support::StubProvider;

    use super::*;

    fn account() -> CloudRecord {
        CloudRecord {
            name: String::from("scw-main"),
            kind: ProviderKind::Scaleway,
            auth: BTreeMap::from([(String::from("secret_key"), String::from("s3cret"))]),
        }
    }

    #[tokio::test]
    async fn cloud_info_reports_reachable_account() {
        let mut provider = StubProvider::new();
        let rendered = render_cloud_info(&account(), &mut provider).await;
        assert!(rendered.contains("Status:    reachable"), "{rendered}");
        assert!(rendered.contains("Name:      scw-main"), "{rendered}");
    }

    #[tokio::test]
    async fn cloud_info_reports_unreachable_account() {
        let mut provider = StubProvider::new();
        provider.fail_on("init");
        let rendered = render_cloud_info(&account(), &mut provider).await;
        assert!(
            rendered.contains("Status:    unreachable (init failed"),
            "{rendered}"
        );
    }
}
