//! Command-line interface definitions for the `stratus` binary.

use clap::{Parser, Subcommand};

/// Top-level argument parser.
#[derive(Debug, Parser)]
#[command(
    name = "stratus",
    about = "Deploy instances on third-party clouds and tunnel into them",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Selected command group.
    #[command(subcommand)]
    pub command: Command,
}

/// Command groups.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage cloud provider accounts.
    #[command(subcommand)]
    Cloud(CloudCommand),
    /// Manage deployed instances.
    #[command(subcommand)]
    Instance(InstanceCommand),
}

/// Cloud account commands.
#[derive(Debug, Subcommand)]
pub enum CloudCommand {
    /// List stored cloud accounts.
    Ls,
    /// Add a cloud account, prompting for credentials.
    Add {
        /// Unique name for the new account.
        name: String,
    },
    /// Remove a stored cloud account.
    Delete {
        /// Name of the account to remove.
        name: String,
    },
    /// Show details of a stored cloud account.
    Info {
        /// Name of the account to show.
        name: String,
    },
}

/// Instance commands.
#[derive(Debug, Subcommand)]
pub enum InstanceCommand {
    /// List deployed instances.
    Ls,
    /// Deploy a new instance.
    Deploy {
        /// Unique name for the new instance.
        name: String,
        /// Cloud account to deploy through.
        #[arg(long)]
        cloud: String,
        /// Provider location to deploy into.
        #[arg(long)]
        location: String,
        /// Release version to deploy. Defaults to the latest release.
        #[arg(long)]
        version: Option<String>,
    },
    /// Stop and delete an instance and its volumes.
    Delete {
        /// Name of the instance to delete.
        name: String,
    },
    /// Power an instance on.
    Start {
        /// Name of the instance to start.
        name: String,
    },
    /// Power an instance off.
    Stop {
        /// Name of the instance to stop.
        name: String,
    },
    /// Open an SSH tunnel to the instance dashboard.
    Tunnel {
        /// Name of the instance to tunnel to.
        name: String,
    },
    /// Print the instance's private SSH key in OpenSSH PEM format.
    Key {
        /// Name of the instance whose key to print.
        name: String,
    },
}
