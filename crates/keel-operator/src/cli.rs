//! Command line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use keel_provision::{InstallerSettings, ReconcilerSettings, JOB_RETENTION};

/// keel - runs cluster provisioning attempts to completion
#[derive(Parser, Debug)]
#[command(name = "keel-operator", version, about, long_about = None)]
pub struct Cli {
    /// Controller settings
    #[command(flatten)]
    pub controller: ControllerArgs,

    /// What to run; the controller when omitted
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the ClusterProvision controller (default mode)
    Controller,

    /// Print the ClusterProvision CRD as YAML and exit
    Crd,

    /// Choose a VPC for a private-link endpoint and print it as JSON
    AllocateVpc(AllocateVpcArgs),
}

/// Where failure reasons of failed install jobs come from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum FailureReasonSource {
    /// Always `UnknownError`
    #[default]
    Unknown,
    /// The reason on the job's Failed condition
    JobCondition,
}

/// Log line format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable
    Text,
}

/// Controller flags
#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// Installer container image
    #[arg(
        long,
        env = "KEEL_INSTALLER_IMAGE",
        default_value = "ghcr.io/keel-dev/installer:latest"
    )]
    pub installer_image: String,

    /// Installer image pull policy
    #[arg(long, env = "KEEL_INSTALLER_PULL_POLICY")]
    pub installer_pull_policy: Option<String>,

    /// Service account the installer runs as
    #[arg(long, env = "KEEL_INSTALLER_SERVICE_ACCOUNT")]
    pub installer_service_account: Option<String>,

    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "KEEL_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Periodic resync of every attempt, in seconds
    #[arg(long, env = "KEEL_RESYNC_INTERVAL_SECS", default_value = "300")]
    pub resync_interval_secs: u64,

    /// Grace period after job creation before install pods are checked, in seconds
    #[arg(long, env = "KEEL_POD_STATUS_CHECK_DELAY_SECS", default_value = "600")]
    pub pod_status_check_delay_secs: u64,

    /// Source of failure reasons for failed install jobs
    #[arg(long, env = "KEEL_FAILURE_REASONS", value_enum, default_value_t)]
    pub failure_reasons: FailureReasonSource,

    /// Log format
    #[arg(long, env = "KEEL_LOG_FORMAT", value_enum, default_value_t)]
    pub log_format: LogFormat,
}

impl ControllerArgs {
    /// State machine settings from the flags
    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            installer: InstallerSettings {
                image: self.installer_image.clone(),
                image_pull_policy: self.installer_pull_policy.clone(),
                service_account: self.installer_service_account.clone(),
            },
            pod_status_check_delay: Duration::from_secs(self.pod_status_check_delay_secs),
            job_retention: JOB_RETENTION,
        }
    }

    /// Requeue interval when the reconciler does not ask for one
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}

/// allocate-vpc flags
#[derive(Parser, Debug, Clone)]
pub struct AllocateVpcArgs {
    /// Path to the private-link configuration (endpointVPCInventory)
    #[arg(short = 'f', long = "inventory", env = "KEEL_PRIVATELINK_INVENTORY")]
    pub inventory: PathBuf,

    /// Region of the cluster the endpoint is for
    #[arg(long)]
    pub region: String,

    /// Name of the VPC endpoint service
    #[arg(long)]
    pub service_name: String,
}
