//! keel operator - drives ClusterProvision install jobs and allocates
//! private-link VPCs

use std::sync::Arc;

use clap::Parser;
use kube::{Client, CustomResourceExt};

use keel_common::crd::ClusterProvision;
use keel_common::telemetry::{init_telemetry, TelemetryConfig};
use keel_operator::cli::{AllocateVpcArgs, Cli, Commands, ControllerArgs, LogFormat};
use keel_operator::controller_runner::build_provision_controller;
use keel_privatelink::{AwsEc2Client, ClusterPlatform, PrivateLinkConfig, VpcAllocator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Some(Commands::Crd)) {
        let crd = serde_yaml::to_string(&ClusterProvision::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "keel-operator".to_string(),
        json: cli.controller.log_format == LogFormat::Json,
        ..Default::default()
    })?;

    match cli.command {
        Some(Commands::AllocateVpc(args)) => run_allocate_vpc(args).await,
        Some(Commands::Controller) | Some(Commands::Crd) | None => {
            run_controller(cli.controller).await
        }
    }
}

/// Run the ClusterProvision controller until shutdown
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    tracing::info!(
        image = %args.installer_image,
        failure_reasons = ?args.failure_reasons,
        "Starting keel operator"
    );

    build_provision_controller(client, &args).await;

    tracing::info!("Controller shut down");
    Ok(())
}

/// Choose a VPC from the inventory and print it
async fn run_allocate_vpc(args: AllocateVpcArgs) -> anyhow::Result<()> {
    let config = PrivateLinkConfig::load(&args.inventory)?;
    let allocator = VpcAllocator::new(Arc::new(config.endpoint_vpc_inventory));
    let ec2 = AwsEc2Client::new(&args.region).await;

    let chosen = allocator
        .choose_vpc(&ec2, &ClusterPlatform::new(&args.region), &args.service_name)
        .await?;

    println!("{}", serde_json::to_string_pretty(&chosen)?);
    Ok(())
}
