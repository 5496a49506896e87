//! EC2 queries used by the allocator
//!
//! Only two read calls are needed: which AZs an endpoint service is offered
//! in, and which endpoints already exist in a set of VPCs.

use async_trait::async_trait;
use aws_sdk_ec2::error::DisplayErrorContext;
use aws_sdk_ec2::types::Filter;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::error::AllocationError;

/// An existing VPC endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VpcEndpointSummary {
    /// Endpoint ID
    pub endpoint_id: String,
    /// VPC the endpoint lives in
    pub vpc_id: String,
}

/// The EC2 calls the allocator depends on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Ec2Api: Send + Sync {
    /// AZs the named endpoint service is available in; `None` if the cloud
    /// returned no details for it
    async fn endpoint_service_azs(
        &self,
        service_name: &str,
    ) -> Result<Option<Vec<String>>, AllocationError>;

    /// Every endpoint in any of the given VPCs
    async fn vpc_endpoints(
        &self,
        vpc_ids: &[String],
    ) -> Result<Vec<VpcEndpointSummary>, AllocationError>;
}

/// EC2 client backed by the AWS SDK
#[derive(Debug, Clone)]
pub struct AwsEc2Client {
    client: aws_sdk_ec2::Client,
    region: String,
}

impl AwsEc2Client {
    /// Build a client for `region` from the ambient AWS configuration
    /// (environment, profile, or instance role)
    pub async fn new(region: &str) -> Self {
        let sdk_config = aws_config::from_env()
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        info!(region = %region, "EC2 client initialized");
        Self::from_client(aws_sdk_ec2::Client::new(&sdk_config), region)
    }

    /// Wrap an existing SDK client
    pub fn from_client(client: aws_sdk_ec2::Client, region: &str) -> Self {
        Self {
            client,
            region: region.to_string(),
        }
    }
}

#[async_trait]
impl Ec2Api for AwsEc2Client {
    async fn endpoint_service_azs(
        &self,
        service_name: &str,
    ) -> Result<Option<Vec<String>>, AllocationError> {
        let output = self
            .client
            .describe_vpc_endpoint_services()
            .service_names(service_name)
            .send()
            .await
            .map_err(|e| {
                AllocationError::cloud(
                    "DescribeVpcEndpointServices",
                    format!(
                        "service {service_name} in {}: {}",
                        self.region,
                        DisplayErrorContext(&e)
                    ),
                )
            })?;

        Ok(output
            .service_details()
            .first()
            .map(|detail| detail.availability_zones().to_vec()))
    }

    async fn vpc_endpoints(
        &self,
        vpc_ids: &[String],
    ) -> Result<Vec<VpcEndpointSummary>, AllocationError> {
        let filter = Filter::builder()
            .name("vpc-id")
            .set_values(Some(vpc_ids.to_vec()))
            .build();

        let mut endpoints = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .client
                .describe_vpc_endpoints()
                .filters(filter.clone())
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| {
                    AllocationError::cloud(
                        "DescribeVpcEndpoints",
                        format!("vpcs {vpc_ids:?} in {}: {}", self.region, DisplayErrorContext(&e)),
                    )
                })?;

            endpoints.extend(output.vpc_endpoints().iter().filter_map(|endpoint| {
                Some(VpcEndpointSummary {
                    endpoint_id: endpoint.vpc_endpoint_id()?.to_string(),
                    vpc_id: endpoint.vpc_id()?.to_string(),
                })
            }));

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(vpcs = vpc_ids.len(), endpoints = endpoints.len(), "listed VPC endpoints");
        Ok(endpoints)
    }
}
