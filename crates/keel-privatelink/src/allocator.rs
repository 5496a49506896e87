//! VPC selection for private-link endpoints
//!
//! Candidates pass three admission filters in order: region, service AZs,
//! endpoint quota. Each stage that empties the candidate set fails with its
//! own error; there is no fallback to a partially matching VPC. The first
//! survivor in inventory order wins.
//!
//! Every stage builds fresh candidates, so the shared inventory is never
//! modified and concurrent allocations see the same configuration. Two
//! allocations may still pick the same VPC for its last free slot; the cloud
//! rejects the losing endpoint creation.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, error, info, instrument};

use crate::ec2::{Ec2Api, VpcEndpointSummary};
use crate::error::AllocationError;
use crate::inventory::VpcInventory;

/// Endpoints allowed per VPC before it stops being a candidate.
/// The cloud's hard limit is 255; the gap leaves room for manual endpoints.
pub const VPC_ENDPOINTS_PER_VPC_LIMIT: usize = 250;

/// What the allocator needs to know about the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterPlatform {
    /// Cloud region of the cluster
    pub region: String,
}

impl ClusterPlatform {
    /// Platform in the given region
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
        }
    }
}

/// Chooses the VPC an endpoint is created in
#[derive(Clone, Debug)]
pub struct VpcAllocator {
    inventory: Arc<Vec<VpcInventory>>,
}

impl VpcAllocator {
    /// Allocator over a shared inventory
    pub fn new(inventory: Arc<Vec<VpcInventory>>) -> Self {
        Self { inventory }
    }

    /// The inventory this allocator chooses from
    pub fn inventory(&self) -> &[VpcInventory] {
        &self.inventory
    }

    /// Choose a VPC for an endpoint to `service_name`.
    ///
    /// The returned entry keeps only the subnets in AZs the service supports.
    #[instrument(skip_all, fields(region = %platform.region, service = %service_name))]
    pub async fn choose_vpc(
        &self,
        ec2: &dyn Ec2Api,
        platform: &ClusterPlatform,
        service_name: &str,
    ) -> Result<VpcInventory, AllocationError> {
        let candidates = filter_by_region(&self.inventory, &platform.region);
        if candidates.is_empty() {
            error!("no supported VPC in inventory");
            return Err(AllocationError::NoVpcForRegion {
                region: platform.region.clone(),
            });
        }

        let azs = ec2
            .endpoint_service_azs(service_name)
            .await?
            .ok_or_else(|| AllocationError::ServiceNotFound {
                service: service_name.to_string(),
            })?;
        let supported: BTreeSet<String> = azs.into_iter().collect();

        let candidates = filter_by_azs(candidates, &supported);
        if candidates.is_empty() {
            let azs: Vec<String> = supported.into_iter().collect();
            error!(required_azs = ?azs, "no supported VPC in inventory which support the AZs of the service");
            return Err(AllocationError::NoSupportedAzs {
                service: service_name.to_string(),
                azs,
            });
        }

        let vpc_ids: Vec<String> = candidates.iter().map(|c| c.vpc_id.clone()).collect();
        let endpoints = ec2.vpc_endpoints(&vpc_ids).await?;
        let counts = count_endpoints(&endpoints);
        debug!(?counts, "existing endpoints per candidate VPC");

        let chosen = filter_by_quota(candidates, &counts).into_iter().next();
        match chosen {
            Some(vpc) => {
                info!(vpc = %vpc.vpc_id, subnets = vpc.subnets.len(), "chose VPC for endpoint");
                Ok(vpc)
            }
            None => {
                error!(vpcs = ?vpc_ids, "no supported VPC in inventory with available quota");
                Err(AllocationError::NoQuota { vpcs: vpc_ids })
            }
        }
    }
}

/// Entries in `region`, compared case-insensitively
pub fn filter_by_region(inventory: &[VpcInventory], region: &str) -> Vec<VpcInventory> {
    inventory
        .iter()
        .filter(|entry| entry.region.eq_ignore_ascii_case(region))
        .cloned()
        .collect()
}

/// Candidates rebuilt with only the subnets in `azs`; those left with no
/// subnet are dropped
pub fn filter_by_azs(candidates: Vec<VpcInventory>, azs: &BTreeSet<String>) -> Vec<VpcInventory> {
    candidates
        .into_iter()
        .filter_map(|mut entry| {
            entry
                .subnets
                .retain(|s| azs.contains(&s.availability_zone));
            (!entry.subnets.is_empty()).then_some(entry)
        })
        .collect()
}

/// Candidates below [`VPC_ENDPOINTS_PER_VPC_LIMIT`]
pub fn filter_by_quota(
    candidates: Vec<VpcInventory>,
    endpoints_per_vpc: &HashMap<String, usize>,
) -> Vec<VpcInventory> {
    candidates
        .into_iter()
        .filter(|entry| {
            endpoints_per_vpc.get(&entry.vpc_id).copied().unwrap_or(0) < VPC_ENDPOINTS_PER_VPC_LIMIT
        })
        .collect()
}

fn count_endpoints(endpoints: &[VpcEndpointSummary]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for endpoint in endpoints {
        *counts.entry(endpoint.vpc_id.clone()).or_insert(0) += 1;
    }
    counts
}
