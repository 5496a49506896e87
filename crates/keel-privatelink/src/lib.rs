//! Private-link VPC allocation
//!
//! Picks the VPC a private-link endpoint is created in from an operator
//! supplied inventory, using live EC2 data for service AZs and endpoint quota.

#![deny(missing_docs)]

pub mod allocator;
pub mod ec2;
pub mod error;
pub mod inventory;

pub use allocator::{ClusterPlatform, VpcAllocator, VPC_ENDPOINTS_PER_VPC_LIMIT};
pub use ec2::{AwsEc2Client, Ec2Api, VpcEndpointSummary};
pub use error::{AllocationError, InventoryError};
pub use inventory::{PrivateLinkConfig, Subnet, VpcInventory};
