//! VPC inventory configuration
//!
//! The inventory lists the VPCs that may host private-link endpoints. It is
//! operator-supplied YAML:
//!
//! ```yaml
//! endpointVPCInventory:
//!   - vpcID: vpc-0a1b
//!     region: us-east-1
//!     subnets:
//!       - subnetID: subnet-01
//!         availabilityZone: us-east-1a
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::InventoryError;

/// A subnet an endpoint can be placed in
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    /// Subnet ID
    #[serde(rename = "subnetID")]
    pub subnet_id: String,
    /// Availability zone of the subnet
    #[serde(rename = "availabilityZone")]
    pub availability_zone: String,
}

/// A candidate VPC for private-link endpoints
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcInventory {
    /// VPC ID
    #[serde(rename = "vpcID")]
    pub vpc_id: String,
    /// Region the VPC lives in
    pub region: String,
    /// Subnets in inventory order
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

/// Private-link section of the operator configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateLinkConfig {
    /// VPCs available for endpoints, in preference order
    #[serde(rename = "endpointVPCInventory", default)]
    pub endpoint_vpc_inventory: Vec<VpcInventory>,
}

impl PrivateLinkConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self, InventoryError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InventoryError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| InventoryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    fn validate(&self) -> Result<(), InventoryError> {
        for entry in &self.endpoint_vpc_inventory {
            if entry.vpc_id.is_empty() {
                return Err(InventoryError::Invalid {
                    vpc_id: String::new(),
                    message: "vpcID is required".to_string(),
                });
            }
            if entry.region.is_empty() {
                return Err(InventoryError::Invalid {
                    vpc_id: entry.vpc_id.clone(),
                    message: "region is required".to_string(),
                });
            }
        }
        Ok(())
    }
}
