//! Allocation and inventory errors

use thiserror::Error;

/// Why no VPC could be chosen for an endpoint
///
/// The three admission variants map one-to-one onto the filter stages so
/// callers can tell an operator which part of the inventory to fix.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// No inventory entry is in the cluster's region
    #[error("no supported VPC in inventory for the cluster")]
    NoVpcForRegion {
        /// Region of the cluster
        region: String,
    },

    /// No in-region entry has a subnet in an AZ the service supports
    #[error("no supported VPC in inventory which support the AZs of the service")]
    NoSupportedAzs {
        /// Endpoint service name
        service: String,
        /// AZs the service supports
        azs: Vec<String>,
    },

    /// Every remaining VPC is at the endpoint ceiling
    #[error("no supported VPC in inventory with available quota")]
    NoQuota {
        /// VPCs that were considered
        vpcs: Vec<String>,
    },

    /// The cloud returned no details for the endpoint service
    #[error("VPC endpoint service {service} not found")]
    ServiceNotFound {
        /// Endpoint service name
        service: String,
    },

    /// A cloud API call failed
    #[error("{operation} failed: {message}")]
    Cloud {
        /// API operation that failed
        operation: String,
        /// Error detail from the SDK
        message: String,
    },
}

impl AllocationError {
    /// Create a cloud error for an API operation
    pub fn cloud(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Cloud {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Failure loading the inventory configuration
#[derive(Debug, Error)]
pub enum InventoryError {
    /// The file could not be read
    #[error("failed to read inventory {path}: {source}")]
    Io {
        /// Path of the file
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not a valid inventory
    #[error("invalid inventory: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// An entry is missing required data
    #[error("invalid inventory entry {vpc_id}: {message}")]
    Invalid {
        /// VPC of the bad entry (may be empty)
        vpc_id: String,
        /// What is wrong
        message: String,
    },
}
