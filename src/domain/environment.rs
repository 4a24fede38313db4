use serde::{Deserialize, Serialize};

/// A deployment target: one secret store and one scheduler in one datacenter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub region: String,
    pub datacenter: String,
    pub secret_store_addr: String,
    pub cluster_addr: String,
}

impl Environment {
    /// Names of the fields that differ from `other`.
    ///
    /// A bootstrapped environment is immutable, so any difference between the
    /// recorded and the configured definition needs an explicit migration.
    pub fn drift_from(&self, other: &Environment) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.region != other.region {
            fields.push("region");
        }
        if self.datacenter != other.datacenter {
            fields.push("datacenter");
        }
        if self.secret_store_addr != other.secret_store_addr {
            fields.push("secret_store_addr");
        }
        if self.cluster_addr != other.cluster_addr {
            fields.push("cluster_addr");
        }
        fields
    }
}
