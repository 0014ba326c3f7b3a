// src/core/meta/bmd.rs

//! The bucket map: versioned registry of buckets and their properties.

use super::{Rev, RevKind};
use crate::core::OpalError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-bucket properties. The data path consumes most of these; the control
/// plane only guarantees their consistent replication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketProps {
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub versioning: bool,
    #[serde(default)]
    pub mirror_copies: u8,
    /// Monotonic per-bucket generation, bumped on property changes.
    #[serde(default)]
    pub bid: u64,
}

/// The versioned bucket registry. `uuid` equals the cluster map UUID once the
/// cluster is initialized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bmd {
    #[serde(default)]
    pub uuid: String,
    pub version: u64,
    pub buckets: BTreeMap<String, BucketProps>,
}

impl Rev for Bmd {
    const KIND: RevKind = RevKind::Bmd;

    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Bmd {
    /// The initial bucket map minted by the primary right after the cluster
    /// UUID is established.
    pub fn initial(cluster_uuid: &str) -> Self {
        Bmd {
            uuid: cluster_uuid.to_string(),
            version: 1,
            buckets: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.version == 0
    }

    pub fn get(&self, name: &str) -> Option<&BucketProps> {
        self.buckets.get(name)
    }

    /// Registers a bucket and bumps the version.
    pub fn add_bucket(&mut self, name: &str, mut props: BucketProps) -> Result<(), OpalError> {
        if self.buckets.contains_key(name) {
            return Err(OpalError::InvalidRequest(format!(
                "bucket {name} already exists"
            )));
        }
        self.version += 1;
        props.bid = self.version;
        self.buckets.insert(name.to_string(), props);
        Ok(())
    }

    /// Removes a bucket and bumps the version.
    pub fn del_bucket(&mut self, name: &str) -> Result<BucketProps, OpalError> {
        match self.buckets.remove(name) {
            Some(props) => {
                self.version += 1;
                Ok(props)
            }
            None => Err(OpalError::NotFound(format!("bucket {name}"))),
        }
    }
}
