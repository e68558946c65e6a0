//! Region and shard layout of the deployment.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::str::FromStr;

use super::error::ServiceError;
use crate::models::{Account, ShardId};

#[async_trait]
pub trait TopologyProvider: Send + Sync {
    async fn list_regions(&self) -> Result<Vec<String>, ServiceError>;

    async fn list_shards(&self, region: &str) -> Result<Vec<ShardId>, ServiceError>;

    /// Shard holding the account's records.
    fn shard_for_account(&self, account: &Account) -> ShardId {
        account.shard_id
    }
}

/// Fixed topology parsed from configuration, e.g. `us-east=1,2;eu-west=3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticTopology {
    regions: BTreeMap<String, Vec<ShardId>>,
}

impl StaticTopology {
    pub fn new<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<ShardId>)>,
        S: Into<String>,
    {
        Self {
            regions: regions
                .into_iter()
                .map(|(region, shards)| (region.into(), shards))
                .collect(),
        }
    }

    /// One region holding one shard.
    pub fn single(shard_id: ShardId) -> Self {
        Self::new([("default", vec![shard_id])])
    }
}

impl FromStr for StaticTopology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut regions = BTreeMap::new();
        for entry in s.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (region, shards) = entry
                .split_once('=')
                .ok_or_else(|| format!("Invalid topology entry '{}': expected region=shards", entry))?;
            let shards = shards
                .split(',')
                .map(str::trim)
                .filter(|shard| !shard.is_empty())
                .map(|shard| {
                    shard
                        .parse::<ShardId>()
                        .map_err(|e| format!("Invalid shard id '{}' in region '{}': {}", shard, region, e))
                })
                .collect::<Result<Vec<_>, _>>()?;
            if shards.is_empty() {
                return Err(format!("Region '{}' has no shards", region.trim()));
            }
            regions.insert(region.trim().to_string(), shards);
        }

        if regions.is_empty() {
            return Err("Topology must declare at least one region".to_string());
        }
        Ok(Self { regions })
    }
}

#[async_trait]
impl TopologyProvider for StaticTopology {
    async fn list_regions(&self) -> Result<Vec<String>, ServiceError> {
        Ok(self.regions.keys().cloned().collect())
    }

    async fn list_shards(&self, region: &str) -> Result<Vec<ShardId>, ServiceError> {
        self.regions
            .get(region)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("Region {}", region)))
    }
}
