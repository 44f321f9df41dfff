// Copyright 2025 Datapunk Contributors.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::{collections::HashMap, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::utils::time::micros_to_rfc3339;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeGranularity {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl FromStr for TimeGranularity {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "minute" => Ok(TimeGranularity::Minute),
            "hour" => Ok(TimeGranularity::Hour),
            "day" => Ok(TimeGranularity::Day),
            "week" => Ok(TimeGranularity::Week),
            "month" => Ok(TimeGranularity::Month),
            "quarter" => Ok(TimeGranularity::Quarter),
            "year" => Ok(TimeGranularity::Year),
            _ => Err(format!("Invalid time granularity: {s}")),
        }
    }
}

impl std::fmt::Display for TimeGranularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeGranularity::Minute => write!(f, "minute"),
            TimeGranularity::Hour => write!(f, "hour"),
            TimeGranularity::Day => write!(f, "day"),
            TimeGranularity::Week => write!(f, "week"),
            TimeGranularity::Month => write!(f, "month"),
            TimeGranularity::Quarter => write!(f, "quarter"),
            TimeGranularity::Year => write!(f, "year"),
        }
    }
}

impl TimeGranularity {
    /// the next coarser granularity, used by rollups
    pub fn coarser(&self) -> Option<TimeGranularity> {
        match self {
            TimeGranularity::Minute => Some(TimeGranularity::Hour),
            TimeGranularity::Hour => Some(TimeGranularity::Day),
            TimeGranularity::Day => Some(TimeGranularity::Week),
            TimeGranularity::Week => Some(TimeGranularity::Month),
            TimeGranularity::Month => Some(TimeGranularity::Quarter),
            TimeGranularity::Quarter => Some(TimeGranularity::Year),
            TimeGranularity::Year => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridSystem {
    Geohash,
    H3,
    S2,
    Quadkey,
    Rtree,
}

impl FromStr for GridSystem {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "geohash" => Ok(GridSystem::Geohash),
            "h3" => Ok(GridSystem::H3),
            "s2" => Ok(GridSystem::S2),
            "quadkey" => Ok(GridSystem::Quadkey),
            "rtree" => Ok(GridSystem::Rtree),
            _ => Err(format!("Invalid grid system: {s}")),
        }
    }
}

impl std::fmt::Display for GridSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GridSystem::Geohash => write!(f, "geohash"),
            GridSystem::H3 => write!(f, "h3"),
            GridSystem::S2 => write!(f, "s2"),
            GridSystem::Quadkey => write!(f, "quadkey"),
            GridSystem::Rtree => write!(f, "rtree"),
        }
    }
}

/// A partition key, the string identifier produced by a partitioning
/// strategy. Keys are stable, order-preserving for time and embeddable
/// in file paths.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PartitionKey {
    Time {
        granularity: TimeGranularity,
        /// inclusive lower boundary in UTC microseconds
        start: i64,
    },
    Grid {
        system: GridSystem,
        cell: String,
        level: u8,
    },
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionKey::Time { granularity, start } => {
                write!(f, "time/{}/{}", granularity, micros_to_rfc3339(*start))
            }
            PartitionKey::Grid { system, cell, level } => {
                write!(f, "grid/{}/{}/{}", system, level, cell)
            }
        }
    }
}

impl FromStr for PartitionKey {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(4, '/').collect();
        match parts.as_slice() {
            ["time", granularity, start] => Ok(PartitionKey::Time {
                granularity: granularity
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))?,
                start: crate::utils::time::parse_str_to_time(start)?.timestamp_micros(),
            }),
            ["grid", system, level, cell] => Ok(PartitionKey::Grid {
                system: system.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                level: level.parse()?,
                cell: cell.to_string(),
            }),
            _ => Err(anyhow::anyhow!("Invalid partition key: {s}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionState {
    #[default]
    Active,
    Archived,
    Quarantined,
}

/// Partition metadata, the record ids plus statistics the optimizer reads.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Partition {
    pub key: String,
    pub record_ids: Vec<String>,
    pub size_bytes: u64,
    pub record_count: u64,
    pub min_ts: i64,
    pub max_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Vec<(f64, f64)>>,
    #[serde(default)]
    pub stats: HashMap<String, ColumnStats>,
    #[serde(default)]
    pub state: PartitionState,
    /// monotonic, bumped on every write, replicas never regress
    pub version: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub row_count: u64,
    pub distinct_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<crate::utils::json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<crate::utils::json::Value>,
    /// equi-width histogram bucket counts
    #[serde(default)]
    pub histogram: Vec<u64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InSync,
    Lagging,
    Failed,
}

/// Replication bookkeeping for one partition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationState {
    pub partition: String,
    pub primary: String,
    pub replicas: Vec<String>,
    pub sync_status: HashMap<String, SyncStatus>,
    pub version: u64,
    pub checksum: String,
}

impl ReplicationState {
    pub fn in_sync_replicas(&self) -> Vec<&String> {
        self.replicas
            .iter()
            .filter(|n| self.sync_status.get(*n) == Some(&SyncStatus::InSync))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_key_display_parse() {
        let key = PartitionKey::Time {
            granularity: TimeGranularity::Day,
            start: 1704067200000000,
        };
        let s = key.to_string();
        assert_eq!(s, "time/day/2024-01-01T00:00:00+00:00");
        assert_eq!(s.parse::<PartitionKey>().unwrap(), key);

        let key = PartitionKey::Grid {
            system: GridSystem::Geohash,
            cell: "dr5regw".to_string(),
            level: 7,
        };
        let s = key.to_string();
        assert_eq!(s, "grid/geohash/7/dr5regw");
        assert_eq!(s.parse::<PartitionKey>().unwrap(), key);
    }

    #[test]
    fn test_granularity_coarser_chain() {
        let mut g = TimeGranularity::Minute;
        let mut hops = 0;
        while let Some(next) = g.coarser() {
            g = next;
            hops += 1;
        }
        assert_eq!(g, TimeGranularity::Year);
        assert_eq!(hops, 6);
    }

    #[test]
    fn test_in_sync_replicas() {
        let state = ReplicationState {
            partition: "p1".to_string(),
            primary: "n1".to_string(),
            replicas: vec!["n2".to_string(), "n3".to_string()],
            sync_status: HashMap::from([
                ("n2".to_string(), SyncStatus::InSync),
                ("n3".to_string(), SyncStatus::Lagging),
            ]),
            version: 4,
            checksum: "".to_string(),
        };
        assert_eq!(state.in_sync_replicas(), vec!["n2"]);
    }
}
