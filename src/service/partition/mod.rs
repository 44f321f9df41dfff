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

//! Partitioning strategies. A record maps to exactly one primary partition
//! per active strategy; time and grid strategies run concurrently over the
//! same records.

pub mod grid;
pub mod retention;
pub mod rollup;
pub mod temporal;
pub mod time;

use std::sync::Arc;

use config::{
    RwHashMap, get_config,
    meta::{partition::PartitionKey, record::Record},
};
use geo_types::{Coord, LineString, Polygon};
use infra::errors::*;
use once_cell::sync::Lazy;

/// what a partition key decodes back to
#[derive(Clone, Debug, PartialEq)]
pub enum KeyBounds {
    /// [start, end) in UTC microseconds
    Time { start: i64, end: i64 },
    /// cell center and boundary ring as (lat, lon) pairs
    Cell {
        center: (f64, f64),
        ring: Vec<(f64, f64)>,
    },
}

impl KeyBounds {
    pub fn contains_point(&self, lat: f64, lon: f64) -> bool {
        match self {
            KeyBounds::Time { .. } => false,
            KeyBounds::Cell { ring, .. } => point_in_ring(lat, lon, ring),
        }
    }
}

/// ray casting over a closed ring of (lat, lon) vertices
pub(crate) fn point_in_ring(lat: f64, lon: f64, ring: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (lat_i, lon_i) = ring[i];
        let (lat_j, lon_j) = ring[j];
        if ((lon_i > lon) != (lon_j > lon))
            && (lat < (lat_j - lat_i) * (lon - lon_i) / (lon_j - lon_i) + lat_i)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

pub(crate) fn ring_to_polygon(ring: &[(f64, f64)]) -> Polygon<f64> {
    // geo uses x = lon, y = lat
    let coords: Vec<Coord<f64>> = ring
        .iter()
        .map(|(lat, lon)| Coord { x: *lon, y: *lat })
        .collect();
    Polygon::new(LineString::from(coords), vec![])
}

/// Deterministic, side-effect-free mapping between records and partition
/// keys. Implementations are registered once at startup and looked up by
/// name afterwards.
pub trait PartitionStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn encode(&self, record: &Record) -> Result<PartitionKey>;
    fn decode(&self, key: &PartitionKey) -> Result<KeyBounds>;
    fn neighbors(&self, key: &PartitionKey) -> Result<Vec<PartitionKey>>;
    fn geometry(&self, key: &PartitionKey) -> Result<Polygon<f64>>;
    fn children(&self, key: &PartitionKey, level: u8) -> Result<Vec<PartitionKey>>;
    fn parent(&self, key: &PartitionKey) -> Result<Option<PartitionKey>>;
}

static REGISTRY: Lazy<RwHashMap<String, Arc<dyn PartitionStrategy>>> =
    Lazy::new(Default::default);

/// Register the configured strategies. Called once at startup; the registry
/// is append-only afterwards.
pub fn init() -> Result<()> {
    let cfg = get_config();
    let granularity = cfg
        .partition
        .time_granularity
        .parse()
        .map_err(Error::Message)?;
    register(Arc::new(time::TimeStrategy::new(granularity)));

    for system in ["geohash", "h3", "s2", "quadkey", "rtree"] {
        let grid = grid::create(system.parse().map_err(Error::Message)?)?;
        let level = if cfg.partition.grid_level > 0 {
            cfg.partition.grid_level
        } else {
            grid.level_for_distance(cfg.partition.grid_target_distance)
        };
        register(Arc::new(grid::GridStrategy::new(grid, level)));
    }
    log::info!("[PARTITION] registered {} strategies", REGISTRY.len());
    Ok(())
}

fn register(strategy: Arc<dyn PartitionStrategy>) {
    REGISTRY.insert(strategy.name().to_string(), strategy);
}

/// the grid system queries prune against, with its effective level
pub fn configured_grid() -> Result<(Arc<dyn grid::Grid>, u8)> {
    let cfg = get_config();
    let system = cfg.partition.grid_system.parse().map_err(Error::Message)?;
    let grid = grid::create(system)?;
    let level = if cfg.partition.grid_level > 0 {
        cfg.partition.grid_level
    } else {
        grid.level_for_distance(cfg.partition.grid_target_distance)
    };
    Ok((grid, level.clamp(grid.min_level(), grid.max_level())))
}

pub fn get_strategy(name: &str) -> Result<Arc<dyn PartitionStrategy>> {
    match REGISTRY.get(name) {
        Some(strategy) => Ok(strategy.clone()),
        None => Err(Error::ErrorCode(ErrorCodes::StrategyNotFound(
            name.to_string(),
        ))),
    }
}

pub fn list_strategies() -> Vec<String> {
    REGISTRY.iter().map(|e| e.key().clone()).collect()
}

/// encode a record under every registered strategy that applies to it;
/// records without a geo point only land in time partitions
pub fn encode_all(record: &Record) -> Vec<PartitionKey> {
    let mut keys = Vec::new();
    for entry in REGISTRY.iter() {
        match entry.value().encode(record) {
            Ok(key) => keys.push(key),
            Err(Error::ErrorCode(ErrorCodes::InvalidRequest(_))) => {}
            Err(e) => {
                log::warn!("[PARTITION] encode with {} failed: {e}", entry.key());
            }
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_in_ring() {
        let ring = vec![(0.0, 0.0), (0.0, 10.0), (10.0, 10.0), (10.0, 0.0)];
        assert!(point_in_ring(5.0, 5.0, &ring));
        assert!(!point_in_ring(15.0, 5.0, &ring));
        assert!(!point_in_ring(5.0, -1.0, &ring));
    }

    #[test]
    fn test_registry_lookup_missing() {
        assert!(get_strategy("voronoi").is_err());
    }
}
