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

//! Spatial grids with one interface: geohash, H3, S2, quadkey and an R-tree
//! of dynamic cells. Levels are picked from a per-system distance table when
//! not pinned by config.

mod geohash;
mod h3;
mod quadkey;
mod rtree;
mod s2;

use std::sync::Arc;

use config::meta::{
    partition::{GridSystem, PartitionKey},
    record::Record,
};
use geo_types::Polygon;
use infra::errors::*;

use super::{KeyBounds, PartitionStrategy, ring_to_polygon};

/// One spatial indexing scheme. Cells are strings at a given level; the
/// boundary ring is a closed list of (lat, lon) vertices.
pub trait Grid: Send + Sync {
    fn system(&self) -> GridSystem;
    fn min_level(&self) -> u8;
    fn max_level(&self) -> u8;
    fn encode(&self, lat: f64, lon: f64, level: u8) -> Result<String>;
    /// cell center as (lat, lon)
    fn center(&self, cell: &str, level: u8) -> Result<(f64, f64)>;
    fn ring(&self, cell: &str, level: u8) -> Result<Vec<(f64, f64)>>;
    fn neighbors(&self, cell: &str, level: u8) -> Result<Vec<String>>;
    fn parent(&self, cell: &str, level: u8) -> Result<Option<(String, u8)>>;
    fn children(&self, cell: &str, level: u8, child_level: u8) -> Result<Vec<String>>;
    /// coarsest level whose cells are at most `meters` across
    fn level_for_distance(&self, meters: f64) -> u8;
}

pub fn create(system: GridSystem) -> Result<Arc<dyn Grid>> {
    Ok(match system {
        GridSystem::Geohash => Arc::new(geohash::GeohashGrid),
        GridSystem::H3 => Arc::new(h3::H3Grid),
        GridSystem::S2 => Arc::new(s2::S2Grid),
        GridSystem::Quadkey => Arc::new(quadkey::QuadkeyGrid),
        GridSystem::Rtree => Arc::new(rtree::RtreeGrid::new()),
    })
}

/// [`PartitionStrategy`] over a [`Grid`] at a fixed level.
pub struct GridStrategy {
    grid: Arc<dyn Grid>,
    level: u8,
    name: String,
}

impl GridStrategy {
    pub fn new(grid: Arc<dyn Grid>, level: u8) -> Self {
        let level = level.clamp(grid.min_level(), grid.max_level());
        let name = grid.system().to_string();
        GridStrategy { grid, level, name }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    fn expect_grid_key<'a>(&self, key: &'a PartitionKey) -> Result<(&'a str, u8)> {
        match key {
            PartitionKey::Grid {
                system,
                cell,
                level,
            } if *system == self.grid.system() => Ok((cell, *level)),
            _ => Err(Error::ErrorCode(ErrorCodes::InvalidRequest(format!(
                "expected a {} grid key",
                self.name
            )))),
        }
    }

    fn make_key(&self, cell: String, level: u8) -> PartitionKey {
        PartitionKey::Grid {
            system: self.grid.system(),
            cell,
            level,
        }
    }
}

impl PartitionStrategy for GridStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, record: &Record) -> Result<PartitionKey> {
        let geo = record.geo.ok_or_else(|| {
            Error::ErrorCode(ErrorCodes::InvalidRequest(
                "record has no geo point".to_string(),
            ))
        })?;
        if !geo.is_valid() {
            return Err(Error::ErrorCode(ErrorCodes::InvalidRequest(format!(
                "invalid geo point ({}, {})",
                geo.lat, geo.lon
            ))));
        }
        let cell = self.grid.encode(geo.lat, geo.lon, self.level)?;
        Ok(self.make_key(cell, self.level))
    }

    fn decode(&self, key: &PartitionKey) -> Result<KeyBounds> {
        let (cell, level) = self.expect_grid_key(key)?;
        Ok(KeyBounds::Cell {
            center: self.grid.center(cell, level)?,
            ring: self.grid.ring(cell, level)?,
        })
    }

    fn neighbors(&self, key: &PartitionKey) -> Result<Vec<PartitionKey>> {
        let (cell, level) = self.expect_grid_key(key)?;
        Ok(self
            .grid
            .neighbors(cell, level)?
            .into_iter()
            .map(|c| self.make_key(c, level))
            .collect())
    }

    fn geometry(&self, key: &PartitionKey) -> Result<Polygon<f64>> {
        let (cell, level) = self.expect_grid_key(key)?;
        let ring = self.grid.ring(cell, level)?;
        Ok(ring_to_polygon(&ring))
    }

    fn children(&self, key: &PartitionKey, level: u8) -> Result<Vec<PartitionKey>> {
        let (cell, key_level) = self.expect_grid_key(key)?;
        let child_level = if level > 0 { level } else { key_level + 1 };
        if child_level <= key_level || child_level > self.grid.max_level() {
            return Err(Error::ErrorCode(ErrorCodes::InvalidRequest(format!(
                "invalid child level {child_level}"
            ))));
        }
        Ok(self
            .grid
            .children(cell, key_level, child_level)?
            .into_iter()
            .map(|c| self.make_key(c, child_level))
            .collect())
    }

    fn parent(&self, key: &PartitionKey) -> Result<Option<PartitionKey>> {
        let (cell, level) = self.expect_grid_key(key)?;
        Ok(self
            .grid
            .parent(cell, level)?
            .map(|(c, l)| self.make_key(c, l)))
    }
}

/// the cells covering a radius query: target cell plus its immediate ring
pub fn cover_point(
    grid: &dyn Grid,
    lat: f64,
    lon: f64,
    level: u8,
) -> Result<Vec<String>> {
    let center = grid.encode(lat, lon, level)?;
    let mut cells = vec![center.clone()];
    cells.extend(grid.neighbors(&center, level)?);
    cells.dedup();
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use config::meta::record::{GeoPoint, PayloadType};

    use super::*;

    fn geo_record(lat: f64, lon: f64) -> Record {
        Record {
            id: "r1".to_string(),
            tenant: "default".to_string(),
            timestamp: 1704067200000000,
            geo: Some(GeoPoint::new(lat, lon)),
            payload: vec![],
            payload_type: PayloadType::Json,
            tags: HashMap::new(),
        }
    }

    #[test]
    fn test_all_grids_roundtrip_contains_point() {
        let (lat, lon) = (40.7128, -74.0060);
        for system in [
            GridSystem::Geohash,
            GridSystem::H3,
            GridSystem::S2,
            GridSystem::Quadkey,
            GridSystem::Rtree,
        ] {
            let grid = create(system).unwrap();
            let level = grid.level_for_distance(1000.0);
            let strategy = GridStrategy::new(grid, level);
            let key = strategy.encode(&geo_record(lat, lon)).unwrap();
            // deterministic
            assert_eq!(key, strategy.encode(&geo_record(lat, lon)).unwrap());
            let bounds = strategy.decode(&key).unwrap();
            assert!(
                bounds.contains_point(lat, lon),
                "{system} cell does not contain the encoded point"
            );
        }
    }

    #[test]
    fn test_all_grids_max_level_encode() {
        let (lat, lon) = (40.7128, -74.0060);
        for system in [
            GridSystem::Geohash,
            GridSystem::H3,
            GridSystem::S2,
            GridSystem::Quadkey,
        ] {
            let grid = create(system).unwrap();
            let level = grid.max_level();
            let cell = grid.encode(lat, lon, level).unwrap();
            let (clat, clon) = grid.center(&cell, level).unwrap();
            assert!((clat - lat).abs() < 0.01, "{system} center lat drifted");
            assert!((clon - lon).abs() < 0.01, "{system} center lon drifted");
        }
    }

    #[test]
    fn test_records_without_geo_are_rejected() {
        let grid = create(GridSystem::H3).unwrap();
        let strategy = GridStrategy::new(grid, 10);
        let mut record = geo_record(0.0, 0.0);
        record.geo = None;
        assert!(strategy.encode(&record).is_err());
    }

    #[test]
    fn test_cover_point_includes_neighbors() {
        let grid = create(GridSystem::H3).unwrap();
        let cells = cover_point(grid.as_ref(), 40.7128, -74.0060, 10).unwrap();
        // center plus k-ring(1)
        assert_eq!(cells.len(), 7);
    }
}
