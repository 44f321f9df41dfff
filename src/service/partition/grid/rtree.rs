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

//! Dynamic cells in an R-tree. Cells are fixed-size boxes snapped to a
//! degree grid, created the first time a point lands in them; ids are
//! sequential ints in creation order. Neighbor lookup is a range query over
//! the tree.

use config::{get_config, meta::partition::GridSystem};
use hashbrown::HashMap;
use infra::errors::*;
use parking_lot::RwLock;
use rstar::{AABB, RTree, RTreeObject};

use super::Grid;

#[derive(Clone, Debug, PartialEq)]
struct CellBox {
    id: u64,
    min: [f64; 2],
    max: [f64; 2],
}

impl RTreeObject for CellBox {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.min, self.max)
    }
}

#[derive(Default)]
struct RtreeState {
    tree: RTree<CellBox>,
    /// snapped grid coordinates to cell id
    by_coords: HashMap<(i64, i64), u64>,
    by_id: HashMap<u64, CellBox>,
    next_id: u64,
}

pub struct RtreeGrid {
    cell_degrees: f64,
    state: RwLock<RtreeState>,
}

impl RtreeGrid {
    pub fn new() -> Self {
        RtreeGrid {
            cell_degrees: get_config().partition.rtree_cell_degrees,
            state: RwLock::new(RtreeState::default()),
        }
    }

    fn snap(&self, lat: f64, lon: f64) -> (i64, i64) {
        (
            (lat / self.cell_degrees).floor() as i64,
            (lon / self.cell_degrees).floor() as i64,
        )
    }

    fn get_or_create(&self, lat: f64, lon: f64) -> u64 {
        let coords = self.snap(lat, lon);
        if let Some(id) = self.state.read().by_coords.get(&coords) {
            return *id;
        }
        let mut state = self.state.write();
        if let Some(id) = state.by_coords.get(&coords) {
            return *id;
        }
        state.next_id += 1;
        let id = state.next_id;
        let min = [
            coords.0 as f64 * self.cell_degrees,
            coords.1 as f64 * self.cell_degrees,
        ];
        let cell = CellBox {
            id,
            min,
            max: [min[0] + self.cell_degrees, min[1] + self.cell_degrees],
        };
        state.by_coords.insert(coords, id);
        state.by_id.insert(id, cell.clone());
        state.tree.insert(cell);
        id
    }

    fn lookup(&self, cell: &str) -> Result<CellBox> {
        let id: u64 = cell.parse().map_err(|_| {
            Error::ErrorCode(ErrorCodes::InvalidRequest(format!(
                "invalid rtree cell id: {cell}"
            )))
        })?;
        self.state
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::ErrorCode(ErrorCodes::PartitionNotFound(cell.to_string())))
    }
}

impl Default for RtreeGrid {
    fn default() -> Self {
        Self::new()
    }
}

impl Grid for RtreeGrid {
    fn system(&self) -> GridSystem {
        GridSystem::Rtree
    }

    fn min_level(&self) -> u8 {
        1
    }

    fn max_level(&self) -> u8 {
        1
    }

    fn encode(&self, lat: f64, lon: f64, _level: u8) -> Result<String> {
        Ok(self.get_or_create(lat, lon).to_string())
    }

    fn center(&self, cell: &str, _level: u8) -> Result<(f64, f64)> {
        let b = self.lookup(cell)?;
        Ok(((b.min[0] + b.max[0]) / 2.0, (b.min[1] + b.max[1]) / 2.0))
    }

    fn ring(&self, cell: &str, _level: u8) -> Result<Vec<(f64, f64)>> {
        let b = self.lookup(cell)?;
        Ok(vec![
            (b.min[0], b.min[1]),
            (b.min[0], b.max[1]),
            (b.max[0], b.max[1]),
            (b.max[0], b.min[1]),
            (b.min[0], b.min[1]),
        ])
    }

    fn neighbors(&self, cell: &str, _level: u8) -> Result<Vec<String>> {
        let b = self.lookup(cell)?;
        let pad = self.cell_degrees / 2.0;
        let query = AABB::from_corners(
            [b.min[0] - pad, b.min[1] - pad],
            [b.max[0] + pad, b.max[1] + pad],
        );
        let state = self.state.read();
        let mut out: Vec<String> = state
            .tree
            .locate_in_envelope_intersecting(&query)
            .filter(|c| c.id != b.id)
            .map(|c| c.id.to_string())
            .collect();
        out.sort();
        Ok(out)
    }

    fn parent(&self, _cell: &str, _level: u8) -> Result<Option<(String, u8)>> {
        Ok(None)
    }

    fn children(&self, _cell: &str, _level: u8, _child_level: u8) -> Result<Vec<String>> {
        Err(Error::ErrorCode(ErrorCodes::InvalidRequest(
            "rtree cells have no hierarchy".to_string(),
        )))
    }

    fn level_for_distance(&self, _meters: f64) -> u8 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids() {
        let grid = RtreeGrid::new();
        let a = grid.encode(40.7128, -74.0060, 1).unwrap();
        let b = grid.encode(40.7128, -74.0060, 1).unwrap();
        assert_eq!(a, b);
        let c = grid.encode(51.5074, -0.1278, 1).unwrap();
        assert_ne!(a, c);
        assert_eq!(a, "1");
        assert_eq!(c, "2");
    }

    #[test]
    fn test_neighbors_range_query() {
        let grid = RtreeGrid::new();
        let size = grid.cell_degrees;
        let center = grid.encode(10.0 * size + size / 2.0, 10.0 * size + size / 2.0, 1).unwrap();
        // populate the 8 surrounding cells
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                grid.encode(
                    (10 + dx) as f64 * size + size / 2.0,
                    (10 + dy) as f64 * size + size / 2.0,
                    1,
                )
                .unwrap();
            }
        }
        let neighbors = grid.neighbors(&center, 1).unwrap();
        assert_eq!(neighbors.len(), 8);
    }

    #[test]
    fn test_unknown_cell() {
        let grid = RtreeGrid::new();
        assert!(grid.center("99", 1).is_err());
    }
}
