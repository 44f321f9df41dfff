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

use config::meta::partition::GridSystem;
use geohash::Coord;
use infra::errors::*;

use super::Grid;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// approximate cell width in meters per precision, 1..=12
const CELL_METERS: [f64; 12] = [
    5_000_000.0,
    1_250_000.0,
    156_000.0,
    39_100.0,
    4_890.0,
    1_220.0,
    153.0,
    38.2,
    4.77,
    1.19,
    0.149,
    0.037,
];

pub struct GeohashGrid;

impl GeohashGrid {
    fn check_cell(cell: &str, level: u8) -> Result<()> {
        if cell.len() != level as usize {
            return Err(Error::ErrorCode(ErrorCodes::InvalidRequest(format!(
                "geohash {cell} does not match precision {level}"
            ))));
        }
        Ok(())
    }
}

impl Grid for GeohashGrid {
    fn system(&self) -> GridSystem {
        GridSystem::Geohash
    }

    fn min_level(&self) -> u8 {
        1
    }

    fn max_level(&self) -> u8 {
        12
    }

    fn encode(&self, lat: f64, lon: f64, level: u8) -> Result<String> {
        geohash::encode(Coord { x: lon, y: lat }, level as usize)
            .map_err(|e| Error::ErrorCode(ErrorCodes::InvalidRequest(e.to_string())))
    }

    fn center(&self, cell: &str, level: u8) -> Result<(f64, f64)> {
        Self::check_cell(cell, level)?;
        let (coord, _, _) = geohash::decode(cell)
            .map_err(|e| Error::ErrorCode(ErrorCodes::InvalidRequest(e.to_string())))?;
        Ok((coord.y, coord.x))
    }

    fn ring(&self, cell: &str, level: u8) -> Result<Vec<(f64, f64)>> {
        Self::check_cell(cell, level)?;
        let rect = geohash::decode_bbox(cell)
            .map_err(|e| Error::ErrorCode(ErrorCodes::InvalidRequest(e.to_string())))?;
        let (min, max) = (rect.min(), rect.max());
        Ok(vec![
            (min.y, min.x),
            (min.y, max.x),
            (max.y, max.x),
            (max.y, min.x),
            (min.y, min.x),
        ])
    }

    fn neighbors(&self, cell: &str, level: u8) -> Result<Vec<String>> {
        Self::check_cell(cell, level)?;
        let n = geohash::neighbors(cell)
            .map_err(|e| Error::ErrorCode(ErrorCodes::InvalidRequest(e.to_string())))?;
        Ok(vec![n.n, n.ne, n.e, n.se, n.s, n.sw, n.w, n.nw])
    }

    fn parent(&self, cell: &str, level: u8) -> Result<Option<(String, u8)>> {
        Self::check_cell(cell, level)?;
        if level <= 1 {
            return Ok(None);
        }
        Ok(Some((cell[..cell.len() - 1].to_string(), level - 1)))
    }

    fn children(&self, cell: &str, level: u8, child_level: u8) -> Result<Vec<String>> {
        Self::check_cell(cell, level)?;
        let mut cells = vec![cell.to_string()];
        for _ in level..child_level {
            let mut next = Vec::with_capacity(cells.len() * 32);
            for prefix in &cells {
                for c in BASE32 {
                    next.push(format!("{prefix}{}", *c as char));
                }
            }
            cells = next;
        }
        Ok(cells)
    }

    fn level_for_distance(&self, meters: f64) -> u8 {
        for (i, size) in CELL_METERS.iter().enumerate() {
            if *size <= meters {
                return (i + 1) as u8;
            }
        }
        12
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_cell() {
        let grid = GeohashGrid;
        // lower manhattan
        let cell = grid.encode(40.7128, -74.0060, 7).unwrap();
        assert_eq!(cell.len(), 7);
        assert!(cell.starts_with("dr5"));
    }

    #[test]
    fn test_neighbors_are_eight() {
        let grid = GeohashGrid;
        let cell = grid.encode(40.7128, -74.0060, 6).unwrap();
        let neighbors = grid.neighbors(&cell, 6).unwrap();
        assert_eq!(neighbors.len(), 8);
        assert!(!neighbors.contains(&cell));
    }

    #[test]
    fn test_parent_chain() {
        let grid = GeohashGrid;
        let cell = grid.encode(40.7128, -74.0060, 3).unwrap();
        let (parent, level) = grid.parent(&cell, 3).unwrap().unwrap();
        assert_eq!(level, 2);
        assert!(cell.starts_with(&parent));
        let (top, _) = grid.parent(&parent, 2).unwrap().unwrap();
        assert!(grid.parent(&top, 1).unwrap().is_none());
    }

    #[test]
    fn test_children_count() {
        let grid = GeohashGrid;
        let children = grid.children("dr", 2, 3).unwrap();
        assert_eq!(children.len(), 32);
        assert!(children.iter().all(|c| c.starts_with("dr")));
    }

    #[test]
    fn test_level_for_distance() {
        let grid = GeohashGrid;
        assert_eq!(grid.level_for_distance(1000.0), 7);
        assert_eq!(grid.level_for_distance(200_000.0), 3);
        assert_eq!(grid.level_for_distance(0.001), 12);
    }
}
