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

use std::str::FromStr;

use config::meta::partition::GridSystem;
use h3o::{CellIndex, LatLng, Resolution};
use infra::errors::*;

use super::Grid;

/// approximate hexagon diameter in meters per resolution, 0..=15
const CELL_METERS: [f64; 16] = [
    1_100_000.0,
    420_000.0,
    158_000.0,
    60_000.0,
    23_000.0,
    8_500.0,
    3_200.0,
    1_200.0,
    460.0,
    170.0,
    65.0,
    25.0,
    9.0,
    3.5,
    1.3,
    0.5,
];

pub struct H3Grid;

fn resolution(level: u8) -> Result<Resolution> {
    Resolution::try_from(level)
        .map_err(|e| Error::ErrorCode(ErrorCodes::InvalidRequest(e.to_string())))
}

fn parse_cell(cell: &str) -> Result<CellIndex> {
    CellIndex::from_str(cell)
        .map_err(|e| Error::ErrorCode(ErrorCodes::InvalidRequest(e.to_string())))
}

impl Grid for H3Grid {
    fn system(&self) -> GridSystem {
        GridSystem::H3
    }

    fn min_level(&self) -> u8 {
        0
    }

    fn max_level(&self) -> u8 {
        15
    }

    fn encode(&self, lat: f64, lon: f64, level: u8) -> Result<String> {
        let coord = LatLng::new(lat, lon)
            .map_err(|e| Error::ErrorCode(ErrorCodes::InvalidRequest(e.to_string())))?;
        Ok(coord.to_cell(resolution(level)?).to_string())
    }

    fn center(&self, cell: &str, _level: u8) -> Result<(f64, f64)> {
        let center = LatLng::from(parse_cell(cell)?);
        Ok((center.lat(), center.lng()))
    }

    fn ring(&self, cell: &str, _level: u8) -> Result<Vec<(f64, f64)>> {
        let boundary = parse_cell(cell)?.boundary();
        let mut ring: Vec<(f64, f64)> = boundary.iter().map(|v| (v.lat(), v.lng())).collect();
        if let Some(first) = ring.first().copied() {
            ring.push(first);
        }
        Ok(ring)
    }

    fn neighbors(&self, cell: &str, _level: u8) -> Result<Vec<String>> {
        let origin = parse_cell(cell)?;
        let disk: Vec<CellIndex> = origin.grid_disk(1);
        Ok(disk
            .into_iter()
            .filter(|c| *c != origin)
            .map(|c| c.to_string())
            .collect())
    }

    fn parent(&self, cell: &str, level: u8) -> Result<Option<(String, u8)>> {
        if level == 0 {
            return Ok(None);
        }
        let parent = parse_cell(cell)?.parent(resolution(level - 1)?);
        Ok(parent.map(|p| (p.to_string(), level - 1)))
    }

    fn children(&self, cell: &str, _level: u8, child_level: u8) -> Result<Vec<String>> {
        let children = parse_cell(cell)?.children(resolution(child_level)?);
        Ok(children.map(|c| c.to_string()).collect())
    }

    fn level_for_distance(&self, meters: f64) -> u8 {
        for (i, size) in CELL_METERS.iter().enumerate() {
            if *size <= meters {
                return i as u8;
            }
        }
        15
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let grid = H3Grid;
        let cell = grid.encode(40.7128, -74.0060, 10).unwrap();
        let (lat, lon) = grid.center(&cell, 10).unwrap();
        assert!((lat - 40.7128).abs() < 0.01);
        assert!((lon + 74.0060).abs() < 0.01);
    }

    #[test]
    fn test_k_ring_neighbors() {
        let grid = H3Grid;
        let cell = grid.encode(40.7128, -74.0060, 10).unwrap();
        let neighbors = grid.neighbors(&cell, 10).unwrap();
        assert_eq!(neighbors.len(), 6);
        assert!(!neighbors.contains(&cell));
    }

    #[test]
    fn test_hierarchy() {
        let grid = H3Grid;
        let cell = grid.encode(40.7128, -74.0060, 10).unwrap();
        let (parent, parent_level) = grid.parent(&cell, 10).unwrap().unwrap();
        assert_eq!(parent_level, 9);
        let children = grid.children(&parent, 9, 10).unwrap();
        assert_eq!(children.len(), 7);
        assert!(children.contains(&cell));
    }

    #[test]
    fn test_hexagon_ring_closed() {
        let grid = H3Grid;
        let cell = grid.encode(40.7128, -74.0060, 10).unwrap();
        let ring = grid.ring(&cell, 10).unwrap();
        assert_eq!(ring.first(), ring.last());
        assert!(ring.len() >= 7);
    }

    #[test]
    fn test_max_resolution() {
        let grid = H3Grid;
        let cell = grid.encode(40.7128, -74.0060, 15).unwrap();
        assert!(grid.center(&cell, 15).is_ok());
        assert_eq!(grid.level_for_distance(0.1), 15);
        assert_eq!(grid.level_for_distance(1000.0), 7);
    }
}
