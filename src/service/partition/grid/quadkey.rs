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

//! Bing-style quadkeys over web mercator tiles, levels 1..=23. A quadkey is
//! the base-4 path of a tile down the quad tree.

use config::meta::partition::GridSystem;
use infra::errors::*;

use super::Grid;

const MIN_LAT: f64 = -85.05112878;
const MAX_LAT: f64 = 85.05112878;
/// equatorial circumference in meters, tile size at level z is this / 2^z
const EARTH_CIRCUMFERENCE_M: f64 = 40_075_016.686;

pub struct QuadkeyGrid;

fn tile_count(level: u8) -> i64 {
    1i64 << level
}

fn latlon_to_tile(lat: f64, lon: f64, level: u8) -> (i64, i64) {
    let lat = lat.clamp(MIN_LAT, MAX_LAT);
    let lon = lon.clamp(-180.0, 180.0);
    let n = tile_count(level) as f64;
    let x = ((lon + 180.0) / 360.0 * n).floor() as i64;
    let lat_rad = lat.to_radians();
    let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0
        * n)
        .floor() as i64;
    let max = tile_count(level) - 1;
    (x.clamp(0, max), y.clamp(0, max))
}

/// north-west corner of a tile
fn tile_to_latlon(x: i64, y: i64, level: u8) -> (f64, f64) {
    let n = tile_count(level) as f64;
    let lon = x as f64 / n * 360.0 - 180.0;
    let lat_rad = (std::f64::consts::PI * (1.0 - 2.0 * y as f64 / n)).sinh().atan();
    (lat_rad.to_degrees(), lon)
}

fn tile_to_quadkey(x: i64, y: i64, level: u8) -> String {
    let mut key = String::with_capacity(level as usize);
    for i in (1..=level).rev() {
        let mask = 1i64 << (i - 1);
        let mut digit = 0u8;
        if x & mask != 0 {
            digit += 1;
        }
        if y & mask != 0 {
            digit += 2;
        }
        key.push((b'0' + digit) as char);
    }
    key
}

fn quadkey_to_tile(key: &str) -> Result<(i64, i64, u8)> {
    let level = key.len() as u8;
    if level == 0 || level > 23 {
        return Err(Error::ErrorCode(ErrorCodes::InvalidRequest(format!(
            "quadkey length {level} out of range 1..=23"
        ))));
    }
    let mut x = 0i64;
    let mut y = 0i64;
    for (i, c) in key.chars().enumerate() {
        let mask = 1i64 << (level as usize - i - 1);
        match c {
            '0' => {}
            '1' => x |= mask,
            '2' => y |= mask,
            '3' => {
                x |= mask;
                y |= mask;
            }
            _ => {
                return Err(Error::ErrorCode(ErrorCodes::InvalidRequest(format!(
                    "invalid quadkey digit: {c}"
                ))));
            }
        }
    }
    Ok((x, y, level))
}

impl Grid for QuadkeyGrid {
    fn system(&self) -> GridSystem {
        GridSystem::Quadkey
    }

    fn min_level(&self) -> u8 {
        1
    }

    fn max_level(&self) -> u8 {
        23
    }

    fn encode(&self, lat: f64, lon: f64, level: u8) -> Result<String> {
        if level < 1 || level > 23 {
            return Err(Error::ErrorCode(ErrorCodes::InvalidRequest(format!(
                "quadkey level {level} out of range 1..=23"
            ))));
        }
        let (x, y) = latlon_to_tile(lat, lon, level);
        Ok(tile_to_quadkey(x, y, level))
    }

    fn center(&self, cell: &str, _level: u8) -> Result<(f64, f64)> {
        let (x, y, level) = quadkey_to_tile(cell)?;
        let (lat_nw, lon_nw) = tile_to_latlon(x, y, level);
        let (lat_se, lon_se) = tile_to_latlon(x + 1, y + 1, level);
        Ok(((lat_nw + lat_se) / 2.0, (lon_nw + lon_se) / 2.0))
    }

    fn ring(&self, cell: &str, _level: u8) -> Result<Vec<(f64, f64)>> {
        let (x, y, level) = quadkey_to_tile(cell)?;
        let (lat_n, lon_w) = tile_to_latlon(x, y, level);
        let (lat_s, lon_e) = tile_to_latlon(x + 1, y + 1, level);
        Ok(vec![
            (lat_s, lon_w),
            (lat_s, lon_e),
            (lat_n, lon_e),
            (lat_n, lon_w),
            (lat_s, lon_w),
        ])
    }

    fn neighbors(&self, cell: &str, _level: u8) -> Result<Vec<String>> {
        let (x, y, level) = quadkey_to_tile(cell)?;
        let n = tile_count(level);
        let mut out = Vec::with_capacity(8);
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let ny = y + dy;
                if ny < 0 || ny >= n {
                    continue; // no wrap across the poles
                }
                let nx = (x + dx).rem_euclid(n); // antimeridian wraps
                out.push(tile_to_quadkey(nx, ny, level));
            }
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    fn parent(&self, cell: &str, level: u8) -> Result<Option<(String, u8)>> {
        let (_, _, key_level) = quadkey_to_tile(cell)?;
        let _ = level;
        if key_level <= 1 {
            return Ok(None);
        }
        Ok(Some((cell[..cell.len() - 1].to_string(), key_level - 1)))
    }

    fn children(&self, cell: &str, level: u8, child_level: u8) -> Result<Vec<String>> {
        quadkey_to_tile(cell)?;
        let mut cells = vec![cell.to_string()];
        for _ in level..child_level {
            let mut next = Vec::with_capacity(cells.len() * 4);
            for prefix in &cells {
                for d in ['0', '1', '2', '3'] {
                    next.push(format!("{prefix}{d}"));
                }
            }
            cells = next;
        }
        Ok(cells)
    }

    fn level_for_distance(&self, meters: f64) -> u8 {
        for level in 1..=23u8 {
            let size = EARTH_CIRCUMFERENCE_M / tile_count(level) as f64;
            if size <= meters {
                return level;
            }
        }
        23
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quadkey_roundtrip() {
        let grid = QuadkeyGrid;
        for level in [1u8, 5, 12, 23] {
            let cell = grid.encode(40.7128, -74.0060, level).unwrap();
            assert_eq!(cell.len(), level as usize);
            let (x, y, l) = quadkey_to_tile(&cell).unwrap();
            assert_eq!(l, level);
            assert_eq!(tile_to_quadkey(x, y, level), cell);
        }
    }

    #[test]
    fn test_known_quadkey() {
        // bing maps documentation example: tile (3, 5) at level 3 is "213"
        assert_eq!(tile_to_quadkey(3, 5, 3), "213");
        assert_eq!(quadkey_to_tile("213").unwrap(), (3, 5, 3));
    }

    #[test]
    fn test_neighbors_interior_tile() {
        let grid = QuadkeyGrid;
        let cell = grid.encode(40.7128, -74.0060, 10).unwrap();
        let neighbors = grid.neighbors(&cell, 10).unwrap();
        assert_eq!(neighbors.len(), 8);
    }

    #[test]
    fn test_neighbors_at_pole_edge() {
        let grid = QuadkeyGrid;
        let cell = grid.encode(85.0, 0.0, 3).unwrap();
        let neighbors = grid.neighbors(&cell, 3).unwrap();
        // top row tiles lose their three northern neighbors
        assert_eq!(neighbors.len(), 5);
    }

    #[test]
    fn test_children_are_prefixed() {
        let grid = QuadkeyGrid;
        let children = grid.children("213", 3, 5).unwrap();
        assert_eq!(children.len(), 16);
        assert!(children.iter().all(|c| c.starts_with("213")));
    }
}
