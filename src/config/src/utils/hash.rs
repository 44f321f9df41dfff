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

use std::hash::{BuildHasher, Hash};

use once_cell::sync::Lazy;

pub trait Sum64 {
    fn sum64(&mut self, key: &str) -> u64;
}

// fixed seeds, the hash must be stable for lock striping and bucket selection
static BUILD_HASHER: Lazy<ahash::RandomState> =
    Lazy::new(|| ahash::RandomState::with_seeds(0x6a09, 0xbb67, 0x3c6e, 0xa54f));

pub struct AHasher;

pub fn new() -> AHasher {
    AHasher
}

impl Sum64 for AHasher {
    fn sum64(&mut self, key: &str) -> u64 {
        BUILD_HASHER.hash_one(key)
    }
}

#[inline(always)]
pub fn sum64<T: Hash>(value: &T) -> u64 {
    BUILD_HASHER.hash_one(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum64_deterministic() {
        let mut h = new();
        let a = h.sum64("partition/time/day/2024-01-01");
        let b = h.sum64("partition/time/day/2024-01-01");
        assert_eq!(a, b);
        let c = h.sum64("partition/time/day/2024-01-02");
        assert_ne!(a, c);
    }
}
