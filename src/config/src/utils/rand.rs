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

use rand::{Rng, distr::Alphanumeric, distr::SampleString};

pub fn generate_random_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::rng(), len)
}

pub fn get_rand_num_within(min: u64, max: u64) -> u64 {
    if min >= max {
        return min;
    }
    rand::rng().random_range(min..max)
}

/// uniform in [-jitter, +jitter], used for ttl spreading
pub fn get_rand_jitter(jitter: f64) -> f64 {
    if jitter <= 0.0 {
        return 0.0;
    }
    rand::rng().random_range(-jitter..=jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_random_string() {
        let random_string = generate_random_string(10);
        assert_eq!(random_string.len(), 10);
    }

    #[test]
    fn test_rand_num_within() {
        for _ in 0..100 {
            let v = get_rand_num_within(150, 300);
            assert!((150..300).contains(&v));
        }
        assert_eq!(get_rand_num_within(5, 5), 5);
    }

    #[test]
    fn test_rand_jitter() {
        for _ in 0..100 {
            let v = get_rand_jitter(0.1);
            assert!((-0.1..=0.1).contains(&v));
        }
        assert_eq!(get_rand_jitter(0.0), 0.0);
    }
}
