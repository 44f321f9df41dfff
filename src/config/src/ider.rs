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

use crate::utils::rand::generate_random_string;

pub fn init() -> Result<(), anyhow::Error> {
    _ = generate();
    Ok(())
}

/// time ordered unique id, uuid v7 plus a random suffix against same-tick collisions
pub fn generate() -> String {
    format!(
        "{}{}",
        uuid::Uuid::now_v7().simple(),
        generate_random_string(6)
    )
}

pub fn uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let id = generate();
        assert_ne!(id, "");
        let id2 = generate();
        assert_ne!(id, id2);
    }

    #[test]
    fn test_ids_sort_by_time() {
        let a = generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = generate();
        assert!(a < b);
    }
}
