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

pub mod cluster;
pub mod config;
pub mod ider;
pub mod meta;
pub mod metrics;
pub mod utils;

pub use config::*;

pub fn init() -> Result<(), anyhow::Error> {
    // init ider
    ider::init()?;

    // make sure the data directories exist before any component touches them
    let cfg = get_config();
    std::fs::create_dir_all(&cfg.common.data_dir)?;
    std::fs::create_dir_all(&cfg.common.data_raft_dir)?;
    std::fs::create_dir_all(&cfg.common.data_backup_dir)?;
    std::fs::create_dir_all(&cfg.common.data_partition_dir)?;
    Ok(())
}
