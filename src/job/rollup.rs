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

use tokio::time;

use crate::service::{cluster, partition::rollup};

pub async fn run() -> Result<(), anyhow::Error> {
    let cfg = config::get_config();
    if !cfg.retention.rollup_enabled {
        return Ok(());
    }
    let mut interval = time::interval(time::Duration::from_secs(cfg.retention.rollup_interval));
    interval.tick().await; // trigger the first run
    loop {
        interval.tick().await;
        // rollup output is written once, by the leader
        if !cluster::is_coordinator() {
            continue;
        }
        if let Err(e) = rollup::run().await {
            log::error!("[ROLLUP] run error: {e}");
        }
    }
}
