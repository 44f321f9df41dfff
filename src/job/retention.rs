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

use crate::service::{cluster, monitor::collector, partition::retention};

pub async fn run() -> Result<(), anyhow::Error> {
    let cfg = config::get_config();
    if !cfg.retention.enabled {
        return Ok(());
    }
    let mut interval = time::interval(time::Duration::from_secs(cfg.retention.interval));
    interval.tick().await; // trigger the first run
    loop {
        interval.tick().await;
        // archive/delete runs on exactly one node
        if !cluster::is_coordinator() {
            continue;
        }
        match retention::enforce().await {
            Ok(0) => {}
            Ok(expired) => log::info!("[RETENTION] expired {expired} partitions"),
            Err(e) => log::error!("[RETENTION] enforcement error: {e}"),
        }
        let dropped = collector::enforce_retention();
        if dropped > 0 {
            log::debug!("[RETENTION] dropped {dropped} metric samples");
        }
    }
}
