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

use crate::service::{cluster, monitor::views};

pub async fn run() -> Result<(), anyhow::Error> {
    let cfg = config::get_config();
    let mut interval =
        time::interval(time::Duration::from_secs(cfg.alert.view_refresh_interval.min(60)));
    interval.tick().await; // trigger the first run
    loop {
        interval.tick().await;
        // the stored query runs once per cluster, on the leader
        if !cluster::is_coordinator() {
            continue;
        }
        if let Err(e) = views::refresh_due().await {
            log::error!("[VIEWS] refresh error: {e}");
        }
    }
}
