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

use crate::service::{db::segment, query::optimizer::stats};

pub async fn run() -> Result<(), anyhow::Error> {
    let mut interval = time::interval(time::Duration::from_secs(120));
    interval.tick().await; // trigger the first run
    loop {
        interval.tick().await;
        stats::refresh_from_partitions();
        // flush partition segments so restarts and backups see fresh data
        for partition in crate::service::db::list_partitions() {
            let Ok(records) = crate::service::db::partition_records(&partition.key) else {
                continue;
            };
            if records.is_empty() {
                continue;
            }
            let on_disk = segment::load_manifest(&partition.key)
                .ok()
                .flatten()
                .map(|m| m.segments.iter().map(|s| s.record_count).sum::<u64>())
                .unwrap_or(0);
            if (records.len() as u64) > on_disk {
                let fresh = &records[on_disk as usize..];
                if let Err(e) = segment::flush(&partition.key, fresh) {
                    log::error!("[STATS] segment flush for {} error: {e}", partition.key);
                }
            }
        }
    }
}
