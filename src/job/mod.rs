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

pub mod alert_manager;
pub mod cache_gc;
pub mod cluster;
pub mod retention;
pub mod rollup;
pub mod stats;
pub mod views;

pub async fn init() -> Result<(), anyhow::Error> {
    tokio::task::spawn(async move { cluster::run().await });
    tokio::task::spawn(async move { retention::run().await });
    tokio::task::spawn(async move { rollup::run().await });
    tokio::task::spawn(async move { views::run().await });
    tokio::task::spawn(async move { alert_manager::run().await });
    tokio::task::spawn(async move { cache_gc::run().await });
    tokio::task::spawn(async move { stats::run().await });
    Ok(())
}
