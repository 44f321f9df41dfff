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

//! Materialized views: a stored query refreshed on an interval. Readers
//! always see the latest complete materialization; the swap is atomic.

use std::sync::Arc;

use arc_swap::ArcSwap;
use config::{
    RwHashMap,
    meta::search::{QueryOptions, QueryRequest},
    utils::{json, time::now_micros},
};
use infra::errors::*;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub name: String,
    pub tenant: String,
    pub dialect: String,
    pub query: String,
    pub refresh_interval_secs: u64,
    /// materializations older than this are dropped instead of served
    pub retention_secs: u64,
}

#[derive(Clone, Debug)]
pub struct Materialization {
    pub rows: Vec<json::Value>,
    pub refreshed_at: i64,
}

struct View {
    definition: ViewDefinition,
    current: ArcSwap<Option<Materialization>>,
    last_refresh: parking_lot::Mutex<i64>,
}

static VIEWS: Lazy<RwHashMap<String, Arc<View>>> = Lazy::new(Default::default);

pub fn define(definition: ViewDefinition) {
    VIEWS.insert(
        definition.name.clone(),
        Arc::new(View {
            definition,
            current: ArcSwap::from(Arc::new(None)),
            last_refresh: parking_lot::Mutex::new(0),
        }),
    );
}

pub fn drop_view(name: &str) {
    VIEWS.remove(name);
}

pub fn list() -> Vec<ViewDefinition> {
    VIEWS.iter().map(|v| v.definition.clone()).collect()
}

/// the newest materialization, None until the first refresh lands or after
/// retention expired it
pub fn read(name: &str) -> Result<Option<Materialization>> {
    let view = VIEWS
        .get(name)
        .ok_or_else(|| Error::ErrorCode(ErrorCodes::SourceNotFound(name.to_string())))?;
    let loaded = view.current.load_full();
    Ok(match loaded.as_ref() {
        Some(m) => {
            let retention = (view.definition.retention_secs as i64) * 1_000_000;
            if retention > 0 && now_micros() - m.refreshed_at > retention {
                None
            } else {
                Some(m.clone())
            }
        }
        None => None,
    })
}

/// refresh every view whose interval elapsed
pub async fn refresh_due() -> Result<usize> {
    let now = now_micros();
    let mut refreshed = 0;
    let views: Vec<Arc<View>> = VIEWS.iter().map(|v| v.clone()).collect();
    for view in views {
        let due = {
            let last = view.last_refresh.lock();
            now - *last >= (view.definition.refresh_interval_secs as i64) * 1_000_000
        };
        if !due {
            continue;
        }
        match refresh(&view).await {
            Ok(_) => refreshed += 1,
            Err(e) => log::error!(
                "[VIEWS] refresh of {} failed: {e}",
                view.definition.name
            ),
        }
    }
    Ok(refreshed)
}

async fn refresh(view: &View) -> Result<()> {
    let request = QueryRequest {
        request_id: config::ider::generate(),
        tenant: view.definition.tenant.clone(),
        api_key: String::new(),
        dialect: view.definition.dialect.clone(),
        query: view.definition.query.clone(),
        options: QueryOptions {
            cache: false,
            ..Default::default()
        },
    };
    let response = crate::service::query::search(&request).await?;
    let materialization = Materialization {
        rows: response.data,
        refreshed_at: now_micros(),
    };
    view.current.store(Arc::new(Some(materialization)));
    *view.last_refresh.lock() = now_micros();
    log::info!("[VIEWS] refreshed {}", view.definition.name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_view_errors() {
        assert!(read("views_missing").is_err());
    }

    #[tokio::test]
    async fn test_define_refresh_read() {
        crate::service::partition::init().unwrap();
        crate::service::federation::sources::init();
        define(ViewDefinition {
            name: "views_v1".to_string(),
            tenant: "default".to_string(),
            dialect: "sql".to_string(),
            query: "SELECT user_id FROM view_source LIMIT 5".to_string(),
            refresh_interval_secs: 0,
            retention_secs: 0,
        });
        assert!(read("views_v1").unwrap().is_none());
        let refreshed = refresh_due().await.unwrap();
        assert!(refreshed >= 1);
        assert!(read("views_v1").unwrap().is_some());
        drop_view("views_v1");
    }
}
