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

use axum::{
    Json,
    extract::Path,
    http::StatusCode,
};
use config::{meta::cluster::Node, utils::json};
use serde::Deserialize;

use super::{ApiError, ApiResult};
use crate::service::cluster::{self, transport};

/// POST /v1/cluster/rpc, the node-to-node envelope endpoint
pub async fn rpc(
    Json(envelope): Json<transport::Envelope>,
) -> ApiResult<Json<transport::Envelope>> {
    let response = transport::receive(envelope).await.map_err(ApiError)?;
    Ok(Json(response))
}

/// GET /v1/cluster/nodes
pub async fn list_nodes() -> Json<Vec<Node>> {
    Json(cluster::list_nodes().await)
}

#[derive(Debug, Deserialize)]
pub struct AddNodeRequest {
    pub addr: String,
}

/// POST /v1/cluster/nodes
pub async fn add_node(
    Json(request): Json<AddNodeRequest>,
) -> ApiResult<(StatusCode, Json<Node>)> {
    let node = cluster::add_node(&request.addr).await.map_err(ApiError)?;
    Ok((StatusCode::CREATED, Json(node)))
}

/// DELETE /v1/cluster/nodes/{id}
pub async fn remove_node(Path(id): Path<String>) -> ApiResult<StatusCode> {
    cluster::remove_node(&id).await.map_err(ApiError)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/partition/rebalance
pub async fn rebalance() -> ApiResult<Json<json::Value>> {
    let mut assigned = 0;
    for partition in crate::service::db::list_partitions() {
        if cluster::raft::get()
            .map(|r| !r.cluster_state().partition_locations.contains_key(&partition.key))
            .unwrap_or(false)
        {
            cluster::replication::assign_partition(&partition.key)
                .await
                .map_err(ApiError)?;
            assigned += 1;
        }
    }
    Ok(Json(json::json!({ "assigned": assigned })))
}

/// GET /v1/federation/sources
pub async fn list_sources() -> Json<Vec<config::meta::source::DataSource>> {
    Json(crate::service::federation::sources::list())
}

/// POST /v1/federation/sources
pub async fn add_source(
    Json(source): Json<config::meta::source::DataSource>,
) -> (StatusCode, Json<json::Value>) {
    let name = source.name.clone();
    crate::service::federation::sources::register(source);
    (StatusCode::CREATED, Json(json::json!({ "name": name })))
}

/// POST /v1/federation/execute, the remote side of cross-node sub-plans
pub async fn execute_sub_plan(
    Json(body): Json<json::Value>,
) -> ApiResult<Json<Vec<json::Value>>> {
    let tenant = body
        .get("tenant")
        .and_then(|v| v.as_str())
        .unwrap_or("default")
        .to_string();
    let plan: config::meta::plan::PlanNode = json::from_value(
        body.get("plan")
            .cloned()
            .unwrap_or(json::Value::Null),
    )
    .map_err(|e| {
        ApiError(infra::errors::Error::ErrorCode(
            infra::errors::ErrorCodes::InvalidRequest(e.to_string()),
        ))
    })?;
    let rows = crate::service::federation::sources::execute_local(&plan, &tenant)
        .map_err(ApiError)?;
    Ok(Json(rows))
}
