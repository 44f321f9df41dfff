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
    Router,
    routing::{delete, get, post},
};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};

use super::request::{cluster, health, ingest, metrics, query};

pub fn create_router() -> Router {
    Router::new()
        .route("/v1/query", post(query::search))
        .route("/v1/ingest", post(ingest::ingest))
        .route("/v1/health", get(health::healthz))
        .route("/metrics", get(metrics::prometheus))
        .route("/v1/cluster/rpc", post(cluster::rpc))
        .route(
            "/v1/cluster/nodes",
            get(cluster::list_nodes).post(cluster::add_node),
        )
        .route("/v1/cluster/nodes/{id}", delete(cluster::remove_node))
        .route("/v1/partition/rebalance", post(cluster::rebalance))
        .route(
            "/v1/federation/sources",
            get(cluster::list_sources).post(cluster::add_source),
        )
        .route("/v1/federation/execute", post(cluster::execute_sub_plan))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve() -> Result<(), anyhow::Error> {
    let cfg = config::get_config();
    let addr = if cfg.http.addr.is_empty() {
        if cfg.http.ipv6_enabled {
            format!("[::]:{}", cfg.http.port)
        } else {
            format!("0.0.0.0:{}", cfg.http.port)
        }
    } else {
        format!("{}:{}", cfg.http.addr, cfg.http.port)
    };

    if cfg.tls.enabled {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &cfg.tls.cert_path,
            &cfg.tls.key_path,
        )
        .await?;
        let socket_addr: std::net::SocketAddr = addr.parse()?;
        log::info!("[HTTP] listening on {addr} with tls");
        axum_server::bind_rustls(socket_addr, tls)
            .serve(create_router().into_make_service())
            .await?;
        return Ok(());
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("[HTTP] listening on {addr}");
    axum::serve(listener, create_router()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_builds() {
        let _router = create_router();
    }
}
