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

//! Cluster transport: request/response envelopes over HTTP with pooled
//! client sessions. Delivery is at-least-once; receivers deduplicate on
//! msg_id and replay the original response for retransmits.

use std::{sync::Arc, time::Duration};

use config::{cluster::LOCAL_NODE_UUID, get_config, ider, utils::json, utils::time::now_micros};
use hashlink::LruCache;
use infra::errors::*;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_id: String,
    pub source: String,
    pub target: String,
    /// UTC microseconds at send time
    pub timestamp: i64,
    pub msg_type: String,
    pub payload: json::Value,
}

impl Envelope {
    pub fn new(target: &str, msg_type: &str, payload: json::Value) -> Self {
        Envelope {
            msg_id: ider::uuid(),
            source: LOCAL_NODE_UUID.clone(),
            target: target.to_string(),
            timestamp: now_micros(),
            msg_type: msg_type.to_string(),
            payload,
        }
    }

    /// a response keeps the msg_id so retransmits map to the same reply
    pub fn reply(&self, payload: json::Value) -> Envelope {
        Envelope {
            msg_id: self.msg_id.clone(),
            source: LOCAL_NODE_UUID.clone(),
            target: self.source.clone(),
            timestamp: now_micros(),
            msg_type: format!("{}.response", self.msg_type),
            payload,
        }
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, addr: &str, envelope: Envelope) -> Result<Envelope>;
}

/// handles envelopes arriving at this node
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Result<Envelope>;
}

static HANDLER: OnceCell<Arc<dyn RpcHandler>> = OnceCell::const_new();

pub fn set_handler(handler: Arc<dyn RpcHandler>) {
    if HANDLER.set(handler).is_err() {
        log::warn!("[TRANSPORT] rpc handler already registered");
    }
}

/// seen msg_id -> serialized response, replayed on retransmit
static SEEN: Lazy<Mutex<LruCache<String, Envelope>>> = Lazy::new(|| {
    Mutex::new(LruCache::new(
        get_config().cluster.transport_seen_cache_size,
    ))
});

/// entry point for envelopes received over HTTP
pub async fn receive(envelope: Envelope) -> Result<Envelope> {
    if let Some(cached) = SEEN.lock().get(&envelope.msg_id) {
        return Ok(cached.clone());
    }
    let handler = HANDLER
        .get()
        .ok_or_else(|| Error::Message("rpc handler not registered".to_string()))?
        .clone();
    let response = handler.handle(envelope.clone()).await?;
    SEEN.lock().insert(envelope.msg_id, response.clone());
    Ok(response)
}

/// HTTP transport with one pooled client per process
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let cfg = get_config();
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(cfg.limit.query_timeout))
            .build()
            .expect("reqwest client built");
        HttpTransport { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(&self, addr: &str, envelope: Envelope) -> Result<Envelope> {
        let url = format!("{}/v1/cluster/rpc", addr.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| {
                Error::ErrorCode(ErrorCodes::PeerUnreachable(format!("{addr}: {e}")))
            })?;
        if !response.status().is_success() {
            return Err(Error::ErrorCode(ErrorCodes::PeerUnreachable(format!(
                "{addr}: status {}",
                response.status()
            ))));
        }
        response
            .json::<Envelope>()
            .await
            .map_err(|e| Error::Message(format!("invalid rpc response from {addr}: {e}")))
    }
}

/// in-process transport, every address routes to the local handler; used by
/// single node deployments and tests
pub struct LoopbackTransport;

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, _addr: &str, envelope: Envelope) -> Result<Envelope> {
        receive(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle(&self, envelope: Envelope) -> Result<Envelope> {
            let reply = envelope.reply(json::json!({"echo": envelope.payload}));
            Ok(reply)
        }
    }

    #[tokio::test]
    async fn test_loopback_dedup_replays_response() {
        set_handler(Arc::new(EchoHandler));
        let transport = LoopbackTransport;
        let envelope = Envelope::new("n2", "test.echo", json::json!({"v": 1}));
        let first = transport.send("local", envelope.clone()).await.unwrap();
        assert_eq!(first.msg_id, envelope.msg_id);
        assert_eq!(first.payload["echo"]["v"], 1);
        // retransmit of the same msg_id must not re-run the handler
        let second = transport.send("local", envelope).await.unwrap();
        assert_eq!(first.payload, second.payload);
        assert_eq!(first.timestamp, second.timestamp);
    }
}
