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

//! Dispatch of incoming cluster envelopes to the raft, membership and
//! replication handlers.

use config::utils::json;
use infra::errors::*;

use super::{
    MSG_HEARTBEAT, raft, replication,
    transport::{Envelope, RpcHandler},
};

pub struct Dispatcher;

#[async_trait::async_trait]
impl RpcHandler for Dispatcher {
    async fn handle(&self, envelope: Envelope) -> Result<Envelope> {
        let payload = envelope.payload.clone();
        match envelope.msg_type.as_str() {
            raft::MSG_REQUEST_VOTE => {
                let request = json::from_value(payload)?;
                let response = raft::get()?.handle_request_vote(request);
                Ok(envelope.reply(json::to_value(&response)?))
            }
            raft::MSG_APPEND_ENTRIES => {
                let request: config::meta::raft::AppendEntries = json::from_value(payload)?;
                let leader_addr = super::get_node(&request.leader_id)
                    .await
                    .map(|n| n.http_addr);
                let response = raft::get()?.handle_append_entries(request, leader_addr);
                Ok(envelope.reply(json::to_value(&response)?))
            }
            raft::MSG_INSTALL_SNAPSHOT => {
                let request = json::from_value(payload)?;
                let response = raft::get()?.handle_install_snapshot(request);
                Ok(envelope.reply(json::to_value(&response)?))
            }
            MSG_HEARTBEAT => {
                let node = json::from_value(payload)?;
                super::process_heartbeat(node).await;
                Ok(envelope.reply(json::json!({"ok": true})))
            }
            replication::MSG_REPLICATE_WRITE => {
                let request = json::from_value(payload)?;
                let response = replication::handle_replica_write(request).await?;
                Ok(envelope.reply(json::to_value(&response)?))
            }
            replication::MSG_SYNC_PARTITION => {
                let request = json::from_value(payload)?;
                let response = replication::handle_sync_request(request).await?;
                Ok(envelope.reply(json::to_value(&response)?))
            }
            other => Err(Error::Message(format!("unknown rpc type: {other}"))),
        }
    }
}
