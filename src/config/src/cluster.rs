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

use once_cell::sync::Lazy;

use crate::get_config;

pub static LOCAL_NODE_UUID: Lazy<String> = Lazy::new(load_local_node_uuid);

pub static LOCAL_NODE_NAME: Lazy<String> = Lazy::new(|| {
    let cfg = get_config();
    if !cfg.common.node_name.is_empty() {
        return cfg.common.node_name.clone();
    }
    match hostname() {
        Some(name) => name,
        None => LOCAL_NODE_UUID.clone(),
    }
});

fn load_local_node_uuid() -> String {
    let cfg = get_config();
    if !cfg.common.node_id.is_empty() {
        return cfg.common.node_id.clone();
    }
    uuid::Uuid::now_v7().simple().to_string()
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
}

pub fn local_http_addr() -> String {
    let cfg = get_config();
    let addr = if cfg.http.addr.is_empty() {
        "127.0.0.1"
    } else {
        cfg.http.addr.as_str()
    };
    let scheme = if cfg.tls.enabled { "https" } else { "http" };
    format!("{}://{}:{}", scheme, addr, cfg.http.port)
}

pub fn cluster_seeds() -> Vec<String> {
    get_config()
        .common
        .cluster_seeds
        .split(',')
        .filter_map(|s| {
            let s = s.trim();
            if s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        })
        .collect()
}

/// single node deployments skip replication fan-out and remote transport
pub fn is_single_node() -> bool {
    cluster_seeds().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_node_uuid_stable() {
        assert_eq!(*LOCAL_NODE_UUID, *LOCAL_NODE_UUID);
        assert!(!LOCAL_NODE_UUID.is_empty());
    }

    #[test]
    fn test_local_http_addr() {
        let addr = local_http_addr();
        assert!(addr.starts_with("http"));
        assert!(addr.contains(':'));
    }
}
