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

use serde::{Deserialize, Serialize};

use crate::utils::json;

/// role based access: explicit deny wins over allow, allow supports a
/// trailing `*` wildcard
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    /// max queries per day, 0 means unlimited
    #[serde(default)]
    pub quota: u64,
}

impl Role {
    pub fn permits(&self, resource: &str) -> bool {
        if self.deny.iter().any(|p| pattern_matches(p, resource)) {
            return false;
        }
        self.allow.iter().any(|p| pattern_matches(p, resource))
    }
}

fn pattern_matches(pattern: &str, resource: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => resource.starts_with(prefix),
        None => pattern == resource,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    /// sha256 of the key material, plaintext is never stored
    pub key_hash: String,
    pub tenant: String,
    pub role: String,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub tenant: String,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub allowed: bool,
    pub context: json::Map<String, json::Value>,
    /// UTC microseconds
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_permits() {
        let role = Role {
            name: "analyst".to_string(),
            allow: vec!["query:*".to_string()],
            deny: vec!["query:audit_log".to_string()],
            quota: 0,
        };
        assert!(role.permits("query:events"));
        assert!(!role.permits("query:audit_log"));
        assert!(!role.permits("cluster:add-node"));
    }
}
