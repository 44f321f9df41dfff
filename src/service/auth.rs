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

//! API keys and RBAC. Keys are stored and compared as SHA-256 hashes; the
//! policy check runs deny-first over the caller's role and every decision
//! emits an audit event.

use config::{
    RwHashMap, get_config, ider,
    meta::policy::{ApiKey, AuditEvent, Role},
    utils::{json, time::now_micros},
};
use infra::errors::*;
use once_cell::sync::Lazy;

static API_KEYS: Lazy<RwHashMap<String, ApiKey>> = Lazy::new(Default::default);
static ROLES: Lazy<RwHashMap<String, Role>> = Lazy::new(Default::default);
/// queries consumed per (tenant, role) in the current quota day
static QUOTA_USED: Lazy<RwHashMap<(String, String), (i64, u64)>> = Lazy::new(Default::default);

pub fn init() {
    // the root key from the environment, if configured
    let cfg = get_config();
    set_role(Role {
        name: "admin".to_string(),
        allow: vec!["*".to_string()],
        deny: vec![],
        quota: 0,
    });
    if !cfg.auth.root_api_key.is_empty() {
        add_api_key(&cfg.auth.root_api_key, "default", "admin");
    }
}

pub fn hash_key(key: &str) -> String {
    sha256::digest(key)
}

pub fn add_api_key(plaintext: &str, tenant: &str, role: &str) {
    let key = ApiKey {
        key_hash: hash_key(plaintext),
        tenant: tenant.to_string(),
        role: role.to_string(),
        disabled: false,
    };
    API_KEYS.insert(key.key_hash.clone(), key);
}

pub fn set_role(role: Role) {
    ROLES.insert(role.name.clone(), role);
}

/// the authenticated principal a request acts as
#[derive(Clone, Debug)]
pub struct Identity {
    pub tenant: String,
    pub role: String,
}

/// cryptographic hash compare of the presented key
pub fn authenticate(tenant: &str, api_key: &str) -> Result<Identity> {
    if api_key.is_empty() {
        return Err(Error::ErrorCode(ErrorCodes::AuthFailed));
    }
    let hash = hash_key(api_key);
    let Some(key) = API_KEYS.get(&hash) else {
        return Err(Error::ErrorCode(ErrorCodes::AuthFailed));
    };
    if key.disabled || (key.tenant != tenant && key.role != "admin") {
        return Err(Error::ErrorCode(ErrorCodes::AuthFailed));
    }
    Ok(Identity {
        tenant: tenant.to_string(),
        role: key.role.clone(),
    })
}

/// allow/deny + quota; emits the audit trail either way
pub fn authorize(identity: &Identity, resource: &str) -> Result<()> {
    let role = ROLES
        .get(&identity.role)
        .map(|r| r.clone())
        .unwrap_or_default();

    let allowed = role.name == "admin" || role.permits(resource);
    let quota_ok = allowed && check_quota(identity, &role);
    audit(identity, resource, allowed && quota_ok);

    if !allowed {
        return Err(Error::ErrorCode(ErrorCodes::Forbidden(resource.to_string())));
    }
    if !quota_ok {
        return Err(Error::ErrorCode(ErrorCodes::QuotaExceeded(
            identity.tenant.clone(),
        )));
    }
    Ok(())
}

fn check_quota(identity: &Identity, role: &Role) -> bool {
    if role.quota == 0 {
        return true;
    }
    let day = now_micros() / (86_400 * 1_000_000);
    let mut used = QUOTA_USED
        .entry((identity.tenant.clone(), role.name.clone()))
        .or_insert((day, 0));
    if used.0 != day {
        *used = (day, 0);
    }
    if used.1 >= role.quota {
        return false;
    }
    used.1 += 1;
    true
}

fn audit(identity: &Identity, resource: &str, allowed: bool) {
    if !get_config().auth.audit_enabled {
        return;
    }
    let event = AuditEvent {
        id: ider::generate(),
        tenant: identity.tenant.clone(),
        actor: identity.role.clone(),
        action: "access".to_string(),
        resource: resource.to_string(),
        allowed,
        context: json::Map::new(),
        timestamp: now_micros(),
    };
    match json::to_string(&event) {
        Ok(line) => log::info!("[AUDIT] {line}"),
        Err(e) => log::error!("[AUDIT] serialize error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticate_hash_compare() {
        add_api_key("sekrit", "auth_t1", "analyst");
        set_role(Role {
            name: "analyst".to_string(),
            allow: vec!["query:*".to_string()],
            deny: vec!["query:audit_log".to_string()],
            quota: 0,
        });
        assert!(authenticate("auth_t1", "sekrit").is_ok());
        assert!(matches!(
            authenticate("auth_t1", "wrong"),
            Err(Error::ErrorCode(ErrorCodes::AuthFailed))
        ));
        assert!(authenticate("other_tenant", "sekrit").is_err());
    }

    #[test]
    fn test_authorize_deny_wins() {
        add_api_key("k2", "auth_t2", "analyst2");
        set_role(Role {
            name: "analyst2".to_string(),
            allow: vec!["query:*".to_string()],
            deny: vec!["query:audit_log".to_string()],
            quota: 0,
        });
        let identity = authenticate("auth_t2", "k2").unwrap();
        assert!(authorize(&identity, "query:events").is_ok());
        assert!(matches!(
            authorize(&identity, "query:audit_log"),
            Err(Error::ErrorCode(ErrorCodes::Forbidden(_)))
        ));
    }

    #[test]
    fn test_quota_exhaustion() {
        add_api_key("k3", "auth_t3", "limited");
        set_role(Role {
            name: "limited".to_string(),
            allow: vec!["query:*".to_string()],
            deny: vec![],
            quota: 2,
        });
        let identity = authenticate("auth_t3", "k3").unwrap();
        assert!(authorize(&identity, "query:events").is_ok());
        assert!(authorize(&identity, "query:events").is_ok());
        assert!(matches!(
            authorize(&identity, "query:events"),
            Err(Error::ErrorCode(ErrorCodes::QuotaExceeded(_)))
        ));
    }
}
