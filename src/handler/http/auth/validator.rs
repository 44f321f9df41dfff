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

//! Request validation: authenticate the key, enforce rate limits, check the
//! RBAC policy. Each step maps onto its own HTTP failure class.

use infra::errors::*;

use crate::service::{auth, ratelimit};

/// full policy envelope check for one request
pub fn validate(tenant: &str, api_key: &str, resource: &str) -> Result<auth::Identity> {
    let identity = auth::authenticate(tenant, api_key)?;

    let decision = ratelimit::try_consume(tenant, resource_class(resource), 1.0);
    if !decision.allowed {
        return Err(Error::ErrorCode(ErrorCodes::RateLimited(format!(
            "retry after {:.1}s",
            decision.retry_after_secs
        ))));
    }

    auth::authorize(&identity, resource)?;
    Ok(identity)
}

/// rate limits bucket on the resource class, not the full resource name
fn resource_class(resource: &str) -> &str {
    resource.split(':').next().unwrap_or(resource)
}

#[cfg(test)]
mod tests {
    use config::meta::policy::Role;

    use super::*;

    #[test]
    fn test_validate_flow() {
        auth::add_api_key("vkey", "val_t1", "val_role");
        auth::set_role(Role {
            name: "val_role".to_string(),
            allow: vec!["query:*".to_string()],
            deny: vec![],
            quota: 0,
        });
        assert!(validate("val_t1", "vkey", "query:events").is_ok());
        assert!(matches!(
            validate("val_t1", "nope", "query:events"),
            Err(Error::ErrorCode(ErrorCodes::AuthFailed))
        ));
        assert!(matches!(
            validate("val_t1", "vkey", "cluster:join"),
            Err(Error::ErrorCode(ErrorCodes::Forbidden(_)))
        ));
    }
}
