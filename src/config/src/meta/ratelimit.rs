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

/// per (tenant, resource) limit override; absent pairs use the global config
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub tenant: String,
    pub resource: String,
    pub requests_per_second: f64,
    pub burst_size: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// seconds until a token is available, 0 when allowed
    pub retry_after_secs: f64,
}

impl RateLimitDecision {
    pub fn allow() -> Self {
        RateLimitDecision {
            allowed: true,
            retry_after_secs: 0.0,
        }
    }

    pub fn deny(retry_after_secs: f64) -> Self {
        RateLimitDecision {
            allowed: false,
            retry_after_secs,
        }
    }
}
