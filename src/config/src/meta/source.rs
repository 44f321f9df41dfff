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

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::query::JoinType;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Relational,
    Document,
    Graph,
    Timeseries,
    Object,
    Embedding,
}

impl FromStr for SourceKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "relational" => Ok(SourceKind::Relational),
            "document" => Ok(SourceKind::Document),
            "graph" => Ok(SourceKind::Graph),
            "timeseries" => Ok(SourceKind::Timeseries),
            "object" => Ok(SourceKind::Object),
            "embedding" => Ok(SourceKind::Embedding),
            _ => Err(format!("Invalid source kind: {s}")),
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Relational => write!(f, "relational"),
            SourceKind::Document => write!(f, "document"),
            SourceKind::Graph => write!(f, "graph"),
            SourceKind::Timeseries => write!(f, "timeseries"),
            SourceKind::Object => write!(f, "object"),
            SourceKind::Embedding => write!(f, "embedding"),
        }
    }
}

/// operators a source can evaluate on its own side
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub operators: Vec<String>,
    #[serde(default)]
    pub join_types: Vec<JoinType>,
    #[serde(default)]
    pub aggregates: Vec<String>,
    #[serde(default)]
    pub supports_sort: bool,
    #[serde(default)]
    pub supports_limit: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceAuth {
    #[default]
    None,
    ApiKey {
        key: String,
    },
    Basic {
        username: String,
        password: String,
    },
    Token {
        token: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub name: String,
    pub kind: SourceKind,
    pub endpoint: String,
    #[serde(default)]
    pub auth: SourceAuth,
    #[serde(default)]
    pub capabilities: Capabilities,
    /// tables/collections this source owns
    #[serde(default)]
    pub tables: Vec<String>,
    /// bumped on writes, observed by the cache invalidation path
    #[serde(default)]
    pub version: u64,
}

impl DataSource {
    pub fn owns_table(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t == table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_parse() {
        assert_eq!("timeseries".parse::<SourceKind>().unwrap(), SourceKind::Timeseries);
        assert!("columnar".parse::<SourceKind>().is_err());
    }
}
