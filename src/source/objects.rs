// ABOUTME: Catalogue of replicable Monday objects and the record type flowing to sinks
// ABOUTME: Holds per-object ingestion metadata: primary keys, diff support, board scoping

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// How an object can be replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionType {
    /// Full snapshot first, then activity-log driven incremental runs
    Cdc,
    /// Always a full snapshot
    Snapshot,
}

impl fmt::Display for IngestionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestionType::Cdc => f.pad("cdc"),
            IngestionType::Snapshot => f.pad("snapshot"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Boards,
    Items,
    Users,
    Workspaces,
    Teams,
    Groups,
    Tags,
    Updates,
    ActivityLogs,
}

impl ObjectType {
    pub const ALL: [ObjectType; 9] = [
        ObjectType::Boards,
        ObjectType::Items,
        ObjectType::Users,
        ObjectType::Workspaces,
        ObjectType::Teams,
        ObjectType::Groups,
        ObjectType::Tags,
        ObjectType::Updates,
        ObjectType::ActivityLogs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Boards => "boards",
            ObjectType::Items => "items",
            ObjectType::Users => "users",
            ObjectType::Workspaces => "workspaces",
            ObjectType::Teams => "teams",
            ObjectType::Groups => "groups",
            ObjectType::Tags => "tags",
            ObjectType::Updates => "updates",
            ObjectType::ActivityLogs => "activity_logs",
        }
    }

    pub fn ingestion_type(&self) -> IngestionType {
        match self {
            ObjectType::Boards | ObjectType::Items => IngestionType::Cdc,
            _ => IngestionType::Snapshot,
        }
    }

    /// Only objects with an activity-log trail can be diffed.
    pub fn supports_diff(&self) -> bool {
        self.ingestion_type() == IngestionType::Cdc
    }

    pub fn primary_keys(&self) -> &'static [&'static str] {
        match self {
            ObjectType::Groups | ObjectType::Tags | ObjectType::ActivityLogs => &["id", "board_id"],
            _ => &["id"],
        }
    }

    /// Objects fetched through a list of boards (configured or discovered).
    pub fn is_board_scoped(&self) -> bool {
        matches!(
            self,
            ObjectType::Items | ObjectType::Groups | ObjectType::Tags | ObjectType::ActivityLogs
        )
    }

    /// Activity-log `entity` value that marks a change to this object.
    pub fn log_entity(&self) -> Option<&'static str> {
        match self {
            ObjectType::Boards => Some("board"),
            ObjectType::Items => Some("pulse"),
            _ => None,
        }
    }

    pub fn default_page_size(&self) -> usize {
        match self {
            ObjectType::Items => 100,
            _ => 50,
        }
    }

    /// Value sent for the `state` filter when none is configured.
    pub fn default_state(&self) -> Option<&'static str> {
        match self {
            ObjectType::Boards | ObjectType::Workspaces => Some("all"),
            _ => None,
        }
    }

    /// Value sent for the `kind` filter when none is configured.
    pub fn default_kind(&self) -> Option<&'static str> {
        match self {
            ObjectType::Users => Some("all"),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectType::ALL
            .iter()
            .copied()
            .find(|o| o.as_str() == s.trim())
            .ok_or_else(|| {
                let names: Vec<&str> = ObjectType::ALL.iter().map(|o| o.as_str()).collect();
                anyhow::anyhow!(
                    "Unknown object '{}'. Supported objects: {}",
                    s,
                    names.join(", ")
                )
            })
    }
}

/// One materialized entity, ready to hand to a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub object_type: ObjectType,
    pub id: String,
    /// Owning board for items, groups, tags and activity logs; owning item for updates
    pub parent_id: Option<String>,
    /// Output row with the object's column set
    pub row: serde_json::Value,
}

impl Record {
    /// Destination key: `id`, or `board_id:id` for objects keyed by both.
    pub fn key(&self) -> String {
        if self.object_type.primary_keys().len() > 1 {
            format!("{}:{}", self.parent_id.as_deref().unwrap_or(""), self.id)
        } else {
            self.id.clone()
        }
    }
}
