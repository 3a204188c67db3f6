// ABOUTME: Typed GraphQL payloads for each Monday object and their output rows
// ABOUTME: Normalises ids to i64, keeps item column values as an opaque JSON string

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::objects::{ObjectType, Record};

/// Activity-log timestamps count 10^-7 second units since the epoch.
const ACTIVITY_TICKS_PER_SECOND: i64 = 10_000_000;
const EPOCH_FALLBACK: &str = "1970-01-01T00:00:00Z";

/// Lenient integer conversion: numbers and numeric strings, anything else is null.
pub fn to_long(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn de_long<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(to_long))
}

/// Ids arrive as strings but fixtures and older endpoints use numbers.
fn de_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn id_string(id: Option<i64>) -> String {
    id.map(|i| i.to_string()).unwrap_or_default()
}

fn row<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Parse a 17-digit activity-log timestamp.
pub fn parse_activity_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let ticks: i64 = raw.trim().parse().ok()?;
    let secs = ticks.div_euclid(ACTIVITY_TICKS_PER_SECOND);
    let nanos = (ticks.rem_euclid(ACTIVITY_TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// RFC 3339 form used in output rows; unparseable input maps to the epoch.
pub fn format_activity_timestamp(raw: &str) -> String {
    parse_activity_timestamp(raw)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| EPOCH_FALLBACK.to_string())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdRef {
    #[serde(default, deserialize_with = "de_opt_string")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Board {
    #[serde(default, deserialize_with = "de_long")]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub board_kind: Option<String>,
    #[serde(default, deserialize_with = "de_long")]
    pub workspace_id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "de_long")]
    pub items_count: Option<i64>,
    #[serde(default)]
    pub permissions: Option<String>,
}

impl Board {
    pub fn into_record(self) -> Record {
        Record {
            object_type: ObjectType::Boards,
            id: id_string(self.id),
            parent_id: self.workspace_id.map(|w| w.to_string()),
            row: row(&self),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Item {
    #[serde(default, deserialize_with = "de_long")]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default, deserialize_with = "de_long")]
    pub creator_id: Option<i64>,
    #[serde(default)]
    pub board: Option<IdRef>,
    #[serde(default)]
    pub group: Option<IdRef>,
    /// Per-board column schema; never interpreted here
    #[serde(default)]
    pub column_values: Option<Value>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemRow {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub state: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub creator_id: Option<i64>,
    pub board_id: Option<i64>,
    pub group_id: Option<String>,
    pub column_values: Option<String>,
    pub url: Option<String>,
}

impl Item {
    pub fn into_record(self) -> Record {
        let board_id = self
            .board
            .and_then(|b| b.id)
            .and_then(|id| to_long(&Value::String(id)));

        let column_values = match self.column_values {
            None | Some(Value::Null) => None,
            Some(Value::Array(ref a)) if a.is_empty() => None,
            Some(other) => Some(other.to_string()),
        };

        let out = ItemRow {
            id: self.id,
            name: self.name,
            state: self.state,
            created_at: self.created_at,
            updated_at: self.updated_at,
            creator_id: self.creator_id,
            board_id,
            group_id: self.group.and_then(|g| g.id),
            column_values,
            url: self.url,
        };

        Record {
            object_type: ObjectType::Items,
            id: id_string(out.id),
            parent_id: out.board_id.map(|b| b.to_string()),
            row: row(&out),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct User {
    #[serde(default, deserialize_with = "de_long")]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub is_admin: Option<bool>,
    #[serde(default)]
    pub is_guest: Option<bool>,
    #[serde(default)]
    pub is_view_only: Option<bool>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub mobile_phone: Option<String>,
    #[serde(default)]
    pub time_zone_identifier: Option<String>,
}

impl User {
    pub fn into_record(self) -> Record {
        Record {
            object_type: ObjectType::Users,
            id: id_string(self.id),
            parent_id: None,
            row: row(&self),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Workspace {
    #[serde(default, deserialize_with = "de_long")]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub is_default_workspace: Option<bool>,
}

impl Workspace {
    pub fn into_record(self) -> Record {
        Record {
            object_type: ObjectType::Workspaces,
            id: id_string(self.id),
            parent_id: None,
            row: row(&self),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Team {
    #[serde(default, deserialize_with = "de_long")]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture_url: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub owners: Vec<IdRef>,
    #[serde(default, deserialize_with = "null_default")]
    pub users: Vec<IdRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeamRow {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub picture_url: Option<String>,
    /// JSON array of user ids
    pub owner_ids: String,
    pub member_ids: String,
}

fn id_array(refs: &[IdRef]) -> String {
    let ids: Vec<i64> = refs
        .iter()
        .filter_map(|r| r.id.as_deref())
        .filter_map(|id| id.trim().parse().ok())
        .collect();
    Value::from(ids).to_string()
}

impl Team {
    pub fn into_record(self) -> Record {
        let out = TeamRow {
            id: self.id,
            name: self.name,
            picture_url: self.picture_url,
            owner_ids: id_array(&self.owners),
            member_ids: id_array(&self.users),
        };
        Record {
            object_type: ObjectType::Teams,
            id: id_string(out.id),
            parent_id: None,
            row: row(&out),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Group {
    /// Group ids are strings such as "topics"
    #[serde(default, deserialize_with = "de_opt_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub archived: Option<bool>,
    #[serde(default)]
    pub deleted: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupRow {
    pub id: Option<String>,
    pub title: Option<String>,
    pub color: Option<String>,
    pub position: Option<String>,
    pub archived: Option<bool>,
    pub deleted: Option<bool>,
    pub board_id: Option<i64>,
}

impl Group {
    pub fn into_record(self, board_id: &str) -> Record {
        let out = GroupRow {
            id: self.id,
            title: self.title,
            color: self.color,
            position: self.position,
            archived: self.archived,
            deleted: self.deleted,
            board_id: board_id.trim().parse().ok(),
        };
        Record {
            object_type: ObjectType::Groups,
            id: out.id.clone().unwrap_or_default(),
            parent_id: Some(board_id.to_string()),
            row: row(&out),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tag {
    #[serde(default, deserialize_with = "de_long")]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagRow {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub color: Option<String>,
    pub board_id: Option<i64>,
}

impl Tag {
    pub fn into_record(self, board_id: &str) -> Record {
        let out = TagRow {
            id: self.id,
            name: self.name,
            color: self.color,
            board_id: board_id.trim().parse().ok(),
        };
        Record {
            object_type: ObjectType::Tags,
            id: id_string(out.id),
            parent_id: Some(board_id.to_string()),
            row: row(&out),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Update {
    #[serde(default, deserialize_with = "de_long")]
    pub id: Option<i64>,
    /// HTML body
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub text_body: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default, deserialize_with = "de_long")]
    pub creator_id: Option<i64>,
    #[serde(default, deserialize_with = "de_long")]
    pub item_id: Option<i64>,
}

impl Update {
    pub fn into_record(self) -> Record {
        Record {
            object_type: ObjectType::Updates,
            id: id_string(self.id),
            parent_id: self.item_id.map(|i| i.to_string()),
            row: row(&self),
        }
    }
}

/// Raw activity-log entry as returned under `boards { activity_logs }`.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivityLogEntry {
    #[serde(default, deserialize_with = "de_opt_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub entity: Option<String>,
    /// JSON document serialized as a string
    #[serde(default, deserialize_with = "de_opt_string")]
    pub data: Option<String>,
    #[serde(default, deserialize_with = "de_long")]
    pub user_id: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub account_id: Option<String>,
    /// 17-digit epoch value
    #[serde(default, deserialize_with = "de_opt_string")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityLogRow {
    pub id: Option<String>,
    pub event: Option<String>,
    pub entity: Option<String>,
    pub data: Option<String>,
    pub user_id: Option<i64>,
    pub account_id: Option<String>,
    pub created_at: String,
    pub board_id: Option<i64>,
}

impl ActivityLogEntry {
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.created_at.as_deref().and_then(parse_activity_timestamp)
    }

    /// Changed item id carried in the entry's `data` document.
    pub fn item_id(&self) -> Option<String> {
        let data: Value = serde_json::from_str(self.data.as_deref()?).ok()?;
        ["pulse_id", "item_id", "id", "pulseId", "itemId"]
            .iter()
            .find_map(|key| data.get(*key))
            .and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    pub fn into_record(self, board_id: &str) -> Record {
        let out = ActivityLogRow {
            created_at: format_activity_timestamp(self.created_at.as_deref().unwrap_or("0")),
            id: self.id,
            event: self.event,
            entity: self.entity,
            data: self.data,
            user_id: self.user_id,
            account_id: self.account_id,
            board_id: board_id.trim().parse().ok(),
        };
        Record {
            object_type: ObjectType::ActivityLogs,
            id: out.id.clone().unwrap_or_default(),
            parent_id: Some(board_id.to_string()),
            row: row(&out),
        }
    }
}

// Response envelopes

#[derive(Debug, Default, Deserialize)]
pub struct BoardsData {
    #[serde(default, deserialize_with = "null_default")]
    pub boards: Vec<Board>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BoardIdsData {
    #[serde(default, deserialize_with = "null_default")]
    pub boards: Vec<IdRef>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ItemsData {
    #[serde(default, deserialize_with = "null_default")]
    pub items: Vec<Item>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ItemsPage {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub items: Vec<Item>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BoardItemsPage {
    #[serde(default)]
    pub items_page: Option<ItemsPage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BoardItemsPageData {
    #[serde(default, deserialize_with = "null_default")]
    pub boards: Vec<BoardItemsPage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NextItemsPageData {
    #[serde(default)]
    pub next_items_page: Option<ItemsPage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UsersData {
    #[serde(default, deserialize_with = "null_default")]
    pub users: Vec<User>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WorkspacesData {
    #[serde(default, deserialize_with = "null_default")]
    pub workspaces: Vec<Workspace>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TeamsData {
    #[serde(default, deserialize_with = "null_default")]
    pub teams: Vec<Team>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdatesData {
    #[serde(default, deserialize_with = "null_default")]
    pub updates: Vec<Update>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BoardGroups {
    #[serde(default, deserialize_with = "de_opt_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub groups: Vec<Group>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BoardGroupsData {
    #[serde(default, deserialize_with = "null_default")]
    pub boards: Vec<BoardGroups>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BoardTags {
    #[serde(default, deserialize_with = "de_opt_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BoardTagsData {
    #[serde(default, deserialize_with = "null_default")]
    pub boards: Vec<BoardTags>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BoardLogs {
    #[serde(default, deserialize_with = "de_opt_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub activity_logs: Vec<ActivityLogEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BoardLogsData {
    #[serde(default, deserialize_with = "null_default")]
    pub boards: Vec<BoardLogs>,
}
