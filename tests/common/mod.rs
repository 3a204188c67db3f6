#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use monday_replicator::clock::FixedClock;
use monday_replicator::planner::{PlannerSettings, SyncPlanner};
use monday_replicator::remote::{BackoffPolicy, GraphqlRequest, HttpReply, RequestClient, Transport};
use monday_replicator::sink::{Emitter, MemorySink};
use monday_replicator::source::{MondaySource, SourceSettings};
use monday_replicator::watermark::MemoryWatermarkStore;
use monday_replicator::SyncResult;
use serde_json::{json, Value};
use tokio::sync::Notify;

pub fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()
}

/// Activity-log timestamp in 10^-7 second units.
pub fn ticks(at: DateTime<Utc>) -> String {
    (at.timestamp() * 10_000_000).to_string()
}

pub fn log_entry(entity: &str, event: &str, data: Value, at: DateTime<Utc>) -> Value {
    json!({
        "id": format!("{}-{}", event, at.timestamp()),
        "event": event,
        "entity": entity,
        "data": data.to_string(),
        "created_at": ticks(at),
    })
}

pub fn item(id: u64, board_id: &str) -> Value {
    json!({
        "id": id.to_string(),
        "name": format!("Item {}", id),
        "state": "active",
        "board": {"id": board_id},
        "group": {"id": "topics"},
        "column_values": [{"id": "status", "text": "Done", "value": "{\"index\":1}"}],
    })
}

pub fn board(id: &str) -> Value {
    json!({"id": id, "name": format!("Board {}", id), "state": "active", "workspace_id": "7"})
}

#[derive(Default)]
pub struct FakeMonday {
    pub boards: Mutex<Vec<Value>>,
    pub items: Mutex<Vec<Value>>,
    pub users: Mutex<Vec<Value>>,
    /// Activity-log entries per board id
    pub logs: Mutex<HashMap<String, Vec<Value>>>,
    /// Replies served before any routing, in order
    pub scripted: Mutex<VecDeque<HttpReply>>,
    /// Number of upcoming `next_items_page` calls answered with an expired cursor
    pub expire_cursors: AtomicU32,
    /// Every request seen: (query, variables)
    pub requests: Mutex<Vec<(String, Value)>>,
    /// Advanced one minute per request when set
    pub clock: Mutex<Option<Arc<FixedClock>>>,
    /// 1-based request number from which every request hangs (0 = never)
    pub stall_at: AtomicU32,
    /// Notified when the first request hangs
    pub stalled: Notify,
}

impl FakeMonday {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_boards(self, ids: &[&str]) -> Self {
        *self.boards.lock().unwrap() = ids.iter().map(|id| board(id)).collect();
        self
    }

    pub fn with_items(self, items: Vec<Value>) -> Self {
        *self.items.lock().unwrap() = items;
        self
    }

    pub fn archive_board(self, id: &str) -> Self {
        for board in self.boards.lock().unwrap().iter_mut() {
            if board["id"] == id {
                board["state"] = json!("archived");
            }
        }
        self
    }

    pub fn with_users(self, count: u64) -> Self {
        *self.users.lock().unwrap() = (1..=count)
            .map(|i| json!({"id": i.to_string(), "name": format!("User {}", i), "email": format!("u{}@example.com", i)}))
            .collect();
        self
    }

    pub fn with_log(self, board_id: &str, entries: Vec<Value>) -> Self {
        self.logs.lock().unwrap().insert(board_id.to_string(), entries);
        self
    }

    pub fn script(&self, reply: HttpReply) {
        self.scripted.lock().unwrap().push_back(reply);
    }

    pub fn requests_matching(&self, needle: &str) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _)| q.contains(needle))
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn route(&self, query: &str, vars: &Value) -> HttpReply {
        if query.contains("next_items_page") {
            if self
                .expire_cursors
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return HttpReply::ok(
                    json!({"errors": [{"message": "cursor has expired", "extensions": {"code": "CursorExpiredError"}}]})
                        .to_string(),
                );
            }
            let cursor = vars["cursor"].as_str().unwrap_or_default();
            let (board_id, offset) = cursor.split_once(':').unwrap();
            let page = self.items_page(board_id, offset.parse().unwrap(), limit(vars));
            return data(json!({ "next_items_page": page }));
        }
        if query.contains("items_page") {
            let board_id = first_id(vars, "boardIds");
            let page = self.items_page(&board_id, 0, limit(vars));
            return data(json!({"boards": [{"id": board_id, "items_page": page}]}));
        }
        if query.contains("activity_logs(from") {
            let board_id = first_id(vars, "boardIds");
            let page = vars["page"].as_u64().unwrap_or(1) as usize;
            let limit = limit(vars);
            let entries: Vec<Value> = self
                .logs
                .lock()
                .unwrap()
                .get(&board_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .skip((page - 1) * limit)
                .take(limit)
                .collect();
            return data(json!({"boards": [{"id": board_id, "activity_logs": entries}]}));
        }
        if query.contains("items(ids") {
            let wanted = ids(vars, "itemIds");
            let items: Vec<Value> = self
                .items
                .lock()
                .unwrap()
                .iter()
                .filter(|i| wanted.contains(&i["id"].as_str().unwrap_or_default().to_string()))
                .cloned()
                .collect();
            return data(json!({ "items": items }));
        }
        if query.contains("boards(ids: $boardIds, limit") {
            let wanted = ids(vars, "boardIds");
            let boards: Vec<Value> = self
                .boards
                .lock()
                .unwrap()
                .iter()
                .filter(|b| wanted.contains(&b["id"].as_str().unwrap_or_default().to_string()))
                .filter(|b| in_state(b, vars))
                .cloned()
                .collect();
            return data(json!({ "boards": boards }));
        }
        if query.contains("boards(limit") {
            let boards: Vec<Value> = self
                .boards
                .lock()
                .unwrap()
                .iter()
                .filter(|b| in_state(b, vars))
                .cloned()
                .collect();
            return data(json!({ "boards": paged(boards, vars) }));
        }
        if query.contains("users(") {
            let users = self.users.lock().unwrap().clone();
            return data(json!({ "users": paged(users, vars) }));
        }
        if query.contains("teams") {
            return data(json!({"teams": [{"id": "1", "name": "Core", "owners": [{"id": "1"}], "users": [{"id": "1"}, {"id": "2"}]}]}));
        }
        data(json!({}))
    }

    fn items_page(&self, board_id: &str, offset: usize, limit: usize) -> Value {
        let board_items: Vec<Value> = self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i["board"]["id"] == board_id)
            .cloned()
            .collect();
        let end = (offset + limit).min(board_items.len());
        let cursor = if end < board_items.len() {
            Value::String(format!("{}:{}", board_id, end))
        } else {
            Value::Null
        };
        let items = board_items[offset.min(end)..end].to_vec();
        json!({"cursor": cursor, "items": items})
    }
}

#[async_trait]
impl Transport for FakeMonday {
    async fn post(&self, request: &GraphqlRequest<'_>) -> SyncResult<HttpReply> {
        let vars = request.variables.cloned().unwrap_or(Value::Null);
        let seen = {
            let mut requests = self.requests.lock().unwrap();
            requests.push((request.query.to_string(), vars.clone()));
            requests.len() as u32
        };
        let stall_at = self.stall_at.load(Ordering::SeqCst);
        if stall_at > 0 && seen >= stall_at {
            self.stalled.notify_one();
            std::future::pending::<()>().await;
        }
        if let Some(clock) = self.clock.lock().unwrap().as_ref() {
            clock.advance(chrono::Duration::minutes(1));
        }
        if let Some(reply) = self.scripted.lock().unwrap().pop_front() {
            return Ok(reply);
        }
        Ok(self.route(request.query, &vars))
    }
}

fn data(payload: Value) -> HttpReply {
    HttpReply::ok(json!({ "data": payload }).to_string())
}

/// The API lists active boards only unless a state is given.
fn in_state(board: &Value, vars: &Value) -> bool {
    match vars["state"].as_str().unwrap_or("active") {
        "all" => true,
        state => board["state"] == state,
    }
}

fn limit(vars: &Value) -> usize {
    vars["limit"].as_u64().unwrap_or(100) as usize
}

fn ids(vars: &Value, key: &str) -> Vec<String> {
    vars[key]
        .as_array()
        .map(|ids| {
            ids.iter()
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn first_id(vars: &Value, key: &str) -> String {
    ids(vars, key).into_iter().next().unwrap_or_default()
}

fn paged(all: Vec<Value>, vars: &Value) -> Vec<Value> {
    let page = vars["page"].as_u64().unwrap_or(1) as usize;
    let limit = limit(vars);
    all.into_iter().skip((page - 1) * limit).take(limit).collect()
}

pub struct Harness {
    pub fake: Arc<FakeMonday>,
    pub clock: Arc<FixedClock>,
    pub store: Arc<MemoryWatermarkStore>,
    pub sink: Arc<MemorySink>,
    pub planner: Arc<SyncPlanner>,
}

pub fn harness(fake: FakeMonday) -> Harness {
    harness_with_sink(fake, MemorySink::new())
}

pub fn harness_with_sink(fake: FakeMonday, sink: MemorySink) -> Harness {
    let fake = Arc::new(fake);
    let clock = Arc::new(FixedClock::new(noon()));
    let store = Arc::new(MemoryWatermarkStore::new());
    let sink = Arc::new(sink);

    let client = RequestClient::new(fake.clone(), BackoffPolicy::default());
    let source = Arc::new(MondaySource::new(client, SourceSettings::default()));
    let emitter: Arc<dyn Emitter> = sink.clone();
    let planner = Arc::new(SyncPlanner::new(
        source,
        store.clone(),
        emitter,
        clock.clone(),
        PlannerSettings::default(),
    ));

    Harness {
        fake,
        clock,
        store,
        sink,
        planner,
    }
}
