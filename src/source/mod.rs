// ABOUTME: Monday object source built on the request client and pager
// ABOUTME: Snapshot listings, fetch-by-id for changed entities, board discovery and activity-log pages

pub mod models;
pub mod objects;
pub mod queries;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use crate::config::ObjectOptions;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::pager::{cursor_based, page_based, restart_on_expiry, CursorPage, DEFAULT_CURSOR_VALIDITY};
use crate::remote::RequestClient;

use models::{
    ActivityLogEntry, Board, BoardGroupsData, BoardIdsData, BoardItemsPageData, BoardLogsData,
    BoardTagsData, BoardsData, Item, ItemsData, ItemsPage, NextItemsPageData, TeamsData, Update,
    UpdatesData, User, UsersData, Workspace, WorkspacesData,
};
pub use objects::{IngestionType, ObjectType, Record};

/// Boards per request when listing groups and tags.
const BOARD_BATCH_SIZE: usize = 25;
/// Boards per request when listing activity logs.
const LOG_BOARD_BATCH_SIZE: usize = 10;
/// Page size of the board discovery listing.
const DISCOVERY_PAGE_SIZE: usize = 100;
/// A cursor sequence is re-opened at most this many times per board.
const MAX_CURSOR_RESTARTS: u32 = 1;

#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Concurrent requests within one run (boards, id batches)
    pub workers: usize,
    pub cursor_validity: Duration,
    /// Entries per activity-log request
    pub activity_log_limit: usize,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            cursor_validity: DEFAULT_CURSOR_VALIDITY,
            activity_log_limit: 1000,
        }
    }
}

pub struct MondaySource {
    client: RequestClient,
    settings: SourceSettings,
}

impl MondaySource {
    pub fn new(client: RequestClient, settings: SourceSettings) -> Self {
        Self { client, settings }
    }

    pub fn client(&self) -> &RequestClient {
        &self.client
    }

    pub fn settings(&self) -> &SourceSettings {
        &self.settings
    }

    fn workers(&self) -> usize {
        self.settings.workers.max(1)
    }

    async fn query<T: DeserializeOwned>(&self, query: &str, variables: Value) -> SyncResult<T> {
        let data = self.client.execute(query, variables).await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Ids of every active board in the account.
    pub async fn discover_board_ids(&self) -> SyncResult<Vec<String>> {
        self.list_board_ids("active").await
    }

    /// Ids of every board in `state` (`active`, `archived`, `deleted` or `all`).
    pub async fn list_board_ids(&self, state: &str) -> SyncResult<Vec<String>> {
        let ids: Vec<Option<String>> = page_based(
            move |page| async move {
                let data: BoardIdsData = self
                    .query(
                        queries::DISCOVER_BOARDS,
                        json!({"limit": DISCOVERY_PAGE_SIZE, "page": page, "state": state}),
                    )
                    .await?;
                Ok(data.boards.into_iter().map(|b| b.id).collect())
            },
            DISCOVERY_PAGE_SIZE,
        )
        .try_collect()
        .await?;

        let ids: Vec<String> = ids.into_iter().flatten().collect();
        tracing::info!("Discovered {} board(s) in state '{}'", ids.len(), state);
        Ok(ids)
    }

    /// Configured board ids, or every active board when none are configured.
    pub async fn resolve_board_ids(&self, options: &ObjectOptions) -> SyncResult<Vec<String>> {
        match &options.board_ids {
            Some(ids) if !ids.is_empty() => Ok(ids.clone()),
            _ => self.discover_board_ids().await,
        }
    }

    /// Every record of `object`. `boards` is only consulted for board-scoped objects.
    pub fn snapshot<'a>(
        &'a self,
        object: ObjectType,
        options: &ObjectOptions,
        boards: &'a [String],
    ) -> BoxStream<'a, SyncResult<Record>> {
        let page_size = options.page_size_for(object);
        let mut filters = Map::new();
        if let Some(state) = options.state_for(object) {
            filters.insert("state".into(), Value::String(state));
        }
        if let Some(kind) = options.kind_for(object) {
            filters.insert("kind".into(), Value::String(kind));
        }

        match object {
            ObjectType::Boards => self.page_listing(
                queries::boards_page(),
                filters,
                page_size,
                |d: BoardsData| d.boards.into_iter().map(Board::into_record).collect(),
            ),
            ObjectType::Users => self.page_listing(
                queries::USERS_PAGE.to_string(),
                filters,
                page_size,
                |d: UsersData| d.users.into_iter().map(User::into_record).collect(),
            ),
            ObjectType::Workspaces => self.page_listing(
                queries::WORKSPACES_PAGE.to_string(),
                filters,
                page_size,
                |d: WorkspacesData| d.workspaces.into_iter().map(Workspace::into_record).collect(),
            ),
            ObjectType::Updates => self.page_listing(
                queries::UPDATES_PAGE.to_string(),
                Map::new(),
                page_size,
                |d: UpdatesData| d.updates.into_iter().map(Update::into_record).collect(),
            ),
            ObjectType::Teams => stream::once(async move {
                let data: TeamsData = self.query(queries::TEAMS, json!({})).await?;
                let records: Vec<SyncResult<Record>> =
                    data.teams.into_iter().map(|t| Ok(t.into_record())).collect();
                Ok::<_, SyncError>(stream::iter(records))
            })
            .try_flatten()
            .boxed(),
            ObjectType::Items => self.items_snapshot(boards, page_size),
            ObjectType::Groups => self.board_batches(
                queries::BOARD_GROUPS,
                boards,
                BOARD_BATCH_SIZE,
                Map::new(),
                |d: BoardGroupsData| {
                    d.boards
                        .into_iter()
                        .flat_map(|b| {
                            let board_id = b.id.unwrap_or_default();
                            b.groups
                                .into_iter()
                                .map(move |g| g.into_record(&board_id))
                                .collect::<Vec<_>>()
                        })
                        .collect()
                },
            ),
            ObjectType::Tags => self.board_batches(
                queries::BOARD_TAGS,
                boards,
                BOARD_BATCH_SIZE,
                Map::new(),
                |d: BoardTagsData| {
                    d.boards
                        .into_iter()
                        .flat_map(|b| {
                            let board_id = b.id.unwrap_or_default();
                            b.tags
                                .into_iter()
                                .map(move |t| t.into_record(&board_id))
                                .collect::<Vec<_>>()
                        })
                        .collect()
                },
            ),
            ObjectType::ActivityLogs => {
                let mut extra = Map::new();
                extra.insert("limit".into(), json!(self.settings.activity_log_limit));
                self.board_batches(
                    queries::BOARD_ACTIVITY_LOGS,
                    boards,
                    LOG_BOARD_BATCH_SIZE,
                    extra,
                    |d: BoardLogsData| {
                        d.boards
                            .into_iter()
                            .flat_map(|b| {
                                let board_id = b.id.unwrap_or_default();
                                b.activity_logs
                                    .into_iter()
                                    .map(move |l| l.into_record(&board_id))
                                    .collect::<Vec<_>>()
                            })
                            .collect()
                    },
                )
            }
        }
    }

    fn page_listing<'a, E, F>(
        &'a self,
        query: String,
        filters: Map<String, Value>,
        page_size: usize,
        into_records: F,
    ) -> BoxStream<'a, SyncResult<Record>>
    where
        E: DeserializeOwned + Send + 'a,
        F: Fn(E) -> Vec<Record> + Copy + Send + Sync + 'a,
    {
        let query: Arc<str> = query.into();
        page_based(
            move |page| {
                let query = query.clone();
                let mut variables = filters.clone();
                variables.insert("limit".into(), json!(page_size));
                variables.insert("page".into(), json!(page));
                async move {
                    let data: E = self.query(&query, Value::Object(variables)).await?;
                    Ok(into_records(data))
                }
            },
            page_size,
        )
        .boxed()
    }

    /// Board-nested listings, a batch of boards per request. Batches run
    /// concurrently up to the worker count; output order follows the batches.
    fn board_batches<'a, E, F>(
        &'a self,
        query: &'static str,
        boards: &'a [String],
        batch_size: usize,
        extra: Map<String, Value>,
        into_records: F,
    ) -> BoxStream<'a, SyncResult<Record>>
    where
        E: DeserializeOwned + Send + 'a,
        F: Fn(E) -> Vec<Record> + Copy + Send + Sync + 'a,
    {
        stream::iter(boards.chunks(batch_size.max(1)))
            .map(move |chunk| {
                self.board_batch::<E, F>(query, chunk.to_vec(), extra.clone(), into_records)
            })
            .buffered(self.workers())
            .map_ok(|records| stream::iter(records.into_iter().map(Ok::<Record, SyncError>)))
            .try_flatten()
            .boxed()
    }

    /// One batch of a board-nested listing. A permanent rejection is narrowed
    /// down by halving the batch until the offending board is skipped alone.
    fn board_batch<'a, E, F>(
        &'a self,
        query: &'static str,
        boards: Vec<String>,
        extra: Map<String, Value>,
        into_records: F,
    ) -> BoxFuture<'a, SyncResult<Vec<Record>>>
    where
        E: DeserializeOwned + Send + 'a,
        F: Fn(E) -> Vec<Record> + Copy + Send + Sync + 'a,
    {
        async move {
            let mut variables = extra.clone();
            variables.insert("boardIds".into(), json!(boards));
            match self.query::<E>(query, Value::Object(variables)).await {
                Ok(data) => Ok(into_records(data)),
                Err(SyncError::PartialData {
                    permanent: true,
                    errors,
                    ..
                }) => {
                    if boards.len() == 1 {
                        tracing::warn!(
                            "Skipping board {} rejected by the remote: {}",
                            boards[0],
                            describe(&errors)
                        );
                        return Ok(Vec::new());
                    }
                    let (left, right) = boards.split_at(boards.len() / 2);
                    let mut records = self
                        .board_batch::<E, F>(query, left.to_vec(), extra.clone(), into_records)
                        .await?;
                    records.extend(
                        self.board_batch::<E, F>(query, right.to_vec(), extra, into_records)
                            .await?,
                    );
                    Ok(records)
                }
                Err(e) => Err(e),
            }
        }
        .boxed()
    }

    fn items_snapshot<'a>(
        &'a self,
        boards: &'a [String],
        page_size: usize,
    ) -> BoxStream<'a, SyncResult<Record>> {
        stream::iter(boards.iter().cloned())
            .map(move |board_id| self.board_items(board_id, page_size))
            .flatten_unordered(self.workers())
            .boxed()
    }

    /// Items of one board through `items_page` then `next_items_page`.
    /// An expired cursor re-opens the sequence from the first page once.
    fn board_items(&self, board_id: String, page_size: usize) -> BoxStream<'_, SyncResult<Record>> {
        let validity = self.settings.cursor_validity;
        tracing::debug!("Reading items of board {}", board_id);

        restart_on_expiry(
            move || {
                let board_id = board_id.clone();
                cursor_based(
                    move || async move {
                        let data: BoardItemsPageData = self
                            .query(
                                &queries::items_first_page(),
                                json!({"boardIds": [board_id], "limit": page_size}),
                            )
                            .await?;
                        let page = data
                            .boards
                            .into_iter()
                            .next()
                            .and_then(|b| b.items_page)
                            .unwrap_or_default();
                        Ok(items_page_records(page))
                    },
                    move |cursor| async move {
                        let data: NextItemsPageData = self
                            .query(
                                &queries::items_next_page(),
                                json!({"cursor": cursor, "limit": page_size}),
                            )
                            .await?;
                        Ok(items_page_records(data.next_items_page.unwrap_or_default()))
                    },
                    validity,
                )
            },
            MAX_CURSOR_RESTARTS,
        )
        .boxed()
    }

    /// Current records for exactly `ids`, batched by the object's page size.
    /// The object's state filter applies, so archived boards come back too.
    ///
    /// Ids the remote no longer returns (deleted or inaccessible) are simply
    /// absent from the output; the caller accounts for them.
    pub fn fetch_by_ids<'a>(
        &'a self,
        object: ObjectType,
        ids: Vec<String>,
        options: &ObjectOptions,
    ) -> BoxStream<'a, SyncResult<Record>> {
        let state = options.state_for(object);
        let batches: Vec<Vec<String>> = ids
            .chunks(options.page_size_for(object).max(1))
            .map(|chunk| chunk.to_vec())
            .collect();

        stream::iter(batches)
            .map(move |batch| self.fetch_batch(object, batch, state.clone()))
            .buffered(self.workers())
            .map_ok(|records| stream::iter(records.into_iter().map(Ok::<Record, SyncError>)))
            .try_flatten()
            .boxed()
    }

    fn fetch_batch(
        &self,
        object: ObjectType,
        ids: Vec<String>,
        state: Option<String>,
    ) -> BoxFuture<'_, SyncResult<Vec<Record>>> {
        async move {
            let (query, variables) = match object {
                ObjectType::Boards => (
                    queries::boards_by_ids(),
                    json!({"boardIds": ids, "limit": ids.len(), "state": state}),
                ),
                ObjectType::Items => (
                    queries::items_by_ids(),
                    json!({"itemIds": ids, "limit": ids.len()}),
                ),
                other => {
                    return Err(SyncError::fatal(
                        "UNSUPPORTED_OBJECT",
                        format!("{} cannot be fetched by id", other),
                    ))
                }
            };

            match self.client.execute(&query, variables).await {
                Ok(data) => decode_by_ids(object, data),
                Err(SyncError::PartialData {
                    permanent: true,
                    data: Some(data),
                    errors,
                }) => {
                    tracing::warn!(
                        "Remote rejected part of a {} batch, keeping returned records: {}",
                        object,
                        describe(&errors)
                    );
                    decode_by_ids(object, data)
                }
                Err(SyncError::PartialData {
                    permanent: true,
                    errors,
                    ..
                }) => {
                    if ids.len() == 1 {
                        tracing::warn!("Skipping {} {}: {}", object, ids[0], describe(&errors));
                        return Ok(Vec::new());
                    }
                    // Narrow down to the offending id(s)
                    let (left, right) = ids.split_at(ids.len() / 2);
                    let mut records = self
                        .fetch_batch(object, left.to_vec(), state.clone())
                        .await?;
                    records.extend(self.fetch_batch(object, right.to_vec(), state).await?);
                    Ok(records)
                }
                Err(e) => Err(e),
            }
        }
        .boxed()
    }

    /// One page of a board's activity log starting at `from` (inclusive).
    pub async fn activity_log_page(
        &self,
        board_id: &str,
        from: DateTime<Utc>,
        page: u32,
        limit: usize,
    ) -> SyncResult<Vec<ActivityLogEntry>> {
        let data: BoardLogsData = self
            .query(
                queries::ACTIVITY_LOG_SINCE,
                json!({
                    "boardIds": [board_id],
                    "from": from.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                    "limit": limit,
                    "page": page,
                }),
            )
            .await?;

        Ok(data
            .boards
            .into_iter()
            .flat_map(|b| b.activity_logs)
            .collect())
    }
}

fn describe(errors: &[RemoteError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn items_page_records(page: ItemsPage) -> CursorPage<Record> {
    CursorPage {
        items: page.items.into_iter().map(Item::into_record).collect(),
        cursor: page.cursor,
    }
}

fn decode_by_ids(object: ObjectType, data: Value) -> SyncResult<Vec<Record>> {
    Ok(match object {
        ObjectType::Boards => serde_json::from_value::<BoardsData>(data)?
            .boards
            .into_iter()
            .map(Board::into_record)
            .collect(),
        _ => serde_json::from_value::<ItemsData>(data)?
            .items
            .into_iter()
            .map(Item::into_record)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{BackoffPolicy, GraphqlRequest, HttpReply, Transport};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers each request with a closure over (query, variables).
    struct Routed {
        route: Box<dyn Fn(&str, &Value) -> HttpReply + Send + Sync>,
        seen: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Transport for Routed {
        async fn post(&self, request: &GraphqlRequest<'_>) -> SyncResult<HttpReply> {
            let variables = request.variables.cloned().unwrap_or(Value::Null);
            self.seen.lock().unwrap().push(variables.clone());
            Ok((self.route)(request.query, &variables))
        }
    }

    fn source(
        route: impl Fn(&str, &Value) -> HttpReply + Send + Sync + 'static,
    ) -> (MondaySource, Arc<Routed>) {
        let transport = Arc::new(Routed {
            route: Box::new(route),
            seen: Mutex::new(Vec::new()),
        });
        let client = RequestClient::new(transport.clone(), BackoffPolicy::default());
        (MondaySource::new(client, SourceSettings::default()), transport)
    }

    fn ok(data: Value) -> HttpReply {
        HttpReply::ok(json!({ "data": data }).to_string())
    }

    #[tokio::test]
    async fn test_discover_boards_pages_until_short() {
        let (source, transport) = source(|_, vars| {
            let page = vars["page"].as_u64().unwrap();
            let count = if page == 1 { 100 } else { 3 };
            let boards: Vec<Value> = (0..count)
                .map(|i| json!({"id": format!("{}", page * 1000 + i)}))
                .collect();
            ok(json!({ "boards": boards }))
        });

        let ids = source.discover_board_ids().await.unwrap();
        assert_eq!(ids.len(), 103);
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["state"], "active");
    }

    #[tokio::test]
    async fn test_users_snapshot_passes_kind_filter() {
        let (source, transport) = source(|_, _| {
            ok(json!({"users": [{"id": "1", "name": "Ada"}, {"id": "2", "name": "Linus"}]}))
        });
        let options = ObjectOptions::default();
        let records: Vec<Record> = source
            .snapshot(ObjectType::Users, &options, &[])
            .try_collect()
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0]["kind"], "all");
        assert_eq!(seen[0]["limit"], 50);
        assert_eq!(seen[0]["page"], 1);
    }

    #[tokio::test]
    async fn test_items_snapshot_follows_cursor_per_board() {
        let (source, _transport) = source(|query, vars| {
            if query.contains("next_items_page") {
                assert_eq!(vars["cursor"], format!("c-{}", "42"));
                ok(json!({"next_items_page": {"cursor": null, "items": [{"id": "3", "board": {"id": "42"}}]}}))
            } else {
                let board = vars["boardIds"][0].as_str().unwrap().to_string();
                let cursor = if board == "42" { json!("c-42") } else { Value::Null };
                ok(json!({"boards": [{"items_page": {"cursor": cursor, "items": [
                    {"id": format!("{}1", board), "board": {"id": &board}},
                    {"id": format!("{}2", board), "board": {"id": &board}}
                ]}}]}))
            }
        });
        let boards = vec!["42".to_string(), "77".to_string()];
        let options = ObjectOptions::default();
        let mut ids: Vec<String> = source
            .snapshot(ObjectType::Items, &options, &boards)
            .map_ok(|r| r.id)
            .try_collect()
            .await
            .unwrap();
        ids.sort();
        assert_eq!(ids, vec!["3", "421", "422", "771", "772"]);
    }

    #[tokio::test]
    async fn test_groups_batched_by_25_boards() {
        let (source, transport) = source(|_, vars| {
            let boards: Vec<Value> = vars["boardIds"]
                .as_array()
                .unwrap()
                .iter()
                .map(|id| json!({"id": id, "groups": [{"id": "topics", "title": "Topics"}]}))
                .collect();
            ok(json!({ "boards": boards }))
        });
        let boards: Vec<String> = (1..=30).map(|i| i.to_string()).collect();
        let options = ObjectOptions::default();
        let records: Vec<Record> = source
            .snapshot(ObjectType::Groups, &options, &boards)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(records.len(), 30);
        assert_eq!(records[0].key(), "1:topics");
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["boardIds"].as_array().unwrap().len(), 25);
    }

    #[tokio::test]
    async fn test_groups_skip_only_the_rejected_board() {
        let (source, transport) = source(|_, vars| {
            let ids: Vec<String> = vars["boardIds"]
                .as_array()
                .unwrap()
                .iter()
                .map(|v| v.as_str().unwrap().to_string())
                .collect();
            if ids.iter().any(|id| id == "13") {
                return HttpReply::ok(
                    json!({"data": null, "errors": [{"message": "no access to board 13",
                        "extensions": {"code": "UserUnauthorizedException"}}]})
                    .to_string(),
                );
            }
            let boards: Vec<Value> = ids
                .iter()
                .map(|id| json!({"id": id, "groups": [{"id": "topics", "title": "Topics"}]}))
                .collect();
            ok(json!({ "boards": boards }))
        });
        let boards: Vec<String> = (1..=30).map(|i| i.to_string()).collect();
        let options = ObjectOptions::default();
        let records: Vec<Record> = source
            .snapshot(ObjectType::Groups, &options, &boards)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(records.len(), 29);
        assert!(records.iter().all(|r| r.parent_id.as_deref() != Some("13")));
        let seen = transport.seen.lock().unwrap();
        assert!(seen.iter().any(|v| v["boardIds"] == json!(["13"])));
    }

    #[tokio::test]
    async fn test_fetch_by_ids_bisects_permanent_rejection() {
        let (source, _transport) = source(|_, vars| {
            let ids: Vec<String> = vars["itemIds"]
                .as_array()
                .unwrap()
                .iter()
                .map(|v| v.as_str().unwrap().to_string())
                .collect();
            if ids.iter().any(|id| id == "13") {
                HttpReply::ok(
                    json!({"data": null, "errors": [{"message": "no access",
                        "extensions": {"code": "UserUnauthorizedException"}}]})
                    .to_string(),
                )
            } else {
                let items: Vec<Value> = ids.iter().map(|id| json!({"id": id})).collect();
                ok(json!({ "items": items }))
            }
        });

        let ids = vec!["11".into(), "12".into(), "13".into(), "14".into()];
        let mut fetched: Vec<String> = source
            .fetch_by_ids(ObjectType::Items, ids, &ObjectOptions::default())
            .map_ok(|r| r.id)
            .try_collect()
            .await
            .unwrap();
        fetched.sort();
        assert_eq!(fetched, vec!["11", "12", "14"]);
    }

    #[tokio::test]
    async fn test_fetch_by_ids_rejects_snapshot_objects() {
        let (source, _transport) = source(|_, _| ok(json!({})));
        let result: SyncResult<Vec<Record>> = source
            .fetch_by_ids(ObjectType::Users, vec!["1".into()], &ObjectOptions::default())
            .try_collect()
            .await;
        assert!(matches!(result, Err(SyncError::Fatal { .. })));
    }
}
