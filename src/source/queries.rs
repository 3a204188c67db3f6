// ABOUTME: GraphQL documents sent to the Monday API
// ABOUTME: Field selections match the output rows in models.rs

const BOARD_FIELDS: &str = "id name description state board_kind workspace_id created_at updated_at url items_count permissions";

const ITEM_FIELDS: &str =
    "id name state created_at updated_at creator_id board { id } group { id } column_values { id text value } url";

pub fn boards_page() -> String {
    format!(
        "query($limit: Int, $page: Int, $state: State) {{ boards(limit: $limit, page: $page, state: $state) {{ {} }} }}",
        BOARD_FIELDS
    )
}

pub fn boards_by_ids() -> String {
    format!(
        "query($boardIds: [ID!], $limit: Int, $state: State) {{ boards(ids: $boardIds, limit: $limit, state: $state) {{ {} }} }}",
        BOARD_FIELDS
    )
}

pub const DISCOVER_BOARDS: &str =
    "query($limit: Int, $page: Int, $state: State) { boards(limit: $limit, page: $page, state: $state) { id } }";

pub fn items_first_page() -> String {
    format!(
        "query($boardIds: [ID!], $limit: Int) {{ boards(ids: $boardIds) {{ items_page(limit: $limit) {{ cursor items {{ {} }} }} }} }}",
        ITEM_FIELDS
    )
}

pub fn items_next_page() -> String {
    format!(
        "query($cursor: String!, $limit: Int!) {{ next_items_page(cursor: $cursor, limit: $limit) {{ cursor items {{ {} }} }} }}",
        ITEM_FIELDS
    )
}

pub fn items_by_ids() -> String {
    format!(
        "query($itemIds: [ID!], $limit: Int) {{ items(ids: $itemIds, limit: $limit) {{ {} }} }}",
        ITEM_FIELDS
    )
}

pub const USERS_PAGE: &str = "query($limit: Int, $page: Int, $kind: UserKind) { users(limit: $limit, page: $page, kind: $kind) { id name email enabled url created_at is_admin is_guest is_view_only title location phone mobile_phone time_zone_identifier } }";

pub const WORKSPACES_PAGE: &str = "query($limit: Int, $page: Int, $state: State, $kind: WorkspaceKind) { workspaces(limit: $limit, page: $page, state: $state, kind: $kind) { id name description kind state created_at is_default_workspace } }";

/// The teams listing takes no paging arguments.
pub const TEAMS: &str = "query { teams { id name picture_url owners { id } users { id } } }";

pub const UPDATES_PAGE: &str = "query($limit: Int, $page: Int) { updates(limit: $limit, page: $page) { id body text_body created_at updated_at creator_id item_id } }";

pub const BOARD_GROUPS: &str =
    "query($boardIds: [ID!]) { boards(ids: $boardIds) { id groups { id title color position archived deleted } } }";

pub const BOARD_TAGS: &str =
    "query($boardIds: [ID!]) { boards(ids: $boardIds) { id tags { id name color } } }";

pub const BOARD_ACTIVITY_LOGS: &str = "query($boardIds: [ID!], $limit: Int) { boards(ids: $boardIds) { id activity_logs(limit: $limit) { id event entity data user_id account_id created_at } } }";

/// Activity log page for a single board, filtered from an instant.
pub const ACTIVITY_LOG_SINCE: &str = "query($boardIds: [ID!], $from: ISO8601DateTime, $limit: Int, $page: Int) { boards(ids: $boardIds) { id activity_logs(from: $from, limit: $limit, page: $page) { id event entity data created_at } } }";
