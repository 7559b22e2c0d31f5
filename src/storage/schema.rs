//! Database schema constants and SQL queries.
//!
//! Both backends share one table layout. SQLite statements use `?N`
//! placeholders and PostgreSQL statements use `$N`; the column order of every
//! statement matches `TaskRow` and the bind macros in `row.rs`.
//!
//! The partial unique index on `status = 'running'` is the last line of defence
//! for the single running task rule: a second running row fails to commit even
//! if a caller bypassed the transaction lock.

/// Columns selected for every task query, in `TaskRow` order.
pub const TASK_COLUMNS: &str = "id, ecosystem, package_name, package_version, mode, \
     local_artifact, purl, status, priority, queued_at, queue_position, started_at, \
     completed_at, last_heartbeat, container_id, duration_seconds, report, download_url, \
     error_message, error_category, error_details, retry_count, max_retries, \
     timeout_minutes, created_at";

/// SQLite statements.
pub mod sqlite {
    pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS analysis_tasks (
    seq              INTEGER PRIMARY KEY AUTOINCREMENT,
    id               BLOB    NOT NULL UNIQUE,

    -- Request descriptor
    ecosystem        TEXT    NOT NULL,
    package_name     TEXT    NOT NULL,
    package_version  TEXT,
    mode             TEXT    NOT NULL DEFAULT 'dynamic',
    local_artifact   TEXT,
    purl             TEXT,

    -- Scheduling
    status           TEXT    NOT NULL DEFAULT 'queued',
    priority         INTEGER NOT NULL DEFAULT 0,
    queued_at        TEXT    NOT NULL,
    queue_position   INTEGER,

    -- Execution
    started_at       TEXT,
    completed_at     TEXT,
    last_heartbeat   TEXT,
    container_id     TEXT,
    duration_seconds REAL,

    -- Outcome
    report           TEXT,
    download_url     TEXT,
    error_message    TEXT,
    error_category   TEXT,
    error_details    TEXT,

    -- Retry bookkeeping
    retry_count      INTEGER NOT NULL DEFAULT 0,
    max_retries      INTEGER NOT NULL DEFAULT 1,
    timeout_minutes  INTEGER NOT NULL DEFAULT 30,

    created_at       TEXT    NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_analysis_tasks_single_running
    ON analysis_tasks(status) WHERE status = 'running';
CREATE INDEX IF NOT EXISTS idx_analysis_tasks_queue
    ON analysis_tasks(status, priority DESC, queued_at ASC, seq ASC);
CREATE INDEX IF NOT EXISTS idx_analysis_tasks_purl
    ON analysis_tasks(purl, status, completed_at);
CREATE INDEX IF NOT EXISTS idx_analysis_tasks_completed_at
    ON analysis_tasks(status, completed_at);
"#;

    pub const INSERT_TASK: &str = r#"
INSERT INTO analysis_tasks (
    id, ecosystem, package_name, package_version, mode, local_artifact, purl,
    status, priority, queued_at, queue_position, started_at, completed_at,
    last_heartbeat, container_id, duration_seconds, report, download_url,
    error_message, error_category, error_details, retry_count, max_retries,
    timeout_minutes, created_at
) VALUES (
    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
    ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25
)
"#;

    pub const UPDATE_TASK: &str = r#"
UPDATE analysis_tasks SET
    status = ?2, priority = ?3, queued_at = ?4, queue_position = ?5,
    started_at = ?6, completed_at = ?7, last_heartbeat = ?8, container_id = ?9,
    duration_seconds = ?10, report = ?11, download_url = ?12, error_message = ?13,
    error_category = ?14, error_details = ?15, retry_count = ?16,
    max_retries = ?17, timeout_minutes = ?18
WHERE id = ?1
"#;

    pub const SET_QUEUE_POSITION: &str =
        "UPDATE analysis_tasks SET queue_position = ?2 WHERE id = ?1";

    pub const SELECT_BY_ID: &str = "SELECT {columns} FROM analysis_tasks WHERE id = ?1";

    pub const SELECT_RUNNING: &str =
        "SELECT {columns} FROM analysis_tasks WHERE status = 'running' ORDER BY started_at ASC";

    pub const SELECT_QUEUED_ORDERED: &str = "SELECT {columns} FROM analysis_tasks \
         WHERE status = 'queued' ORDER BY priority DESC, queued_at ASC, seq ASC";

    pub const SELECT_RETRYABLE: &str = "SELECT {columns} FROM analysis_tasks \
         WHERE status = 'failed' AND retry_count < max_retries ORDER BY completed_at ASC";

    pub const SELECT_COMPLETED_BY_PURL: &str = "SELECT {columns} FROM analysis_tasks \
         WHERE purl = ?1 AND id <> ?2 AND status = 'completed' AND report IS NOT NULL \
         ORDER BY completed_at DESC, seq DESC LIMIT 1";

    pub const SELECT_LIST: &str = "SELECT {columns} FROM analysis_tasks \
         WHERE (?1 IS NULL OR status = ?1) ORDER BY seq DESC LIMIT ?2";

    pub const DELETE_OLDER_THAN: &str =
        "DELETE FROM analysis_tasks WHERE status = ?1 AND completed_at < ?2";
}

/// PostgreSQL statements.
pub mod postgres {
    pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS analysis_tasks (
    id               UUID PRIMARY KEY,
    seq              BIGSERIAL NOT NULL,
    ecosystem        VARCHAR(32)  NOT NULL,
    package_name     VARCHAR(512) NOT NULL,
    package_version  VARCHAR(255),
    mode             VARCHAR(16)  NOT NULL DEFAULT 'dynamic',
    local_artifact   TEXT,
    purl             VARCHAR(1024),
    status           VARCHAR(16)  NOT NULL DEFAULT 'queued',
    priority         INTEGER      NOT NULL DEFAULT 0,
    queued_at        TIMESTAMPTZ  NOT NULL DEFAULT NOW(),
    queue_position   INTEGER,
    started_at       TIMESTAMPTZ,
    completed_at     TIMESTAMPTZ,
    last_heartbeat   TIMESTAMPTZ,
    container_id     VARCHAR(128),
    duration_seconds DOUBLE PRECISION,
    report           JSONB,
    download_url     TEXT,
    error_message    TEXT,
    error_category   VARCHAR(32),
    error_details    JSONB,
    retry_count      INTEGER      NOT NULL DEFAULT 0,
    max_retries      INTEGER      NOT NULL DEFAULT 1,
    timeout_minutes  INTEGER      NOT NULL DEFAULT 30,
    created_at       TIMESTAMPTZ  NOT NULL DEFAULT NOW()
)
"#;

    pub const CREATE_SINGLE_RUNNING_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS \
         idx_analysis_tasks_single_running ON analysis_tasks(status) WHERE status = 'running'";

    pub const CREATE_QUEUE_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_analysis_tasks_queue \
         ON analysis_tasks(status, priority DESC, queued_at ASC, seq ASC)";

    pub const CREATE_PURL_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_analysis_tasks_purl \
         ON analysis_tasks(purl, status, completed_at)";

    pub const CREATE_COMPLETED_AT_INDEX: &str = "CREATE INDEX IF NOT EXISTS \
         idx_analysis_tasks_completed_at ON analysis_tasks(status, completed_at)";

    /// Key of the transaction-scoped advisory lock serializing scheduler writes.
    pub const SCHEDULER_LOCK_KEY: i64 = 0x7061_636b_616d_616c;

    pub const ACQUIRE_SCHEDULER_LOCK: &str = "SELECT pg_advisory_xact_lock($1)";

    pub const INSERT_TASK: &str = r#"
INSERT INTO analysis_tasks (
    id, ecosystem, package_name, package_version, mode, local_artifact, purl,
    status, priority, queued_at, queue_position, started_at, completed_at,
    last_heartbeat, container_id, duration_seconds, report, download_url,
    error_message, error_category, error_details, retry_count, max_retries,
    timeout_minutes, created_at
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
    $17, $18, $19, $20, $21, $22, $23, $24, $25
)
"#;

    pub const UPDATE_TASK: &str = r#"
UPDATE analysis_tasks SET
    status = $2, priority = $3, queued_at = $4, queue_position = $5,
    started_at = $6, completed_at = $7, last_heartbeat = $8, container_id = $9,
    duration_seconds = $10, report = $11, download_url = $12, error_message = $13,
    error_category = $14, error_details = $15, retry_count = $16,
    max_retries = $17, timeout_minutes = $18
WHERE id = $1
"#;

    pub const SET_QUEUE_POSITION: &str =
        "UPDATE analysis_tasks SET queue_position = $2 WHERE id = $1";

    pub const SELECT_BY_ID: &str = "SELECT {columns} FROM analysis_tasks WHERE id = $1";

    pub const SELECT_FOR_UPDATE: &str =
        "SELECT {columns} FROM analysis_tasks WHERE id = $1 FOR UPDATE";

    pub const SELECT_RUNNING: &str = "SELECT {columns} FROM analysis_tasks \
         WHERE status = 'running' ORDER BY started_at ASC FOR UPDATE";

    pub const SELECT_QUEUED_ORDERED: &str = "SELECT {columns} FROM analysis_tasks \
         WHERE status = 'queued' ORDER BY priority DESC, queued_at ASC, seq ASC";

    pub const SELECT_RETRYABLE: &str = "SELECT {columns} FROM analysis_tasks \
         WHERE status = 'failed' AND retry_count < max_retries ORDER BY completed_at ASC";

    pub const SELECT_COMPLETED_BY_PURL: &str = "SELECT {columns} FROM analysis_tasks \
         WHERE purl = $1 AND id <> $2 AND status = 'completed' AND report IS NOT NULL \
         ORDER BY completed_at DESC, seq DESC LIMIT 1";

    pub const SELECT_LIST: &str = "SELECT {columns} FROM analysis_tasks \
         WHERE ($1::TEXT IS NULL OR status = $1) ORDER BY seq DESC LIMIT $2";

    pub const DELETE_OLDER_THAN: &str =
        "DELETE FROM analysis_tasks WHERE status = $1 AND completed_at < $2";
}

/// Expands the `{columns}` placeholder of a select template.
pub fn select(template: &str) -> String {
    template.replace("{columns}", TASK_COLUMNS)
}

/// Returns the PostgreSQL schema statements in the order they must be applied.
///
/// Each entry is a single statement so it can run as a prepared query.
pub fn postgres_schema_statements() -> Vec<&'static str> {
    vec![
        postgres::CREATE_TASKS_TABLE,
        postgres::CREATE_SINGLE_RUNNING_INDEX,
        postgres::CREATE_QUEUE_INDEX,
        postgres::CREATE_PURL_INDEX,
        postgres::CREATE_COMPLETED_AT_INDEX,
    ]
}
