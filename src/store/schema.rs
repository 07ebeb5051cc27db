/// Schema for the local store.
pub const SCHEMA: &str = r#"
-- Mirrored journal entries (serialized JSON)
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Outbox. AUTOINCREMENT keeps ids strictly increasing, so id order is enqueue order.
CREATE TABLE IF NOT EXISTS pending_operations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    target_url TEXT NOT NULL,
    target_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    attachment BLOB,
    enqueued_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_operations_target
    ON pending_operations(target_id);

-- Retry bookkeeping, kept apart so outbox rows are never rewritten
CREATE TABLE IF NOT EXISTS operation_attempts (
    op_id INTEGER PRIMARY KEY,
    attempts INTEGER NOT NULL,
    last_error TEXT,
    next_attempt_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dead_letters (
    op_id INTEGER PRIMARY KEY,
    kind TEXT NOT NULL,
    target_url TEXT NOT NULL,
    payload TEXT NOT NULL,
    attachment BLOB,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    reason TEXT NOT NULL,
    failed_at TEXT NOT NULL
);

-- Local id -> server id, recorded when an offline create is replayed
CREATE TABLE IF NOT EXISTS id_remaps (
    local_id TEXT PRIMARY KEY,
    server_id TEXT NOT NULL,
    remapped_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
