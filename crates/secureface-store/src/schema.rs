//! DDL and seed data. Applied idempotently on every open.

pub(crate) const SCHEMA: &str = "
BEGIN;
CREATE TABLE IF NOT EXISTS roles (
    role_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    role_name    TEXT NOT NULL UNIQUE,
    access_level INTEGER NOT NULL,
    description  TEXT
);
CREATE TABLE IF NOT EXISTS users (
    user_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    full_name  TEXT NOT NULL,
    role_id    INTEGER NOT NULL REFERENCES roles(role_id),
    department TEXT,
    image_path TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS embeddings (
    embedding_id  INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id       INTEGER NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    model_version TEXT,
    dim           INTEGER NOT NULL,
    vector        BLOB NOT NULL,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_embeddings_user ON embeddings(user_id);
-- No foreign key on user_id: log rows keep the id after the user is deleted.
CREATE TABLE IF NOT EXISTS recognition_logs (
    log_id             INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id            INTEGER,
    camera_id          INTEGER NOT NULL,
    recognition_result TEXT NOT NULL CHECK (recognition_result IN ('ALLOWED', 'BLOCKED', 'UNKNOWN')),
    timestamp          TEXT NOT NULL,
    confidence_score   REAL
);
CREATE INDEX IF NOT EXISTS idx_logs_user ON recognition_logs(user_id);
CREATE TRIGGER IF NOT EXISTS recognition_logs_no_update
    BEFORE UPDATE ON recognition_logs
    BEGIN SELECT RAISE(ABORT, 'recognition_logs is append-only'); END;
INSERT OR IGNORE INTO roles (role_name, access_level, description) VALUES
    ('Admin', 100, 'Full access'),
    ('Security', 50, 'Security staff'),
    ('Employee', 10, 'Regular staff');
COMMIT;
";
