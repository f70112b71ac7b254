//! secureface-store: SQLite persistence for roles, enrolled users, their
//! reference embeddings and the append-only recognition log.

mod schema;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use secureface_core::gallery::{Gallery, GalleryEntry, Role};
use secureface_core::types::{Decision, Embedding, RecognitionLogEntry, EMBEDDING_DIM};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// An enrolled person as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: i64,
    pub full_name: String,
    pub role_id: i64,
    pub department: Option<String>,
    pub image_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted recognition log row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub id: i64,
    #[serde(flatten)]
    pub entry: RecognitionLogEntry,
}

/// Role with its free-text description.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoleRecord {
    #[serde(flatten)]
    pub role: Role,
    pub description: Option<String>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

/// Fixed-width UTC timestamps so text order is time order.
fn fmt_ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Now, at the precision that survives a round trip through the database.
fn db_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Confidence is stored with 4 decimal places.
fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s:?}: {e}")))
}

fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Result<Vec<f32>, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!("vector blob of {} bytes", blob.len())));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Raw user columns; timestamps are parsed outside the rusqlite row mapper.
type UserRow = (i64, String, i64, Option<String>, Option<String>, String, String);

const USER_COLUMNS: &str =
    "user_id, full_name, role_id, department, image_path, created_at, updated_at";

fn user_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn into_user(r: UserRow) -> Result<User, StoreError> {
    Ok(User {
        id: r.0,
        full_name: r.1,
        role_id: r.2,
        department: r.3,
        image_path: r.4,
        created_at: parse_ts(&r.5)?,
        updated_at: parse_ts(&r.6)?,
    })
}

fn role_row(row: &Row<'_>) -> rusqlite::Result<RoleRecord> {
    Ok(RoleRecord {
        role: Role {
            id: row.get(0)?,
            name: row.get(1)?,
            access_level: row.get(2)?,
        },
        description: row.get(3)?,
    })
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    // --- roles ---

    pub fn create_role(&self, name: &str, access_level: i32, description: Option<&str>) -> Result<Role, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO roles (role_name, access_level, description) VALUES (?1, ?2, ?3)",
            params![name, access_level, description],
        )?;
        Ok(Role {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            access_level,
        })
    }

    pub fn list_roles(&self) -> Result<Vec<RoleRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT role_id, role_name, access_level, description FROM roles ORDER BY access_level DESC, role_id",
        )?;
        let rows = stmt.query_map([], role_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_role(&self, role_id: i64) -> Result<RoleRecord, StoreError> {
        self.conn()
            .query_row(
                "SELECT role_id, role_name, access_level, description FROM roles WHERE role_id = ?1",
                [role_id],
                role_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("role {role_id}")))
    }

    pub fn role_by_name(&self, name: &str) -> Result<RoleRecord, StoreError> {
        self.conn()
            .query_row(
                "SELECT role_id, role_name, access_level, description FROM roles WHERE role_name = ?1",
                [name],
                role_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("role {name:?}")))
    }

    pub fn set_access_level(&self, role_id: i64, access_level: i32) -> Result<(), StoreError> {
        let n = self.conn().execute(
            "UPDATE roles SET access_level = ?1 WHERE role_id = ?2",
            params![access_level, role_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("role {role_id}")));
        }
        Ok(())
    }

    // --- users ---

    pub fn create_user(&self, full_name: &str, role_id: i64, department: Option<&str>) -> Result<User, StoreError> {
        let now = db_now();
        let ts = fmt_ts(&now);
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users (full_name, role_id, department, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![full_name, role_id, department, ts],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(user_id = id, role_id, "user created");
        Ok(User {
            id,
            full_name: full_name.to_string(),
            role_id,
            department: department.map(str::to_string),
            image_path: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_user(&self, user_id: i64) -> Result<User, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"),
                [user_id],
                user_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        into_user(row)
    }

    pub fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY user_id"))?;
        let rows = stmt.query_map([], user_row)?.collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(into_user).collect()
    }

    /// Write back name, role, department and image path; bumps `updated_at`.
    pub fn update_user(&self, user: &User) -> Result<User, StoreError> {
        let now = db_now();
        let n = self.conn().execute(
            "UPDATE users SET full_name = ?1, role_id = ?2, department = ?3, image_path = ?4, updated_at = ?5
             WHERE user_id = ?6",
            params![
                user.full_name,
                user.role_id,
                user.department,
                user.image_path,
                fmt_ts(&now),
                user.id
            ],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("user {}", user.id)));
        }
        Ok(User {
            updated_at: now,
            ..user.clone()
        })
    }

    /// Delete a user and their reference embeddings. Log rows are kept.
    pub fn delete_user(&self, user_id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM embeddings WHERE user_id = ?1", [user_id])?;
        let n = tx.execute("DELETE FROM users WHERE user_id = ?1", [user_id])?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        tx.commit()?;
        tracing::info!(user_id, "user deleted");
        Ok(())
    }

    // --- embeddings ---

    /// Store one reference embedding for a user.
    pub fn add_embedding(&self, user_id: i64, embedding: &Embedding) -> Result<i64, StoreError> {
        if embedding.dim() != EMBEDDING_DIM {
            return Err(StoreError::DimensionMismatch {
                expected: EMBEDDING_DIM,
                got: embedding.dim(),
            });
        }
        let conn = self.conn();
        let exists: Option<i64> = conn
            .query_row("SELECT user_id FROM users WHERE user_id = ?1", [user_id], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        conn.execute(
            "INSERT INTO embeddings (user_id, model_version, dim, vector, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_id,
                embedding.model_version,
                embedding.dim() as i64,
                encode_vector(&embedding.values),
                fmt_ts(&db_now())
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn count_embeddings(&self, user_id: i64) -> Result<usize, StoreError> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM embeddings WHERE user_id = ?1",
            [user_id],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Build a gallery of every user with at least one reference embedding.
    pub fn load_gallery(&self) -> Result<Gallery, StoreError> {
        let conn = self.conn();

        let mut stmt = conn.prepare(
            "SELECT u.user_id, u.full_name, r.role_id, r.role_name, r.access_level
             FROM users u JOIN roles r ON r.role_id = u.role_id
             ORDER BY u.user_id",
        )?;
        let mut entries: BTreeMap<i64, GalleryEntry> = stmt
            .query_map([], |row| {
                Ok(GalleryEntry {
                    person_id: row.get(0)?,
                    display_name: row.get(1)?,
                    role: Role {
                        id: row.get(2)?,
                        name: row.get(3)?,
                        access_level: row.get(4)?,
                    },
                    references: Vec::new(),
                })
            })?
            .map(|e| e.map(|e| (e.person_id, e)))
            .collect::<Result<_, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT user_id, model_version, dim, vector FROM embeddings ORDER BY user_id, embedding_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (user_id, model_version, dim, blob) in rows {
            let values = decode_vector(&blob)?;
            if values.len() != dim as usize || values.len() != EMBEDDING_DIM {
                tracing::warn!(user_id, dim, len = values.len(), "skipping embedding with wrong dimension");
                continue;
            }
            if let Some(entry) = entries.get_mut(&user_id) {
                entry.references.push(Embedding { values, model_version });
            }
        }

        let gallery = Gallery::new(entries.into_values().collect());
        tracing::info!(people = gallery.len(), references = gallery.reference_count(), "gallery loaded");
        Ok(gallery)
    }

    // --- recognition log ---

    /// Append one audit row. There is no update path.
    pub fn append_log(&self, entry: &RecognitionLogEntry) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO recognition_logs (user_id, camera_id, recognition_result, timestamp, confidence_score)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.person_id,
                entry.camera_id,
                entry.decision.as_str(),
                fmt_ts(&entry.timestamp),
                entry.confidence.map(round4)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest first, optionally for one user.
    pub fn list_logs(&self, user_id: Option<i64>, limit: usize) -> Result<Vec<LogRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT log_id, user_id, camera_id, recognition_result, timestamp, confidence_score
             FROM recognition_logs
             WHERE ?1 IS NULL OR user_id = ?1
             ORDER BY timestamp DESC, log_id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, person_id, camera_id, result, ts, confidence)| {
                let decision: Decision = result.parse().map_err(StoreError::Corrupt)?;
                Ok(LogRecord {
                    id,
                    entry: RecognitionLogEntry {
                        person_id,
                        camera_id,
                        decision,
                        confidence,
                        timestamp: parse_ts(&ts)?,
                    },
                })
            })
            .collect()
    }

    pub fn count_logs(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM recognition_logs", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secureface_core::types::MatchResult;
    use tempfile::NamedTempFile;

    fn unit(axis: usize) -> Embedding {
        let mut values = vec![0.0f32; EMBEDDING_DIM];
        values[axis] = 1.0;
        Embedding { values, model_version: Some("w600k_r50".into()) }
    }

    fn entry(person_id: Option<i64>, decision: Decision, confidence: Option<f64>) -> RecognitionLogEntry {
        RecognitionLogEntry {
            person_id,
            camera_id: 1,
            decision,
            confidence,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_default_roles_seeded_once() {
        let tf = NamedTempFile::new().unwrap();
        drop(Store::open(tf.path()).unwrap());
        let store = Store::open(tf.path()).unwrap();
        let roles = store.list_roles().unwrap();
        let names: Vec<&str> = roles.iter().map(|r| r.role.name.as_str()).collect();
        assert_eq!(names, vec!["Admin", "Security", "Employee"]);
        assert_eq!(store.role_by_name("Security").unwrap().role.access_level, 50);
    }

    #[test]
    fn test_role_names_unique() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(store.create_role("Admin", 1, None), Err(StoreError::Sql(_))));
        let r = store.create_role("Visitor", 5, Some("day pass")).unwrap();
        store.set_access_level(r.id, 7).unwrap();
        let got = store.get_role(r.id).unwrap();
        assert_eq!(got.role.access_level, 7);
        assert_eq!(got.description.as_deref(), Some("day pass"));
        assert!(matches!(store.set_access_level(9999, 1), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_user_crud() {
        let store = Store::open_in_memory().unwrap();
        let role = store.role_by_name("Employee").unwrap().role;
        let user = store.create_user("Ada Lovelace", role.id, Some("R&D")).unwrap();
        assert_eq!(store.get_user(user.id).unwrap(), user);

        let updated = store
            .update_user(&User { image_path: Some("/srv/ada.png".into()), ..user.clone() })
            .unwrap();
        let fetched = store.get_user(user.id).unwrap();
        assert_eq!(fetched.image_path.as_deref(), Some("/srv/ada.png"));
        assert_eq!(fetched.updated_at, updated.updated_at);
        assert!(fetched.updated_at >= fetched.created_at);
        assert_eq!(store.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_user_requires_existing_role() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.create_user("Nobody", 4242, None).is_err());
    }

    #[test]
    fn test_gallery_groups_references_and_skips_unenrolled() {
        let store = Store::open_in_memory().unwrap();
        let admin = store.role_by_name("Admin").unwrap().role;
        let emp = store.role_by_name("Employee").unwrap().role;
        let a = store.create_user("A", admin.id, None).unwrap();
        let b = store.create_user("B", emp.id, None).unwrap();
        let _c = store.create_user("C (not enrolled)", emp.id, None).unwrap();

        store.add_embedding(a.id, &unit(0)).unwrap();
        store.add_embedding(a.id, &unit(1)).unwrap();
        store.add_embedding(b.id, &unit(2)).unwrap();

        let gallery = store.load_gallery().unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.reference_count(), 3);
        let first = &gallery.entries()[0];
        assert_eq!(first.person_id, a.id);
        assert_eq!(first.role.access_level, 100);
        assert_eq!(first.references[1].values[1], 1.0);
    }

    #[test]
    fn test_embedding_dimension_checked() {
        let store = Store::open_in_memory().unwrap();
        let role = store.role_by_name("Employee").unwrap().role;
        let u = store.create_user("U", role.id, None).unwrap();
        let short = Embedding { values: vec![1.0; 128], model_version: None };
        assert!(matches!(
            store.add_embedding(u.id, &short),
            Err(StoreError::DimensionMismatch { expected: EMBEDDING_DIM, got: 128 })
        ));
        assert!(matches!(store.add_embedding(999, &unit(0)), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_delete_user_removes_embeddings_keeps_logs() {
        let store = Store::open_in_memory().unwrap();
        let role = store.role_by_name("Employee").unwrap().role;
        let u = store.create_user("U", role.id, None).unwrap();
        store.add_embedding(u.id, &unit(0)).unwrap();
        store.append_log(&entry(Some(u.id), Decision::Allowed, Some(0.91))).unwrap();

        store.delete_user(u.id).unwrap();
        assert_eq!(store.count_embeddings(u.id).unwrap(), 0);
        assert!(store.load_gallery().unwrap().is_empty());
        let logs = store.list_logs(Some(u.id), 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(matches!(store.delete_user(u.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_log_append_and_list() {
        let store = Store::open_in_memory().unwrap();
        let unknown = RecognitionLogEntry::from_match(&MatchResult::no_embedding(), 3, Utc::now());
        store.append_log(&unknown).unwrap();
        store.append_log(&entry(Some(7), Decision::Blocked, Some(0.123456))).unwrap();
        store.append_log(&entry(None, Decision::Unknown, Some(0.3))).unwrap();

        assert_eq!(store.count_logs().unwrap(), 3);
        let all = store.list_logs(None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].entry.decision, Decision::Unknown);
        assert_eq!(all[0].entry.confidence, Some(0.3));
        assert_eq!(all[1].entry.confidence, Some(0.1235));
        assert_eq!(all[2].entry.confidence, None);
        assert_eq!(all[2].entry.person_id, None);

        let for_seven = store.list_logs(Some(7), 10).unwrap();
        assert_eq!(for_seven.len(), 1);
        assert_eq!(store.list_logs(None, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_logs_cannot_be_updated() {
        let store = Store::open_in_memory().unwrap();
        store.append_log(&entry(None, Decision::Unknown, None)).unwrap();
        let res = store
            .conn()
            .execute("UPDATE recognition_logs SET recognition_result = 'ALLOWED'", []);
        assert!(res.is_err());
    }

    #[test]
    fn test_result_check_constraint() {
        let store = Store::open_in_memory().unwrap();
        let res = store.conn().execute(
            "INSERT INTO recognition_logs (camera_id, recognition_result, timestamp) VALUES (1, 'MAYBE', 'x')",
            [],
        );
        assert!(res.is_err());
    }
}
