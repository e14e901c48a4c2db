//! Durable variable store used for `${name}` interpolation.
//!
//! One SQLite table, last-writer-wins per key. `set_variable` sub-actions
//! write here and interpolation reads here. There are no cross-key
//! transactions; a multi-variable update is not atomic as a set.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// A named value, either a plain string or structured JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: serde_json::Value,
    pub updated_at: i64,
}

/// Variable storage with SQLite backend.
pub struct VariableStore {
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl VariableStore {
    /// Open or create a variables database.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create variables directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS variables (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Set a variable, overwriting any previous value (last writer wins).
    pub async fn set(&self, name: &str, value: serde_json::Value) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let value_json = serde_json::to_string(&value)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO variables (name, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET value = ?2, updated_at = ?3
            "#,
            params![name, value_json, now],
        )?;
        Ok(())
    }

    /// Get a variable's value, or `None` if unset.
    pub async fn get(&self, name: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM variables WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Delete a variable. Deleting an unset name is not an error.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM variables WHERE name = ?1", params![name])?;
        Ok(())
    }

    /// List all variables in name order.
    pub async fn list(&self) -> Result<Vec<Variable>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT name, value, updated_at FROM variables ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            let value_json: String = row.get(1)?;
            let value: serde_json::Value = serde_json::from_str(&value_json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            Ok(Variable {
                name: row.get(0)?,
                value,
                updated_at: row.get(2)?,
            })
        })?;

        let mut variables = Vec::new();
        for variable in rows {
            variables.push(variable?);
        }
        Ok(variables)
    }

    /// Full snapshot export for the state-export surface.
    ///
    /// Holds the store lock only for the duration of the query, so
    /// concurrent writers are blocked for no longer than the snapshot read.
    pub async fn snapshot(&self) -> Result<Vec<Variable>> {
        self.list().await
    }

    /// Path of the backing database file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_store(temp: &TempDir) -> VariableStore {
        VariableStore::open(&temp.path().join("variables.db")).unwrap()
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        store.set("foo", json!("bar")).await.unwrap();
        assert_eq!(store.get("foo").await.unwrap(), Some(json!("bar")));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn last_writer_wins() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        store.set("counter", json!(1)).await.unwrap();
        store.set("counter", json!(2)).await.unwrap();
        assert_eq!(store.get("counter").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn structured_values_survive() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        let value = json!({"nested": {"list": [1, 2, 3]}});
        store.set("blob", value.clone()).await.unwrap();
        assert_eq!(store.get("blob").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn delete_and_list() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        store.set("b", json!("2")).await.unwrap();
        store.set("a", json!("1")).await.unwrap();
        store.delete("b").await.unwrap();
        store.delete("never-set").await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "a");
    }

    #[tokio::test]
    async fn snapshot_matches_list() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        store.set("x", json!("y")).await.unwrap();
        let snap = store.snapshot().await.unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].name, "x");
    }
}
