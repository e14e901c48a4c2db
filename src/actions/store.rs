//! Durable action collection with CRUD and integrity checks.
//!
//! SQLite-backed. All mutating operations run under the connection lock
//! (single-writer discipline) so concurrent create/update/delete calls
//! never interleave a partial write. Trigger and sub-action definitions
//! are validated before anything touches the database; an invalid update
//! is rejected atomically with the stored record untouched.
//!
//! ## Database Schema
//!
//! ```sql
//! CREATE TABLE actions (
//!     id TEXT PRIMARY KEY,             -- UUID, immutable
//!     name TEXT NOT NULL,
//!     action_group TEXT,
//!     enabled BOOLEAN DEFAULT 1,
//!     trigger_json TEXT NOT NULL,      -- tagged Trigger
//!     sub_actions_json TEXT NOT NULL,  -- ordered tagged SubAction list
//!     created_at INTEGER NOT NULL,
//!     updated_at INTEGER NOT NULL
//! );
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::actions::handlers::HandlerRegistry;
use crate::actions::types::{Action, ActionPatch, NewAction};
use crate::error::StoreError;

/// Optional constraints for `list`.
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub group: Option<String>,
    pub enabled: Option<bool>,
}

/// Action storage with SQLite backend.
pub struct ActionStore {
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    registry: Arc<HandlerRegistry>,
}

struct RawRow {
    id: String,
    name: String,
    group: Option<String>,
    enabled: bool,
    trigger_json: String,
    sub_actions_json: String,
    created_at: i64,
    updated_at: i64,
}

const SELECT_COLUMNS: &str = "id, name, action_group, enabled, trigger_json, \
     sub_actions_json, created_at, updated_at";

impl ActionStore {
    /// Open or create an actions database.
    ///
    /// Every stored record is schema-validated on open; records that fail
    /// validation are skipped with a logged warning rather than aborting
    /// the load.
    pub fn open(db_path: &Path, registry: Arc<HandlerRegistry>) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create actions directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS actions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                action_group TEXT,
                enabled BOOLEAN DEFAULT 1,
                trigger_json TEXT NOT NULL,
                sub_actions_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_actions_enabled ON actions(enabled);
            CREATE INDEX IF NOT EXISTS idx_actions_group ON actions(action_group);
            "#,
        )?;

        // Surface bad records once at load time.
        {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM actions ORDER BY rowid",
                SELECT_COLUMNS
            ))?;
            let rows = stmt.query_map([], Self::raw_row)?;
            for raw in rows {
                let raw = raw?;
                let id = raw.id.clone();
                if let Err(e) = Self::parse_row(raw) {
                    eprintln!("[action-store] skipping invalid record {}: {}", id, e);
                }
            }
        }

        Ok(Self {
            db_path: db_path.to_path_buf(),
            conn: Arc::new(Mutex::new(conn)),
            registry,
        })
    }

    /// Create a new action. Assigns the id and both timestamps.
    pub async fn create(&self, def: NewAction) -> Result<Action, StoreError> {
        if def.name.trim().is_empty() {
            return Err(StoreError::Validation(
                "action name must not be empty".into(),
            ));
        }
        def.trigger.validate()?;
        self.registry.validate_all(&def.sub_actions)?;

        let now = chrono::Utc::now().timestamp();
        let action = Action {
            id: Uuid::new_v4(),
            name: def.name,
            group: def.group,
            enabled: def.enabled,
            trigger: def.trigger,
            sub_actions: def.sub_actions,
            created_at: now,
            updated_at: now,
        };

        let trigger_json = serde_json::to_string(&action.trigger)?;
        let sub_actions_json = serde_json::to_string(&action.sub_actions)?;

        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO actions (
                id, name, action_group, enabled, trigger_json, sub_actions_json,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                action.id.to_string(),
                action.name,
                action.group,
                action.enabled,
                trigger_json,
                sub_actions_json,
                action.created_at,
                action.updated_at,
            ],
        )?;

        Ok(action)
    }

    /// Get an action by id.
    pub async fn get(&self, id: Uuid) -> Result<Action, StoreError> {
        let conn = self.conn.lock().await;
        Self::fetch(&conn, id)
    }

    /// List actions in insertion order, optionally filtered by group and
    /// enabled state. Records that fail schema validation are skipped with
    /// a logged warning.
    pub async fn list(&self, filter: &ActionFilter) -> Result<Vec<Action>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM actions ORDER BY rowid",
            SELECT_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::raw_row)?;

        let mut actions = Vec::new();
        for raw in rows {
            let raw = raw?;
            let id = raw.id.clone();
            match Self::parse_row(raw) {
                Ok(action) => actions.push(action),
                Err(e) => {
                    eprintln!("[action-store] skipping invalid record {}: {}", id, e);
                }
            }
        }

        if let Some(group) = &filter.group {
            actions.retain(|a| a.group.as_deref() == Some(group.as_str()));
        }
        if let Some(enabled) = filter.enabled {
            actions.retain(|a| a.enabled == enabled);
        }

        Ok(actions)
    }

    /// Apply a partial update. The merged record is validated as a whole
    /// before any write: an invalid patch leaves the stored action
    /// entirely unchanged, timestamps included. `id` and `created_at` are
    /// never mutated.
    pub async fn update(&self, id: Uuid, patch: ActionPatch) -> Result<Action, StoreError> {
        let conn = self.conn.lock().await;
        let mut action = Self::fetch(&conn, id)?;

        if let Some(name) = patch.name {
            action.name = name;
        }
        if let Some(group) = patch.group {
            action.group = group;
        }
        if let Some(enabled) = patch.enabled {
            action.enabled = enabled;
        }
        if let Some(trigger) = patch.trigger {
            action.trigger = trigger;
        }
        if let Some(sub_actions) = patch.sub_actions {
            action.sub_actions = sub_actions;
        }

        if action.name.trim().is_empty() {
            return Err(StoreError::Validation(
                "action name must not be empty".into(),
            ));
        }
        action.trigger.validate()?;
        self.registry.validate_all(&action.sub_actions)?;

        action.updated_at = chrono::Utc::now().timestamp();
        let trigger_json = serde_json::to_string(&action.trigger)?;
        let sub_actions_json = serde_json::to_string(&action.sub_actions)?;

        conn.execute(
            r#"
            UPDATE actions SET
                name = ?1, action_group = ?2, enabled = ?3, trigger_json = ?4,
                sub_actions_json = ?5, updated_at = ?6
            WHERE id = ?7
            "#,
            params![
                action.name,
                action.group,
                action.enabled,
                trigger_json,
                sub_actions_json,
                action.updated_at,
                id.to_string(),
            ],
        )?;

        Ok(action)
    }

    /// Delete an action by id.
    pub async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let removed = conn.execute("DELETE FROM actions WHERE id = ?1", params![id.to_string()])?;
        if removed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Path of the backing database file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn fetch(conn: &Connection, id: Uuid) -> Result<Action, StoreError> {
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM actions WHERE id = ?1", SELECT_COLUMNS),
                params![id.to_string()],
                Self::raw_row,
            )
            .optional()?;

        match raw {
            Some(raw) => Self::parse_row(raw),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
        Ok(RawRow {
            id: row.get(0)?,
            name: row.get(1)?,
            group: row.get(2)?,
            enabled: row.get(3)?,
            trigger_json: row.get(4)?,
            sub_actions_json: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn parse_row(raw: RawRow) -> Result<Action, StoreError> {
        let id = Uuid::parse_str(&raw.id)
            .map_err(|e| StoreError::Schema(format!("invalid action id '{}': {}", raw.id, e)))?;
        let trigger = serde_json::from_str(&raw.trigger_json)?;
        let sub_actions = serde_json::from_str(&raw.sub_actions_json)?;
        Ok(Action {
            id,
            name: raw.name,
            group: raw.group,
            enabled: raw.enabled,
            trigger,
            sub_actions,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }
}
