//! Authoring operations backing the CLI subcommands.
//!
//! Thin wrappers over the store APIs: parse input, call the store, print
//! the result. The daemon's schedule checker rebuilds the match index on
//! its tick, so authoring from a separate process is picked up without a
//! restart.

use anyhow::{bail, Context, Result};
use uuid::Uuid;

use crate::actions::{ActionFilter, ActionPatch, ActionStore, NewAction};
use crate::variables::VariableStore;
use crate::vault::VaultStore;

/// Create an action from a JSON definition.
pub async fn action_add(store: &ActionStore, definition: &str) -> Result<()> {
    let def: NewAction =
        serde_json::from_str(definition).context("Failed to parse action definition")?;
    let action = store.create(def).await?;
    println!("created action {} ({})", action.name, action.id);
    Ok(())
}

/// List actions, one line each.
pub async fn action_list(
    store: &ActionStore,
    group: Option<String>,
    enabled: Option<bool>,
) -> Result<()> {
    let actions = store.list(&ActionFilter { group, enabled }).await?;
    if actions.is_empty() {
        println!("no actions");
        return Ok(());
    }
    for action in actions {
        println!(
            "{}  {}  [{}]  {} step(s){}",
            action.id,
            action.name,
            if action.enabled { "on" } else { "off" },
            action.sub_actions.len(),
            action
                .group
                .as_deref()
                .map(|g| format!("  group={}", g))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

/// Print one action as pretty JSON.
pub async fn action_show(store: &ActionStore, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let action = store.get(id).await?;
    println!("{}", serde_json::to_string_pretty(&action)?);
    Ok(())
}

/// Delete an action.
pub async fn action_rm(store: &ActionStore, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    store.delete(id).await?;
    println!("deleted {}", id);
    Ok(())
}

/// Toggle an action's enabled gate.
pub async fn action_set_enabled(store: &ActionStore, id: &str, enabled: bool) -> Result<()> {
    let id = parse_id(id)?;
    let action = store
        .update(
            id,
            ActionPatch {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await?;
    println!(
        "{} {}",
        if enabled { "enabled" } else { "disabled" },
        action.name
    );
    Ok(())
}

/// Set a variable. The value is parsed as JSON when possible, otherwise
/// stored as a plain string.
pub async fn var_set(variables: &VariableStore, name: &str, value: &str) -> Result<()> {
    if name.contains(':') {
        bail!("variable names may not contain ':' (reserved namespace separator)");
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    variables.set(name, value).await?;
    println!("set {}", name);
    Ok(())
}

pub async fn var_get(variables: &VariableStore, name: &str) -> Result<()> {
    match variables.get(name).await? {
        Some(value) => println!("{}", value),
        None => println!("(unset)"),
    }
    Ok(())
}

pub async fn var_list(variables: &VariableStore) -> Result<()> {
    for variable in variables.list().await? {
        println!("{} = {}", variable.name, variable.value);
    }
    Ok(())
}

/// Store a vault secret. The transient plaintext is scrubbed after the
/// write and never echoed back.
pub fn vault_set(vault: &VaultStore, name: &str, value: String) -> Result<()> {
    vault.set(name, &value)?;
    VaultStore::scrub(value);
    println!("stored {}", name);
    Ok(())
}

pub fn vault_ls(vault: &VaultStore) -> Result<()> {
    let entries = vault.list();
    if entries.is_empty() {
        println!("vault is empty");
    }
    for entry in entries {
        println!("{}  (updated {})", entry.name, entry.updated_at);
    }
    Ok(())
}

pub fn vault_rm(vault: &VaultStore, name: &str) -> Result<()> {
    vault.delete(name)?;
    println!("removed {}", name);
    Ok(())
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("'{}' is not a valid action id", raw))
}
