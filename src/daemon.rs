//! Engine assembly and the foreground daemon loop.
//!
//! Wires the stores, handler registry, executor, coordinator, and
//! dispatcher together, then runs the background tasks: the schedule
//! checker, the optional metrics server, and the optional webhook
//! listener. Store handles are passed in explicitly, no ambient globals,
//! so tests assemble isolated engines the same way the daemon does.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::actions::{
    ActionExecutor, ActionStore, CoordinatorConfig, ExecutionCoordinator, HandlerEnv,
    HandlerRegistry, ScheduleChecker, TriggerDispatcher,
};
use crate::config::Config;
use crate::providers::{ChatSender, LogChatSender, LogSoundPlayer, SoundPlayer};
use crate::retry::RetryPolicy;
use crate::variables::VariableStore;
use crate::vault::VaultStore;

/// A fully wired automation engine.
pub struct Engine {
    pub config: Config,
    pub store: Arc<ActionStore>,
    pub variables: Arc<VariableStore>,
    pub vault: Arc<VaultStore>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub dispatcher: Arc<TriggerDispatcher>,
}

impl Engine {
    /// Assemble an engine with the default (logging) side-effect providers.
    pub async fn assemble(config: Config) -> Result<Self> {
        Self::assemble_with_providers(config, Arc::new(LogChatSender), Arc::new(LogSoundPlayer))
            .await
    }

    /// Assemble an engine with explicit platform providers.
    pub async fn assemble_with_providers(
        config: Config,
        chat: Arc<dyn ChatSender>,
        sound: Arc<dyn SoundPlayer>,
    ) -> Result<Self> {
        let registry = Arc::new(HandlerRegistry::builtin());
        let store = Arc::new(
            ActionStore::open(&config.actions_db_path(), registry.clone())
                .context("Failed to open action store")?,
        );
        let variables = Arc::new(
            VariableStore::open(&config.variables_db_path())
                .context("Failed to open variable store")?,
        );
        let vault =
            Arc::new(VaultStore::open(&config.vault_dir()).context("Failed to open vault")?);

        let env = Arc::new(HandlerEnv::new(variables.clone(), chat, sound));
        let executor = Arc::new(ActionExecutor::new(
            env,
            vault.clone(),
            registry,
            RetryPolicy::with_limits(config.retry_max_attempts, config.retry_base_delay_ms),
        ));
        let coordinator = ExecutionCoordinator::new(
            executor,
            CoordinatorConfig {
                queue_depth: config.queue_depth,
                history_capacity: config.history_capacity,
            },
        );
        let dispatcher = Arc::new(TriggerDispatcher::new(store.clone(), coordinator.clone()));
        dispatcher.rebuild().await.context("Failed to build match index")?;

        Ok(Self {
            config,
            store,
            variables,
            vault,
            coordinator,
            dispatcher,
        })
    }

    /// Run the daemon in the foreground until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        eprintln!(
            "[daemon] streamrig engine up, {} action(s) indexed",
            self.dispatcher.indexed_count().await
        );

        let checker = ScheduleChecker::new(
            self.dispatcher.clone(),
            self.config.scheduler_tick_secs,
        );
        tokio::spawn(async move { checker.run().await });

        if let Some(raw) = &self.config.metrics_addr {
            let addr = raw
                .parse()
                .with_context(|| format!("Invalid metrics address: {}", raw))?;
            tokio::spawn(async move {
                if let Err(e) = crate::metrics::start_metrics_server(addr).await {
                    eprintln!("[metrics] server error: {}", e);
                }
            });
        }

        if let Some(raw) = &self.config.webhook_addr {
            let addr = raw
                .parse()
                .with_context(|| format!("Invalid webhook address: {}", raw))?;
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::webhook::start_webhook_server(addr, dispatcher).await {
                    eprintln!("[webhook] server error: {}", e);
                }
            });
        }

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        eprintln!("[daemon] shutting down");
        Ok(())
    }
}
