//! Kind-specific sub-action handlers.
//!
//! Each handler implements the `{validate, run}` capability pair for one
//! sub-action kind; the registry maps kind tags to handlers. Adding a kind
//! means adding a variant and registering a handler; the dispatch core
//! never changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::actions::types::{SubAction, SubActionKind};
use crate::error::{HandlerError, StoreError};
use crate::providers::{ChatSender, SoundPlayer};
use crate::retry::{classify_reqwest_result, RetryDecision};
use crate::variables::VariableStore;

/// Default bound on a single HTTP side effect.
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
/// Upper bound on a delay step; longer waits belong in a scheduled trigger.
const MAX_DELAY_MILLIS: u64 = 3_600_000;
/// Discord rejects message bodies above this length.
const DISCORD_CONTENT_LIMIT: usize = 2000;

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];

/// Services available to handlers at run time.
pub struct HandlerEnv {
    pub variables: Arc<VariableStore>,
    pub chat: Arc<dyn ChatSender>,
    pub sound: Arc<dyn SoundPlayer>,
    pub http: reqwest::Client,
}

impl HandlerEnv {
    pub fn new(
        variables: Arc<VariableStore>,
        chat: Arc<dyn ChatSender>,
        sound: Arc<dyn SoundPlayer>,
    ) -> Self {
        Self {
            variables,
            chat,
            sound,
            http: reqwest::Client::new(),
        }
    }
}

/// One sub-action kind's validate/run pair.
#[async_trait]
pub trait SubActionHandler: Send + Sync {
    fn kind(&self) -> SubActionKind;

    /// Kind-specific parameter schema check, enforced before persistence.
    fn validate(&self, sub: &SubAction) -> Result<(), StoreError>;

    /// Perform the side effect. `cancel` is only observed at suspend
    /// points (the delay handler); handlers are never interrupted
    /// mid-flight.
    async fn run(
        &self,
        sub: &SubAction,
        env: &HandlerEnv,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// Registry mapping sub-action kinds to their handlers.
pub struct HandlerRegistry {
    handlers: HashMap<SubActionKind, Arc<dyn SubActionHandler>>,
}

impl HandlerRegistry {
    /// An empty registry. Useful for embedding with a custom handler set.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with all built-in handlers.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SendChatMessageHandler));
        registry.register(Arc::new(PlaySoundHandler));
        registry.register(Arc::new(SetVariableHandler));
        registry.register(Arc::new(HttpCallHandler));
        registry.register(Arc::new(DiscordExportHandler));
        registry.register(Arc::new(DelayHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn SubActionHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: SubActionKind) -> Option<Arc<dyn SubActionHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Validate one sub-action against its kind's schema.
    pub fn validate(&self, sub: &SubAction) -> Result<(), StoreError> {
        match self.handlers.get(&sub.kind()) {
            Some(handler) => handler.validate(sub),
            None => Err(StoreError::Schema(format!(
                "no handler registered for sub-action kind '{}'",
                sub.kind()
            ))),
        }
    }

    /// Validate an ordered sub-action sequence, reporting the failing index.
    pub fn validate_all(&self, subs: &[SubAction]) -> Result<(), StoreError> {
        for (index, sub) in subs.iter().enumerate() {
            self.validate(sub).map_err(|e| match e {
                StoreError::Schema(msg) => {
                    StoreError::Schema(format!("sub-action {}: {}", index, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn mismatch(kind: SubActionKind) -> HandlerError {
    HandlerError::fatal(format!("handler for '{}' received a different kind", kind))
}

/// Validate a URL parameter. Strings carrying `${...}` placeholders are
/// only resolvable at run time, so syntax is checked only for literal URLs.
fn validate_url(field: &str, raw: &str) -> Result<(), StoreError> {
    if raw.trim().is_empty() {
        return Err(StoreError::Schema(format!("{} must not be empty", field)));
    }
    if raw.contains("${") {
        return Ok(());
    }
    let parsed = url::Url::parse(raw)
        .map_err(|e| StoreError::Schema(format!("{} is not a valid URL: {}", field, e)))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(StoreError::Schema(format!(
            "{} must use http or https, got '{}'",
            field,
            parsed.scheme()
        )));
    }
    Ok(())
}

// ── send_chat_message ───────────────────────────────────────────────────────

pub struct SendChatMessageHandler;

#[async_trait]
impl SubActionHandler for SendChatMessageHandler {
    fn kind(&self) -> SubActionKind {
        SubActionKind::SendChatMessage
    }

    fn validate(&self, sub: &SubAction) -> Result<(), StoreError> {
        match sub {
            SubAction::SendChatMessage { text } if text.trim().is_empty() => Err(
                StoreError::Schema("send_chat_message requires non-empty text".into()),
            ),
            SubAction::SendChatMessage { .. } => Ok(()),
            _ => Err(StoreError::Schema("mismatched sub-action kind".into())),
        }
    }

    async fn run(
        &self,
        sub: &SubAction,
        env: &HandlerEnv,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let SubAction::SendChatMessage { text } = sub else {
            return Err(mismatch(self.kind()));
        };
        // Chat delivery rides a platform connection; failures are transient.
        env.chat
            .send(text)
            .await
            .map_err(|e| HandlerError::recoverable(format!("chat send failed: {}", e)))
    }
}

// ── play_sound ──────────────────────────────────────────────────────────────

pub struct PlaySoundHandler;

#[async_trait]
impl SubActionHandler for PlaySoundHandler {
    fn kind(&self) -> SubActionKind {
        SubActionKind::PlaySound
    }

    fn validate(&self, sub: &SubAction) -> Result<(), StoreError> {
        match sub {
            SubAction::PlaySound { path, volume } => {
                if path.trim().is_empty() {
                    return Err(StoreError::Schema(
                        "play_sound requires a non-empty path".into(),
                    ));
                }
                if !(0.0..=1.0).contains(volume) {
                    return Err(StoreError::Schema(format!(
                        "play_sound volume must be within 0.0..=1.0, got {}",
                        volume
                    )));
                }
                Ok(())
            }
            _ => Err(StoreError::Schema("mismatched sub-action kind".into())),
        }
    }

    async fn run(
        &self,
        sub: &SubAction,
        env: &HandlerEnv,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let SubAction::PlaySound { path, volume } = sub else {
            return Err(mismatch(self.kind()));
        };
        // A missing or unreadable sound file will not fix itself on retry.
        env.sound
            .play(path, *volume)
            .await
            .map_err(|e| HandlerError::fatal(format!("sound playback failed: {}", e)))
    }
}

// ── set_variable ────────────────────────────────────────────────────────────

pub struct SetVariableHandler;

#[async_trait]
impl SubActionHandler for SetVariableHandler {
    fn kind(&self) -> SubActionKind {
        SubActionKind::SetVariable
    }

    fn validate(&self, sub: &SubAction) -> Result<(), StoreError> {
        match sub {
            SubAction::SetVariable { name, .. } => {
                if name.trim().is_empty() {
                    return Err(StoreError::Schema(
                        "set_variable requires a non-empty name".into(),
                    ));
                }
                if name.contains(':') {
                    return Err(StoreError::Schema(format!(
                        "variable name '{}' may not contain ':' (reserved namespace separator)",
                        name
                    )));
                }
                Ok(())
            }
            _ => Err(StoreError::Schema("mismatched sub-action kind".into())),
        }
    }

    async fn run(
        &self,
        sub: &SubAction,
        env: &HandlerEnv,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let SubAction::SetVariable { name, value } = sub else {
            return Err(mismatch(self.kind()));
        };
        env.variables
            .set(name, value.clone())
            .await
            .map_err(|e| HandlerError::fatal(format!("variable write failed: {}", e)))
    }
}

// ── http_call ───────────────────────────────────────────────────────────────

pub struct HttpCallHandler;

#[async_trait]
impl SubActionHandler for HttpCallHandler {
    fn kind(&self) -> SubActionKind {
        SubActionKind::HttpCall
    }

    fn validate(&self, sub: &SubAction) -> Result<(), StoreError> {
        match sub {
            SubAction::HttpCall {
                method,
                url,
                timeout_secs,
                ..
            } => {
                let upper = method.to_uppercase();
                if !ALLOWED_METHODS.contains(&upper.as_str()) {
                    return Err(StoreError::Schema(format!(
                        "http_call method must be one of {:?}, got '{}'",
                        ALLOWED_METHODS, method
                    )));
                }
                validate_url("http_call url", url)?;
                if let Some(secs) = timeout_secs {
                    if *secs == 0 {
                        return Err(StoreError::Schema(
                            "http_call timeout_secs must be greater than zero".into(),
                        ));
                    }
                }
                Ok(())
            }
            _ => Err(StoreError::Schema("mismatched sub-action kind".into())),
        }
    }

    async fn run(
        &self,
        sub: &SubAction,
        env: &HandlerEnv,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let SubAction::HttpCall {
            method,
            url,
            headers,
            body,
            timeout_secs,
        } = sub
        else {
            return Err(mismatch(self.kind()));
        };

        let method: reqwest::Method = method
            .to_uppercase()
            .parse()
            .map_err(|_| HandlerError::fatal(format!("invalid HTTP method '{}'", method)))?;
        let timeout =
            Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS));

        let mut request = env.http.request(method, url.as_str()).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let result = request.send().await;
        finish_http(result, url)
    }
}

// ── discord_export ──────────────────────────────────────────────────────────

pub struct DiscordExportHandler;

#[async_trait]
impl SubActionHandler for DiscordExportHandler {
    fn kind(&self) -> SubActionKind {
        SubActionKind::DiscordExport
    }

    fn validate(&self, sub: &SubAction) -> Result<(), StoreError> {
        match sub {
            SubAction::DiscordExport {
                webhook_url,
                content,
            } => {
                validate_url("discord_export webhook_url", webhook_url)?;
                if content.trim().is_empty() {
                    return Err(StoreError::Schema(
                        "discord_export requires non-empty content".into(),
                    ));
                }
                if content.len() > DISCORD_CONTENT_LIMIT {
                    return Err(StoreError::Schema(format!(
                        "discord_export content exceeds {} characters",
                        DISCORD_CONTENT_LIMIT
                    )));
                }
                Ok(())
            }
            _ => Err(StoreError::Schema("mismatched sub-action kind".into())),
        }
    }

    async fn run(
        &self,
        sub: &SubAction,
        env: &HandlerEnv,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let SubAction::DiscordExport {
            webhook_url,
            content,
        } = sub
        else {
            return Err(mismatch(self.kind()));
        };

        let result = env
            .http
            .post(webhook_url.as_str())
            .timeout(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await;
        finish_http(result, webhook_url)
    }
}

/// Map an HTTP outcome to a handler result using the shared transient
/// classification (429/408/5xx/connect/timeout retry; other 4xx are final).
fn finish_http(
    result: Result<reqwest::Response, reqwest::Error>,
    url: &str,
) -> Result<(), HandlerError> {
    match classify_reqwest_result(&result) {
        RetryDecision::Retry {
            reason,
            retry_after,
        } => {
            let message = match &result {
                Ok(resp) => format!("{} returned {}", url, resp.status()),
                Err(e) => format!("{} failed: {}", url, e),
            };
            Err(HandlerError::Recoverable {
                message,
                reason,
                retry_after,
            })
        }
        RetryDecision::DoNotRetry => match result {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(HandlerError::fatal(format!(
                "{} returned {}",
                url,
                resp.status()
            ))),
            Err(e) => Err(HandlerError::fatal(format!("{} failed: {}", url, e))),
        },
    }
}

// ── delay ───────────────────────────────────────────────────────────────────

pub struct DelayHandler;

#[async_trait]
impl SubActionHandler for DelayHandler {
    fn kind(&self) -> SubActionKind {
        SubActionKind::Delay
    }

    fn validate(&self, sub: &SubAction) -> Result<(), StoreError> {
        match sub {
            SubAction::Delay { millis } => {
                if *millis == 0 {
                    return Err(StoreError::Schema(
                        "delay millis must be greater than zero".into(),
                    ));
                }
                if *millis > MAX_DELAY_MILLIS {
                    return Err(StoreError::Schema(format!(
                        "delay millis must not exceed {}",
                        MAX_DELAY_MILLIS
                    )));
                }
                Ok(())
            }
            _ => Err(StoreError::Schema("mismatched sub-action kind".into())),
        }
    }

    async fn run(
        &self,
        sub: &SubAction,
        _env: &HandlerEnv,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let SubAction::Delay { millis } = sub else {
            return Err(mismatch(self.kind()));
        };
        // Suspends only this run. Cancellation cuts the wait short; the
        // executor then stops at the next sub-action boundary.
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(*millis)) => {}
            _ = cancel.cancelled() => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{LogChatSender, LogSoundPlayer};
    use serde_json::json;
    use strum::IntoEnumIterator;
    use tempfile::TempDir;

    fn env(temp: &TempDir) -> HandlerEnv {
        let variables =
            Arc::new(VariableStore::open(&temp.path().join("variables.db")).unwrap());
        HandlerEnv::new(variables, Arc::new(LogChatSender), Arc::new(LogSoundPlayer))
    }

    #[test]
    fn builtin_registry_covers_every_kind() {
        let registry = HandlerRegistry::builtin();
        for kind in SubActionKind::iter() {
            assert!(registry.get(kind).is_some(), "missing handler for {}", kind);
        }
    }

    #[test]
    fn schema_checks_reject_bad_parameters() {
        let registry = HandlerRegistry::builtin();

        let cases = vec![
            SubAction::SendChatMessage { text: "  ".into() },
            SubAction::PlaySound {
                path: "ding.ogg".into(),
                volume: 1.5,
            },
            SubAction::SetVariable {
                name: "vault:nope".into(),
                value: json!(1),
            },
            SubAction::HttpCall {
                method: "TRACE".into(),
                url: "https://example.com".into(),
                headers: Default::default(),
                body: None,
                timeout_secs: None,
            },
            SubAction::HttpCall {
                method: "GET".into(),
                url: "ftp://example.com".into(),
                headers: Default::default(),
                body: None,
                timeout_secs: None,
            },
            SubAction::Delay { millis: 0 },
        ];
        for sub in cases {
            assert!(registry.validate(&sub).is_err(), "expected rejection: {:?}", sub);
        }
    }

    #[test]
    fn schema_checks_accept_good_parameters() {
        let registry = HandlerRegistry::builtin();

        let subs = vec![
            SubAction::SendChatMessage {
                text: "Hello!".into(),
            },
            SubAction::PlaySound {
                path: "ding.ogg".into(),
                volume: 0.5,
            },
            SubAction::SetVariable {
                name: "greeting".into(),
                value: json!("hi"),
            },
            SubAction::HttpCall {
                method: "post".into(),
                url: "https://example.com/api".into(),
                headers: Default::default(),
                body: Some(json!({"k": "v"})),
                timeout_secs: Some(5),
            },
            SubAction::Delay { millis: 100 },
        ];
        assert!(registry.validate_all(&subs).is_ok());
    }

    #[test]
    fn templated_urls_skip_syntax_validation() {
        let registry = HandlerRegistry::builtin();
        let sub = SubAction::HttpCall {
            method: "GET".into(),
            url: "https://${event:host}/ping".into(),
            headers: Default::default(),
            body: None,
            timeout_secs: None,
        };
        assert!(registry.validate(&sub).is_ok());
    }

    #[test]
    fn validate_all_names_failing_index() {
        let registry = HandlerRegistry::builtin();
        let subs = vec![
            SubAction::SendChatMessage { text: "ok".into() },
            SubAction::Delay { millis: 0 },
        ];
        let err = registry.validate_all(&subs).unwrap_err();
        assert!(err.to_string().contains("sub-action 1"));
    }

    #[tokio::test]
    async fn set_variable_handler_writes_through() {
        let temp = TempDir::new().unwrap();
        let env = env(&temp);
        let cancel = CancellationToken::new();

        let sub = SubAction::SetVariable {
            name: "score".into(),
            value: json!(10),
        };
        SetVariableHandler
            .run(&sub, &env, &cancel)
            .await
            .unwrap();
        assert_eq!(env.variables.get("score").await.unwrap(), Some(json!(10)));
    }

    #[tokio::test]
    async fn delay_handler_honors_cancellation() {
        let temp = TempDir::new().unwrap();
        let env = env(&temp);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let sub = SubAction::Delay { millis: 60_000 };
        let start = std::time::Instant::now();
        DelayHandler.run(&sub, &env, &cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
