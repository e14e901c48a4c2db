//! Side-effect provider seams.
//!
//! Chat delivery and sound playback are platform integrations owned by
//! external collaborators; the engine only depends on these traits. The
//! default implementations log the effect so a daemon without a connected
//! platform still runs actions end to end.

use async_trait::async_trait;

/// Sends a chat message to the connected streaming platform.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send(&self, text: &str) -> anyhow::Result<()>;
}

/// Plays a sound file on the streaming machine.
#[async_trait]
pub trait SoundPlayer: Send + Sync {
    async fn play(&self, path: &str, volume: f64) -> anyhow::Result<()>;
}

/// Chat sender used when no platform connection is configured.
pub struct LogChatSender;

#[async_trait]
impl ChatSender for LogChatSender {
    async fn send(&self, text: &str) -> anyhow::Result<()> {
        eprintln!("[chat] {}", text);
        Ok(())
    }
}

/// Sound player used when no audio backend is configured.
pub struct LogSoundPlayer;

#[async_trait]
impl SoundPlayer for LogSoundPlayer {
    async fn play(&self, path: &str, volume: f64) -> anyhow::Result<()> {
        eprintln!("[sound] play {} (volume {:.2})", path, volume);
        Ok(())
    }
}
