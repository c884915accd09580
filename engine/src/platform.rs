use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::MemberPresence;

/// A voice channel a session streams into.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Destination {
    pub guild_id: String,
    pub channel_id: String,
    /// Stage channels need the speaker to be unsuppressed after joining.
    pub stage: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoiceLookup {
    UnknownMember,
    NotInVoice,
    InChannel(Destination),
}

/// The chat/voice platform client.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn voice_channel_of(&self, guild_id: &str, user_id: &str) -> anyhow::Result<VoiceLookup>;

    /// Join `destination`, leaving whatever we were connected to before.
    async fn join(&self, destination: &Destination) -> anyhow::Result<()>;

    async fn leave(&self) -> anyhow::Result<()>;

    async fn notify(&self, channel_id: &str, text: &str) -> anyhow::Result<()>;
}

/// Platform adapter backed by a configured presence directory.
///
/// Joins are tracked in memory and notifications go to the log under the
/// `notify` target, which is enough to drive the engine from a bot that
/// already knows where its users are.
pub struct StaticPlatform {
    directory: Vec<MemberPresence>,
    connected: Mutex<Option<Destination>>,
}

impl StaticPlatform {
    pub fn new(directory: Vec<MemberPresence>) -> Self {
        Self { directory, connected: Mutex::new(None) }
    }

    #[cfg(test)]
    pub fn connected(&self) -> Option<Destination> {
        self.connected.lock().ok().and_then(|c| c.clone())
    }

    fn set_connected(&self, dest: Option<Destination>) -> anyhow::Result<Option<Destination>> {
        let mut guard = self
            .connected
            .lock()
            .map_err(|_| anyhow::anyhow!("voice connection state poisoned"))?;
        Ok(std::mem::replace(&mut *guard, dest))
    }
}

#[async_trait]
impl Platform for StaticPlatform {
    async fn voice_channel_of(&self, guild_id: &str, user_id: &str) -> anyhow::Result<VoiceLookup> {
        let Some(member) = self
            .directory
            .iter()
            .find(|m| m.guild_id == guild_id && m.user_id == user_id)
        else {
            return Ok(VoiceLookup::UnknownMember);
        };

        Ok(match &member.channel_id {
            Some(channel_id) => VoiceLookup::InChannel(Destination {
                guild_id: member.guild_id.clone(),
                channel_id: channel_id.clone(),
                stage: member.stage,
            }),
            None => VoiceLookup::NotInVoice,
        })
    }

    async fn join(&self, destination: &Destination) -> anyhow::Result<()> {
        let previous = self.set_connected(Some(destination.clone()))?;
        if let Some(prev) = previous.filter(|p| p != destination) {
            tracing::info!("voice: left {}/{}", prev.guild_id, prev.channel_id);
        }
        tracing::info!("voice: joined {}/{}", destination.guild_id, destination.channel_id);
        if destination.stage {
            tracing::info!("voice: unsuppressed on stage {}", destination.channel_id);
        }
        Ok(())
    }

    async fn leave(&self) -> anyhow::Result<()> {
        match self.set_connected(None)? {
            Some(prev) => tracing::info!("voice: left {}/{}", prev.guild_id, prev.channel_id),
            None => tracing::debug!("voice: leave requested while not connected"),
        }
        Ok(())
    }

    async fn notify(&self, channel_id: &str, text: &str) -> anyhow::Result<()> {
        tracing::info!(target: "notify", channel = channel_id, "{text}");
        Ok(())
    }
}
