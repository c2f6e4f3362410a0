//! # Bot Module
//!
//! Gateway glue between Discord and the session engine.
//!
//! Command parsing and rendering live in the chat layer; this handler only
//! keeps the [`VoiceRoster`] current and tells the [`SessionRegistry`] when a
//! guild's voice presence changes, so sessions can start or cancel their
//! empty-channel timer. If the bot itself is disconnected from voice, the
//! guild's session is torn down.

use serenity::{
    all::{Context, EventHandler, Guild, Ready, VoiceState},
    async_trait,
};
use std::sync::Arc;
use tracing::{debug, info};

use crate::audio::SessionRegistry;
use crate::voice::VoiceRoster;

pub struct MusicEventHandler {
    registry: Arc<SessionRegistry>,
    roster: Arc<VoiceRoster>,
}

impl MusicEventHandler {
    pub fn new(registry: Arc<SessionRegistry>, roster: Arc<VoiceRoster>) -> Self {
        Self { registry, roster }
    }
}

fn is_bot(state: &VoiceState) -> bool {
    state.member.as_ref().is_some_and(|member| member.user.bot)
}

#[async_trait]
impl EventHandler for MusicEventHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());
    }

    /// Siembra el roster con quienes ya estaban en canales de voz.
    async fn guild_create(&self, _ctx: Context, guild: Guild, _is_new: Option<bool>) {
        self.roster.clear_guild(guild.id);
        for (user_id, state) in &guild.voice_states {
            let bot = state.member.as_ref().map(|m| m.user.bot).unwrap_or_else(|| {
                guild
                    .members
                    .get(user_id)
                    .is_some_and(|member| member.user.bot)
            });
            self.roster.update(guild.id, *user_id, state.channel_id, bot);
        }
        debug!("🎙️ Guild {}: {} estados de voz cargados", guild.id, guild.voice_states.len());
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };

        self.roster
            .update(guild_id, new.user_id, new.channel_id, is_bot(&new));

        let current_user_id = ctx.cache.current_user().id;
        if new.user_id == current_user_id && old.is_some() && new.channel_id.is_none() {
            info!("🔌 Bot desconectado en guild {}", guild_id);
            self.registry.remove(guild_id).await;
            return;
        }

        self.registry.notify_presence(guild_id).await;
    }
}
