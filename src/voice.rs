//! Voice-channel roster.
//!
//! Tracks who sits in which voice channel per guild, fed by the gateway's
//! voice state updates. The permission policy and skip votes only ever look at
//! human occupants.

use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupant {
    pub channel_id: ChannelId,
    pub bot: bool,
}

#[derive(Debug, Default)]
pub struct VoiceRoster {
    guilds: DashMap<GuildId, HashMap<UserId, Occupant>>,
}

impl VoiceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aplica un cambio de estado de voz. `None` significa que el usuario salió.
    pub fn update(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        channel_id: Option<ChannelId>,
        bot: bool,
    ) {
        let mut guild = self.guilds.entry(guild_id).or_default();
        match channel_id {
            Some(channel_id) => {
                guild.insert(user_id, Occupant { channel_id, bot });
            }
            None => {
                guild.remove(&user_id);
            }
        }
        debug!("🎙️ Roster de guild {}: {} ocupantes", guild_id, guild.len());
    }

    pub fn channel_of(&self, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
        self.guilds
            .get(&guild_id)
            .and_then(|guild| guild.get(&user_id).map(|o| o.channel_id))
    }

    /// Humanos presentes en el canal, ordenados por id.
    pub fn humans_in(&self, guild_id: GuildId, channel_id: ChannelId) -> Vec<UserId> {
        let mut humans: Vec<UserId> = self
            .guilds
            .get(&guild_id)
            .map(|guild| {
                guild
                    .iter()
                    .filter(|(_, o)| o.channel_id == channel_id && !o.bot)
                    .map(|(user, _)| *user)
                    .collect()
            })
            .unwrap_or_default();
        humans.sort();
        humans
    }

    pub fn clear_guild(&self, guild_id: GuildId) {
        self.guilds.remove(&guild_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_humans_exclude_bots_and_other_channels() {
        let roster = VoiceRoster::new();
        let guild = GuildId::new(1);
        let music = ChannelId::new(10);
        let lobby = ChannelId::new(11);

        roster.update(guild, UserId::new(3), Some(music), false);
        roster.update(guild, UserId::new(1), Some(music), false);
        roster.update(guild, UserId::new(2), Some(lobby), false);
        roster.update(guild, UserId::new(50), Some(music), true);

        assert_eq!(roster.humans_in(guild, music), vec![UserId::new(1), UserId::new(3)]);
        assert_eq!(roster.channel_of(guild, UserId::new(50)), Some(music));
        assert_eq!(roster.channel_of(guild, UserId::new(2)), Some(lobby));
    }

    #[test]
    fn test_leaving_and_moving() {
        let roster = VoiceRoster::new();
        let guild = GuildId::new(1);
        roster.update(guild, UserId::new(1), Some(ChannelId::new(10)), false);
        roster.update(guild, UserId::new(1), Some(ChannelId::new(12)), false);
        assert!(roster.humans_in(guild, ChannelId::new(10)).is_empty());
        roster.update(guild, UserId::new(1), None, false);
        assert_eq!(roster.channel_of(guild, UserId::new(1)), None);
    }
}
