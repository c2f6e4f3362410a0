//! # Audio Module
//!
//! Per-guild playback session engine.
//!
//! ## Architecture
//!
//! ### [`registry`] - Session Registry
//! - One [`GuildSession`](session) per guild, created atomically on the first `play`
//! - Idle sweep and eviction with guaranteed voice release
//!
//! ### [`session`] - Guild Session
//! - Single ordered inbox per guild (commands, node events, timers)
//! - Composes the queue, the state machine, the node client and the policy
//!
//! ### [`state`] - Playback State Machine
//! - Pure `(state, input) → (state, effects)` transition table
//!
//! ### [`queue`] - Queue Management
//! - Insertion-ordered entries, loop modes, one-shot skip-to marker
//! - Bounded history for `previous`
//!
//! ### [`permissions`] / [`history`]
//! - DJ role, sole-listener rule and skip votes
//! - Listen accounting, play history events and user-facing notifications
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_music_engine::audio::{permissions::Requester, registry::SessionRegistry, session::SessionContext};
//! use serenity::all::{ChannelId, GuildId, UserId};
//!
//! # async fn example(ctx: SessionContext) -> Result<(), open_music_engine::error::PlaybackError> {
//! let registry = SessionRegistry::new(ctx);
//! let guild_id = GuildId::new(123456789);
//! let requester = Requester::new(UserId::new(42)).in_channel(ChannelId::new(7));
//!
//! registry.play(guild_id, requester.clone(), "never gonna give you up").await?;
//! registry.pause(guild_id, requester.clone()).await?;
//! registry.resume(guild_id, requester).await?;
//! # Ok(())
//! # }
//! ```

pub mod history;
pub mod permissions;
pub mod queue;
pub mod registry;
pub mod session;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use registry::SessionRegistry;
pub use session::{Command, SessionContext, SessionHandle, SessionSettings, SessionSnapshot};
pub use state::PlaybackState;
