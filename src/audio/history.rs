//! Play history and user-facing notifications.
//!
//! Sessions measure how long each track was actually heard with a
//! [`ListenClock`], buffer the resulting [`PlayHistoryEvent`]s and hand them to
//! a [`HistorySink`]. Sinks must accumulate idempotently per `(user, track)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::model::id::{GuildId, UserId};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::sources::SharedTrack;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayHistoryEvent {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub track_id: String,
    pub title: String,
    pub listened: Duration,
    pub finished_at: DateTime<Utc>,
}

impl PlayHistoryEvent {
    pub fn new(guild_id: GuildId, track: &SharedTrack, listened: Duration) -> Self {
        Self {
            guild_id,
            user_id: track.requester(),
            track_id: track.identifier().to_string(),
            title: track.title().to_string(),
            listened,
            finished_at: Utc::now(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, event: PlayHistoryEvent) -> anyhow::Result<()>;
}

/// Eventos pendientes de entregar al sink.
#[derive(Debug, Default)]
pub struct HistoryBuffer {
    pending: VecDeque<PlayHistoryEvent>,
}

impl HistoryBuffer {
    pub fn push(&mut self, event: PlayHistoryEvent) {
        debug!("📝 Historial: {} escuchó '{}' ({:?})", event.user_id, event.title, event.listened);
        self.pending.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Descarta lo añadido después de que el buffer tuviera `len` eventos.
    pub fn truncate(&mut self, len: usize) {
        self.pending.truncate(len);
    }

    /// Entrega todo lo pendiente. Los eventos que el sink rechaza se
    /// conservan para el siguiente intento.
    pub async fn flush(&mut self, sink: &Arc<dyn HistorySink>) -> usize {
        let mut delivered = 0;
        while let Some(event) = self.pending.pop_front() {
            if let Err(e) = sink.record(event.clone()).await {
                warn!("⚠️ No se pudo guardar historial: {}", e);
                self.pending.push_front(event);
                break;
            }
            delivered += 1;
        }
        delivered
    }
}

/// Mide la posición y el tiempo realmente escuchado de un track.
#[derive(Debug, Default, Clone)]
pub struct ListenClock {
    started: Option<Instant>,
    accumulated: Duration,
    offset: Duration,
}

impl ListenClock {
    /// Arranca desde `offset` (una recarga tras reconexión empieza a mitad del track).
    pub fn start(&mut self, offset: Duration) {
        self.started = Some(Instant::now());
        self.accumulated = Duration::ZERO;
        self.offset = offset;
    }

    pub fn pause(&mut self) {
        if let Some(started) = self.started.take() {
            self.accumulated += started.elapsed();
        }
    }

    pub fn resume(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    /// Tiempo escuchado desde el último `start`.
    pub fn listened(&self) -> Duration {
        self.accumulated + self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn position(&self) -> Duration {
        self.offset + self.listened()
    }

    /// Un seek mueve la posición pero no cuenta como tiempo escuchado.
    pub fn seek(&mut self, position: Duration) {
        let listened = self.listened();
        self.offset = position.saturating_sub(listened);
    }

    /// Corrige la posición con la que reporta el nodo.
    pub fn sync(&mut self, position: Duration) {
        self.seek(position);
    }

    pub fn stop(&mut self) -> Duration {
        let listened = self.listened();
        *self = Self::default();
        listened
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    NowPlaying {
        guild_id: GuildId,
        track: SharedTrack,
    },
    QueueEnded {
        guild_id: GuildId,
    },
    TrackFailed {
        guild_id: GuildId,
        title: String,
        message: String,
    },
    ConnectionFailed {
        guild_id: GuildId,
        attempts: u32,
    },
    Left {
        guild_id: GuildId,
    },
}

impl Notification {
    pub fn guild_id(&self) -> GuildId {
        match self {
            Notification::NowPlaying { guild_id, .. }
            | Notification::QueueEnded { guild_id }
            | Notification::TrackFailed { guild_id, .. }
            | Notification::ConnectionFailed { guild_id, .. }
            | Notification::Left { guild_id } => *guild_id,
        }
    }
}
