//! # Session Registry
//!
//! Process-wide `GuildId → SessionHandle` table. Creation goes through the
//! map's entry API so concurrent callers for the same guild always end up with
//! the same session. Every spawned session gets a reaper task that drops its
//! entry when the actor exits (eviction, shutdown or panic), matching on the
//! session id so a newer session for the same guild is never removed by an
//! older reaper.

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use serenity::model::id::GuildId;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::audio::{
    permissions::Requester,
    queue::LoopMode,
    session::{Command, SessionContext, SessionHandle, SessionSnapshot},
    state::PlaybackState,
};
use crate::error::PlaybackError;
use crate::node::{NodeEvent, NodeEventReceiver};

pub struct SessionRegistry {
    sessions: Arc<DashMap<GuildId, SessionHandle>>,
    ctx: SessionContext,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(ctx: SessionContext) -> Arc<Self> {
        Arc::new(Self {
            sessions: Arc::new(DashMap::new()),
            ctx,
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Devuelve la sesión de la guild o crea una de forma atómica.
    pub fn get_or_create(&self, guild_id: GuildId) -> SessionHandle {
        match self.sessions.entry(guild_id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_closed() {
                    debug!("♻️ Reemplazando sesión cerrada de guild {}", guild_id);
                    occupied.insert(self.spawn_session(guild_id));
                }
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => vacant.insert(self.spawn_session(guild_id)).value().clone(),
        }
    }

    pub fn get(&self, guild_id: GuildId) -> Option<SessionHandle> {
        self.sessions
            .get(&guild_id)
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.is_closed())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // Superficie de comandos

    pub async fn play(
        &self,
        guild_id: GuildId,
        requester: Requester,
        query: impl Into<String>,
    ) -> Result<SessionSnapshot, PlaybackError> {
        let query = query.into();
        self.dispatch(guild_id, requester, Command::Play { query }).await
    }

    pub async fn pause(&self, guild_id: GuildId, requester: Requester) -> Result<SessionSnapshot, PlaybackError> {
        self.dispatch(guild_id, requester, Command::Pause).await
    }

    pub async fn resume(&self, guild_id: GuildId, requester: Requester) -> Result<SessionSnapshot, PlaybackError> {
        self.dispatch(guild_id, requester, Command::Resume).await
    }

    pub async fn skip(&self, guild_id: GuildId, requester: Requester) -> Result<SessionSnapshot, PlaybackError> {
        self.dispatch(guild_id, requester, Command::Skip).await
    }

    pub async fn stop(&self, guild_id: GuildId, requester: Requester) -> Result<SessionSnapshot, PlaybackError> {
        self.dispatch(guild_id, requester, Command::Stop).await
    }

    pub async fn seek(
        &self,
        guild_id: GuildId,
        requester: Requester,
        position_ms: u64,
    ) -> Result<SessionSnapshot, PlaybackError> {
        self.dispatch(guild_id, requester, Command::Seek { position_ms }).await
    }

    pub async fn set_volume(
        &self,
        guild_id: GuildId,
        requester: Requester,
        percent: u16,
    ) -> Result<SessionSnapshot, PlaybackError> {
        self.dispatch(guild_id, requester, Command::SetVolume { percent }).await
    }

    pub async fn set_loop_mode(
        &self,
        guild_id: GuildId,
        requester: Requester,
        mode: LoopMode,
    ) -> Result<SessionSnapshot, PlaybackError> {
        self.dispatch(guild_id, requester, Command::SetLoop { mode }).await
    }

    pub async fn disconnect(&self, guild_id: GuildId, requester: Requester) -> Result<SessionSnapshot, PlaybackError> {
        self.dispatch(guild_id, requester, Command::Disconnect).await
    }

    /// Envía un comando a la sesión de la guild. Solo `play` crea sesión; si
    /// la sesión cerró justo antes de recibirlo, se reintenta una vez con una
    /// sesión nueva.
    pub async fn dispatch(
        &self,
        guild_id: GuildId,
        requester: Requester,
        command: Command,
    ) -> Result<SessionSnapshot, PlaybackError> {
        let handle = if command.creates_session() {
            self.get_or_create(guild_id)
        } else {
            self.get(guild_id).ok_or(PlaybackError::NothingPlaying)?
        };

        match handle.execute(requester.clone(), command.clone()).await {
            Err(PlaybackError::SessionClosed) if command.creates_session() => {
                debug!("🔁 Sesión de guild {} cerró en vuelo, reintentando", guild_id);
                self.get_or_create(guild_id).execute(requester, command).await
            }
            Err(PlaybackError::SessionClosed) => Err(PlaybackError::NothingPlaying),
            other => other,
        }
    }

    pub async fn get_snapshot(&self, guild_id: GuildId) -> SessionSnapshot {
        let idle = || SessionSnapshot::idle(guild_id, self.ctx.settings.default_volume);
        match self.get(guild_id) {
            Some(handle) => handle.snapshot().await.unwrap_or_else(|_| idle()),
            None => idle(),
        }
    }

    /// Saca la sesión del registro, espera a que entregue el historial
    /// pendiente y libere la voz.
    pub async fn remove(&self, guild_id: GuildId) -> bool {
        match self.sessions.remove(&guild_id) {
            Some((_, handle)) => {
                handle.shutdown().await;
                info!("🗑️ Sesión de guild {} removida", guild_id);
                true
            }
            None => false,
        }
    }

    // Eventos externos

    /// Pasa el evento al carril de la sesión sin esperarla: una guild con el
    /// inbox lleno no frena los eventos de las demás.
    pub fn route_node_event(&self, guild_id: GuildId, event: NodeEvent) {
        match self.get(guild_id) {
            Some(handle) => {
                if !handle.forward(event) {
                    debug!("Sesión de guild {} cerró antes de recibir el evento", guild_id);
                }
            }
            None => debug!("Evento del nodo para guild {} sin sesión: {:?}", guild_id, event),
        }
    }

    pub async fn notify_presence(&self, guild_id: GuildId) {
        if let Some(handle) = self.get(guild_id) {
            handle.presence_changed().await;
        }
    }

    /// Expulsa las sesiones en `idle` sin actividad durante `window`.
    pub async fn sweep_idle(&self, window: Duration) -> usize {
        let is_stale = |handle: &SessionHandle| {
            let status = handle.status();
            handle.is_closed()
                || (status.state == PlaybackState::Idle && status.last_activity.elapsed() >= window)
        };

        let candidates: Vec<GuildId> = self
            .sessions
            .iter()
            .filter(|entry| is_stale(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = 0;
        for guild_id in candidates {
            // Se vuelve a comprobar: pudo llegar un comando entre medio
            if let Some((_, handle)) = self.sessions.remove_if(&guild_id, |_, handle| is_stale(handle)) {
                handle.shutdown().await;
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!("🧹 {} sesiones inactivas expulsadas", evicted);
        }
        evicted
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, window: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = registry.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep_idle(window).await;
                    }
                }
            }
            debug!("Barrido de sesiones detenido");
        })
    }

    pub fn spawn_event_router(self: &Arc<Self>, mut events: NodeEventReceiver) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = registry.shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some((guild_id, event)) => registry.route_node_event(guild_id, event),
                        None => break,
                    },
                }
            }
            debug!("Router de eventos del nodo detenido");
        })
    }

    /// Cierra todas las sesiones (apagado del proceso).
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let guilds: Vec<GuildId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        info!("🛑 Cerrando {} sesiones", guilds.len());
        join_all(guilds.into_iter().map(|guild_id| self.remove(guild_id))).await;
    }

    fn spawn_session(&self, guild_id: GuildId) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (handle, task) = SessionHandle::spawn(id, guild_id, self.ctx.clone());

        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!("💥 La sesión de guild {} terminó de forma anormal: {}", guild_id, e);
            }
            sessions.remove_if(&guild_id, |_, handle| handle.id() == id);
        });

        debug!("✨ Nueva sesión {} para guild {}", id, guild_id);
        handle
    }
}
