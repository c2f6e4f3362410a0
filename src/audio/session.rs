//! # Guild Session
//!
//! One actor per guild. Every command, node event, timer and presence change
//! for the guild is a [`SessionMessage`] on a single ordered inbox, so the
//! queue, the state machine and the node client are only ever touched by the
//! session task itself.
//!
//! The chat layer talks to a session through a cloneable [`SessionHandle`];
//! each command is answered with a [`SessionSnapshot`] or a typed
//! [`PlaybackError`]. Node events take a separate unbounded lane that a small
//! forwarder drains into the inbox, so routing them never waits on a busy
//! session.

use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::audio::{
    history::{HistoryBuffer, HistorySink, ListenClock, Notification, PlayHistoryEvent},
    permissions::{
        CommandKind, Decision, PermissionPolicy, PolicyContext, Requester, SkipVotes, VoteOutcome,
        VoteRule,
    },
    queue::{FinishKind, LoopMode, Position, Queue, QueueSnapshot},
    state::{Effect, Input, Notice, PlaybackState, PlaybackStateMachine},
};
use crate::config::Config;
use crate::error::PlaybackError;
use crate::node::{
    backoff_delay, AudioNodeClient, NodeError, NodeEvent, NodeRequest, NodeTransport, TrackEndReason,
};
use crate::sources::{Query, ResolveError, SharedTrack, TrackResolver};
use crate::storage::ConfigStore;
use crate::voice::VoiceRoster;

/// Ajustes por sesión derivados de [`Config`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub default_volume: u16,
    pub max_queue_size: usize,
    pub idle_timeout: Duration,
    pub empty_channel_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    pub reconnect_backoff_max: Duration,
    pub min_listen: Duration,
    pub vote_rule: VoteRule,
    pub inbox_capacity: usize,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            default_volume: config.default_volume,
            max_queue_size: config.max_queue_size,
            idle_timeout: config.idle_timeout,
            empty_channel_timeout: config.empty_channel_timeout,
            reconnect_attempts: config.reconnect_attempts,
            reconnect_backoff: config.reconnect_backoff,
            reconnect_backoff_max: config.reconnect_backoff_max,
            min_listen: config.min_listen,
            vote_rule: config.skip_vote_rule,
            inbox_capacity: config.session_inbox_capacity,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Colaboradores compartidos por todas las sesiones.
#[derive(Clone)]
pub struct SessionContext {
    pub settings: SessionSettings,
    pub transport: Arc<dyn NodeTransport>,
    pub resolver: Arc<dyn TrackResolver>,
    pub history: Arc<dyn HistorySink>,
    pub store: Arc<dyn ConfigStore>,
    pub roster: Arc<VoiceRoster>,
    pub notifier: mpsc::UnboundedSender<Notification>,
}

/// Intenciones ya validadas por la capa de chat.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Play { query: String },
    Pause,
    Resume,
    Skip,
    SkipTo { index: usize },
    Previous,
    Stop,
    Seek { position_ms: u64 },
    SetVolume { percent: u16 },
    /// Filtros del nodo, reenviados tal cual (debe ser un objeto JSON).
    SetFilters { filters: serde_json::Value },
    SetLoop { mode: LoopMode },
    Remove { index: usize },
    RemoveRange { count: usize },
    Move { from: usize, to: usize },
    Shuffle,
    Clear,
    Disconnect,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Play { .. } => CommandKind::Play,
            Command::Pause => CommandKind::Pause,
            Command::Resume => CommandKind::Resume,
            Command::Skip => CommandKind::Skip,
            Command::SkipTo { .. } => CommandKind::SkipTo,
            Command::Previous => CommandKind::Previous,
            Command::Stop => CommandKind::Stop,
            Command::Seek { .. } => CommandKind::Seek,
            Command::SetVolume { .. } => CommandKind::SetVolume,
            Command::SetFilters { .. } => CommandKind::SetFilters,
            Command::SetLoop { .. } => CommandKind::SetLoop,
            Command::Remove { .. } | Command::RemoveRange { .. } => CommandKind::Remove,
            Command::Move { .. } => CommandKind::Move,
            Command::Shuffle => CommandKind::Shuffle,
            Command::Clear => CommandKind::Clear,
            Command::Disconnect => CommandKind::Disconnect,
        }
    }

    /// Solo `play` crea una sesión nueva; el resto necesita una existente.
    pub fn creates_session(&self) -> bool {
        matches!(self, Command::Play { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Idle,
    Retry,
    EmptyChannel,
}

pub enum SessionMessage {
    Command {
        requester: Requester,
        command: Command,
        reply: oneshot::Sender<Result<SessionSnapshot, PlaybackError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Node(NodeEvent),
    Timer {
        kind: TimerKind,
        generation: u64,
    },
    PresenceChanged,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Vista de solo lectura de una sesión para renderizar.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub guild_id: GuildId,
    pub state: PlaybackState,
    pub current: Option<SharedTrack>,
    pub queue: QueueSnapshot,
    pub volume: u16,
    pub position_ms: u64,
    pub voice_channel: Option<ChannelId>,
}

impl SessionSnapshot {
    /// Snapshot de una guild sin sesión.
    pub fn idle(guild_id: GuildId, volume: u16) -> Self {
        Self {
            guild_id,
            state: PlaybackState::Idle,
            current: None,
            queue: Queue::new(0).snapshot(),
            volume,
            position_ms: 0,
            voice_channel: None,
        }
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.queue.loop_mode
    }

    pub fn total_len(&self) -> usize {
        self.queue.total_len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: PlaybackState,
    pub last_activity: Instant,
}

/// Referencia cloneable a una sesión en ejecución.
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    guild_id: GuildId,
    inbox: mpsc::Sender<SessionMessage>,
    events: mpsc::UnboundedSender<NodeEvent>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    /// Arranca el actor de la sesión y devuelve su handle junto a la tarea.
    pub fn spawn(id: u64, guild_id: GuildId, ctx: SessionContext) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(ctx.settings.inbox_capacity.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            state: PlaybackState::Idle,
            last_activity: Instant::now(),
        });

        let session = GuildSession::new(guild_id, ctx, tx.downgrade(), status_tx);
        let task = tokio::spawn(session.run(rx));
        tokio::spawn(forward_events(guild_id, events_rx, tx.downgrade()));

        let handle = Self {
            id,
            guild_id,
            inbox: tx,
            events: events_tx,
            status: status_rx,
        };
        (handle, task)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub async fn execute(
        &self,
        requester: Requester,
        command: Command,
    ) -> Result<SessionSnapshot, PlaybackError> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(SessionMessage::Command {
                requester,
                command,
                reply,
            })
            .await
            .map_err(|_| PlaybackError::SessionClosed)?;
        rx.await.map_err(|_| PlaybackError::SessionClosed)?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, PlaybackError> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(SessionMessage::Snapshot { reply })
            .await
            .map_err(|_| PlaybackError::SessionClosed)?;
        rx.await.map_err(|_| PlaybackError::SessionClosed)
    }

    /// Encola un evento del nodo sin esperar a la sesión. Devuelve `false`
    /// si la sesión ya cerró.
    pub fn forward(&self, event: NodeEvent) -> bool {
        !self.inbox.is_closed() && self.events.send(event).is_ok()
    }

    /// Entrega un evento por el inbox, esperando turno detrás de los comandos.
    #[cfg(test)]
    pub(crate) async fn deliver(&self, event: NodeEvent) -> bool {
        self.inbox.send(SessionMessage::Node(event)).await.is_ok()
    }

    pub async fn presence_changed(&self) {
        let _ = self.inbox.send(SessionMessage::PresenceChanged).await;
    }

    /// Pide a la sesión que se cierre y espera a que libere sus recursos.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .inbox
            .send(SessionMessage::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// Pasa los eventos del carril del nodo al inbox, en orden. Termina cuando la
/// sesión cierra o se sueltan todos los handles.
async fn forward_events(
    guild_id: GuildId,
    mut events: mpsc::UnboundedReceiver<NodeEvent>,
    inbox: mpsc::WeakSender<SessionMessage>,
) {
    while let Some(event) = events.recv().await {
        let Some(inbox) = inbox.upgrade() else {
            break;
        };
        if inbox.send(SessionMessage::Node(event)).await.is_err() {
            break;
        }
    }
    debug!("Carril de eventos de guild {} cerrado", guild_id);
}

/// Lo que un comando puede tocar antes de que el nodo lo confirme.
struct Checkpoint {
    state: PlaybackState,
    queue: Queue,
    volume: u16,
    filters: Option<serde_json::Value>,
    clock: ListenClock,
    votes: SkipVotes,
    previous_votes: SkipVotes,
    history_len: usize,
    seq: u64,
    start_offset: Duration,
    resume_paused: bool,
}

#[derive(Default)]
struct Timers {
    idle: Option<(u64, JoinHandle<()>)>,
    retry: Option<(u64, JoinHandle<()>)>,
    empty_channel: Option<(u64, JoinHandle<()>)>,
    generation: u64,
}

impl Timers {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<(u64, JoinHandle<()>)> {
        match kind {
            TimerKind::Idle => &mut self.idle,
            TimerKind::Retry => &mut self.retry,
            TimerKind::EmptyChannel => &mut self.empty_channel,
        }
    }

    fn is_armed(&mut self, kind: TimerKind) -> bool {
        self.slot(kind).is_some()
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, task)) = self.slot(kind).take() {
            task.abort();
        }
    }

    fn cancel_all(&mut self) {
        for kind in [TimerKind::Idle, TimerKind::Retry, TimerKind::EmptyChannel] {
            self.cancel(kind);
        }
    }

    /// `true` si el disparo corresponde al timer vigente de ese tipo.
    fn fire(&mut self, kind: TimerKind, generation: u64) -> bool {
        let slot = self.slot(kind);
        if matches!(*slot, Some((current, _)) if current == generation) {
            slot.take();
            true
        } else {
            false
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

struct GuildSession {
    guild_id: GuildId,
    ctx: SessionContext,
    policy: PermissionPolicy,
    queue: Queue,
    machine: PlaybackStateMachine,
    client: AudioNodeClient,
    votes: SkipVotes,
    previous_votes: SkipVotes,
    clock: ListenClock,
    history: HistoryBuffer,
    timers: Timers,
    inbox: mpsc::WeakSender<SessionMessage>,
    status: watch::Sender<SessionStatus>,
    volume: u16,
    filters: Option<serde_json::Value>,
    target_channel: Option<ChannelId>,
    reconnect_attempts: u32,
    resume_paused: bool,
    start_offset: Duration,
    last_activity: Instant,
    evicted: bool,
}

impl GuildSession {
    fn new(
        guild_id: GuildId,
        ctx: SessionContext,
        inbox: mpsc::WeakSender<SessionMessage>,
        status: watch::Sender<SessionStatus>,
    ) -> Self {
        Self {
            guild_id,
            policy: PermissionPolicy::new(ctx.settings.vote_rule),
            queue: Queue::new(ctx.settings.max_queue_size),
            machine: PlaybackStateMachine::new(),
            client: AudioNodeClient::new(guild_id, ctx.transport.clone()),
            votes: SkipVotes::new(),
            previous_votes: SkipVotes::new(),
            clock: ListenClock::default(),
            history: HistoryBuffer::default(),
            timers: Timers::default(),
            inbox,
            status,
            volume: ctx.settings.default_volume,
            filters: None,
            target_channel: None,
            reconnect_attempts: 0,
            resume_paused: false,
            start_offset: Duration::ZERO,
            last_activity: Instant::now(),
            evicted: false,
            ctx,
        }
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<SessionMessage>) {
        info!("🎵 Sesión iniciada para guild {}", self.guild_id);
        let mut shutdown_reply = None;

        while let Some(message) = inbox.recv().await {
            if let SessionMessage::Shutdown { reply } = message {
                shutdown_reply = Some(reply);
                break;
            }

            self.handle_message(message).await;

            if !self.history.is_empty() {
                self.history.flush(&self.ctx.history).await;
            }
            self.publish_status();

            if self.evicted {
                break;
            }
        }

        inbox.close();
        self.finalize().await;

        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Command {
                requester,
                command,
                reply,
            } => {
                self.last_activity = Instant::now();
                let result = self
                    .execute(requester, command)
                    .await
                    .map(|_| self.snapshot());
                let _ = reply.send(result);
            }
            SessionMessage::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionMessage::Node(event) => self.on_node_event(event).await,
            SessionMessage::Timer { kind, generation } => {
                if self.timers.fire(kind, generation) {
                    self.on_timer(kind).await;
                }
            }
            SessionMessage::PresenceChanged => self.check_presence().await,
            SessionMessage::Shutdown { .. } => {}
        }
    }

    // Comandos

    async fn execute(&mut self, requester: Requester, command: Command) -> Result<(), PlaybackError> {
        debug!("🎛️ Guild {}: {:?} de {}", self.guild_id, command, requester.user_id);
        self.authorize(&requester, &command).await?;

        let checkpoint = self.checkpoint();
        let result = self.apply_command(&requester, command).await;

        if let Err(e) = &result {
            if !e.is_user_error() {
                warn!("⚠️ Comando fallido en guild {}: {}", self.guild_id, e);
            }
            self.rollback(checkpoint).await;
        }
        result
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            state: self.machine.state(),
            queue: self.queue.clone(),
            volume: self.volume,
            filters: self.filters.clone(),
            clock: self.clock.clone(),
            votes: self.votes.clone(),
            previous_votes: self.previous_votes.clone(),
            history_len: self.history.len(),
            seq: self.client.seq(),
            start_offset: self.start_offset,
            resume_paused: self.resume_paused,
        }
    }

    /// Deja la sesión como estaba antes del comando y vuelve a armar los
    /// timers que el comando canceló por el camino.
    async fn rollback(&mut self, checkpoint: Checkpoint) {
        self.machine.restore(checkpoint.state);
        self.queue = checkpoint.queue;
        self.volume = checkpoint.volume;
        self.filters = checkpoint.filters;
        self.clock = checkpoint.clock;
        self.votes = checkpoint.votes;
        self.previous_votes = checkpoint.previous_votes;
        self.history.truncate(checkpoint.history_len);
        self.client.rewind(checkpoint.seq);
        self.start_offset = checkpoint.start_offset;
        self.resume_paused = checkpoint.resume_paused;

        match self.machine.state() {
            PlaybackState::Reconnecting if !self.timers.is_armed(TimerKind::Retry) => {
                let delay = backoff_delay(
                    self.ctx.settings.reconnect_backoff,
                    self.ctx.settings.reconnect_backoff_max,
                    self.reconnect_attempts.max(1),
                );
                self.schedule(TimerKind::Retry, delay);
            }
            PlaybackState::Idle if self.client.is_connected() && !self.timers.is_armed(TimerKind::Idle) => {
                self.schedule(TimerKind::Idle, self.ctx.settings.idle_timeout);
            }
            _ => {}
        }
        self.check_presence().await;
    }

    async fn apply_command(&mut self, requester: &Requester, command: Command) -> Result<(), PlaybackError> {
        match command {
            Command::Play { query } => {
                self.enqueue_query(requester, &query).await?;
                self.drive(Input::Play).await
            }
            Command::Pause => self.drive(Input::Pause).await,
            Command::Resume => self.drive(Input::Resume).await,
            Command::Skip => {
                info!("⏭️ Skip en guild {}", self.guild_id);
                self.drive(Input::Skip).await
            }
            Command::SkipTo { index } => {
                self.queue.mark_skip_to(index)?;
                self.drive(Input::Skip).await
            }
            Command::Previous => {
                let track = self.queue.requeue_previous().ok_or(PlaybackError::QueueEmpty)?;
                info!("⏮️ Volviendo a: {}", track.title());
                if self.machine.state().has_track() {
                    self.drive(Input::Skip).await
                } else {
                    self.target_channel = Some(self.voice_channel_for(requester)?);
                    self.drive(Input::Play).await
                }
            }
            Command::Stop => {
                info!("⏹️ Stop en guild {}", self.guild_id);
                self.drive(Input::Stop).await
            }
            Command::Seek { position_ms } => {
                let current = self
                    .queue
                    .peek_current()
                    .map(|entry| entry.track().clone())
                    .ok_or(PlaybackError::NothingPlaying)?;
                if current.is_stream() {
                    return Err(PlaybackError::InvalidInput("cannot seek a live stream".into()));
                }
                if let Some(duration) = current.duration() {
                    if Duration::from_millis(position_ms) > duration {
                        return Err(PlaybackError::InvalidInput(format!(
                            "position {}ms is past the end of the track",
                            position_ms
                        )));
                    }
                }
                self.drive(Input::Seek(position_ms)).await
            }
            Command::SetVolume { percent } => {
                if percent > 1000 {
                    return Err(PlaybackError::InvalidInput(format!(
                        "volume must be between 0 and 1000, got {}",
                        percent
                    )));
                }
                if percent > 100 {
                    debug!("🔊 Volumen amplificado a {}% en guild {}", percent, self.guild_id);
                }
                self.drive(Input::SetVolume(percent)).await
            }
            Command::SetFilters { filters } => {
                if !filters.is_object() {
                    return Err(PlaybackError::InvalidInput("filters must be a JSON object".into()));
                }
                debug!("🎚️ Filtros en guild {}: {}", self.guild_id, filters);
                self.filters = Some(filters);
                self.drive(Input::SetFilters).await
            }
            Command::SetLoop { mode } => {
                self.queue.set_loop_mode(mode);
                Ok(())
            }
            Command::Remove { index } => {
                let entry = self.queue.remove_at(index)?;
                debug!("❌ Removido: {}", entry.track().title());
                Ok(())
            }
            Command::RemoveRange { count } => {
                let removed = self.queue.remove_front(count)?;
                debug!("❌ Removidos {} tracks", removed);
                Ok(())
            }
            Command::Move { from, to } => Ok(self.queue.move_to(from, to)?),
            Command::Shuffle => {
                if self.queue.is_empty() {
                    return Err(PlaybackError::QueueEmpty);
                }
                self.queue.shuffle();
                Ok(())
            }
            Command::Clear => {
                self.queue.clear();
                Ok(())
            }
            Command::Disconnect => self.drive(Input::Leave).await,
        }
    }

    async fn authorize(&mut self, requester: &Requester, command: &Command) -> Result<(), PlaybackError> {
        let kind = command.kind();
        if !kind.is_restricted() {
            return Ok(());
        }

        let dj_role = match self.ctx.store.guild_settings(self.guild_id).await {
            Ok(settings) => settings.dj_role(),
            Err(e) => {
                warn!("⚠️ No se pudo leer configuración de guild {}: {}", self.guild_id, e);
                None
            }
        };
        let listeners = self.listeners(requester);
        let current = self.queue.peek_current();
        let ctx = PolicyContext {
            dj_role,
            listeners: &listeners,
            current_requester: current.map(|entry| entry.track().requester()),
        };

        match self.policy.can_execute(kind, requester, &ctx) {
            Decision::Allow => Ok(()),
            Decision::Deny => {
                debug!("🚫 {:?} denegado a {} en guild {}", kind, requester.user_id, self.guild_id);
                Err(PlaybackError::denied())
            }
            Decision::Vote => {
                let entry_id = current.map(|entry| entry.id()).ok_or(PlaybackError::NothingPlaying)?;
                let rule = self.policy.vote_rule();
                let votes = match kind {
                    CommandKind::Previous => &mut self.previous_votes,
                    _ => &mut self.votes,
                };
                match votes.cast(entry_id, requester.user_id, &listeners, rule) {
                    VoteOutcome::Passed => {
                        info!("🗳️ Votación de {:?} aprobada en guild {}", kind, self.guild_id);
                        Ok(())
                    }
                    VoteOutcome::Pending(tally) => {
                        info!(
                            "🗳️ Voto de {:?} en guild {}: {}/{}",
                            kind, self.guild_id, tally.votes, tally.required
                        );
                        Err(PlaybackError::PermissionDenied { vote: Some(tally) })
                    }
                }
            }
        }
    }

    async fn enqueue_query(&mut self, requester: &Requester, text: &str) -> Result<(), PlaybackError> {
        let channel_id = self.voice_channel_for(requester)?;

        let backend = match self.ctx.store.user_settings(requester.user_id).await {
            Ok(settings) => settings.search_backend,
            Err(e) => {
                warn!("⚠️ No se pudo leer configuración de usuario {}: {}", requester.user_id, e);
                Default::default()
            }
        };
        let query = Query::new(text, backend);
        if query.text.is_empty() {
            return Err(PlaybackError::InvalidInput("empty query".into()));
        }

        let tracks = self.ctx.resolver.resolve(&query, requester.user_id).await?;
        if tracks.is_empty() {
            return Err(ResolveError::NoMatches(query.text).into());
        }
        let tracks: Vec<SharedTrack> = tracks.into_iter().map(Arc::new).collect();

        let added = match tracks.len() {
            1 => {
                let track = tracks[0].clone();
                self.queue.enqueue(track.clone(), Position::Tail)?;
                info!("🎵 Agregado a la cola en guild {}: {}", self.guild_id, track.title());
                1
            }
            _ => self.queue.enqueue_many(tracks),
        };
        if added == 0 {
            return Err(PlaybackError::QueueFull(self.ctx.settings.max_queue_size));
        }

        if !self.client.is_connected() {
            self.target_channel = Some(channel_id);
        }
        Ok(())
    }

    fn voice_channel_for(&self, requester: &Requester) -> Result<ChannelId, PlaybackError> {
        requester
            .voice_channel
            .or_else(|| self.ctx.roster.channel_of(self.guild_id, requester.user_id))
            .ok_or_else(|| PlaybackError::InvalidInput("join a voice channel first".into()))
    }

    fn session_channel(&self) -> Option<ChannelId> {
        self.client.connected_channel().or(self.target_channel)
    }

    fn listeners(&self, requester: &Requester) -> Vec<UserId> {
        self.session_channel()
            .or(requester.voice_channel)
            .map(|channel| self.ctx.roster.humans_in(self.guild_id, channel))
            .unwrap_or_default()
    }

    // Eventos del nodo y timers

    async fn on_node_event(&mut self, event: NodeEvent) {
        let Some(event) = self.client.accept(event) else {
            return;
        };

        let input = match event {
            NodeEvent::TrackStarted { .. } => {
                self.last_activity = Instant::now();
                self.clock.start(std::mem::take(&mut self.start_offset));
                Input::TrackStarted
            }
            NodeEvent::TrackEnded { reason, .. } => {
                self.last_activity = Instant::now();
                Input::TrackEnded(reason)
            }
            NodeEvent::TrackException { message, .. } => {
                let title = self
                    .queue
                    .peek_current()
                    .map(|entry| entry.track().title().to_string())
                    .unwrap_or_default();
                warn!("❌ Error reproduciendo '{}' en guild {}: {}", title, self.guild_id, message);
                self.notify(Notification::TrackFailed {
                    guild_id: self.guild_id,
                    title,
                    message,
                });
                return;
            }
            NodeEvent::TrackStuck { threshold_ms, .. } => {
                warn!("⏳ Track atascado en guild {} ({}ms)", self.guild_id, threshold_ms);
                Input::TrackStuck
            }
            NodeEvent::PlayerUpdate { position_ms, .. } => {
                if self.machine.state().has_track() {
                    self.clock.sync(Duration::from_millis(position_ms));
                }
                Input::PositionUpdate
            }
            NodeEvent::ConnectionClosed { code, reason } => {
                warn!(
                    "📡 Conexión de voz cerrada en guild {} (código {}): {}",
                    self.guild_id, code, reason
                );
                Input::ConnectionLost
            }
            NodeEvent::ConnectionRestored => Input::ConnectionRestored,
        };

        let started = input == Input::TrackStarted;
        if let Err(e) = self.drive(input).await {
            self.recover(e).await;
            return;
        }

        if started {
            if self.resume_paused {
                self.resume_paused = false;
                if let Err(e) = self.drive(Input::Pause).await {
                    debug!("No se pudo restaurar la pausa: {}", e);
                }
            }
            if self.machine.state() == PlaybackState::Paused {
                self.clock.pause();
            }
        }
    }

    async fn on_timer(&mut self, kind: TimerKind) {
        let input = match kind {
            TimerKind::Idle => {
                info!("💤 Liberando voz por inactividad en guild {}", self.guild_id);
                Input::IdleTimeout
            }
            TimerKind::Retry => Input::RetryDue,
            TimerKind::EmptyChannel => {
                let still_empty = self
                    .client
                    .connected_channel()
                    .map(|channel| self.ctx.roster.humans_in(self.guild_id, channel).is_empty())
                    .unwrap_or(false);
                if !still_empty {
                    return;
                }
                info!("👋 Canal de voz vacío, saliendo de guild {}", self.guild_id);
                Input::Leave
            }
        };

        if let Err(e) = self.drive(input).await {
            self.recover(e).await;
        }
    }

    async fn check_presence(&mut self) {
        let Some(channel) = self.client.connected_channel() else {
            self.timers.cancel(TimerKind::EmptyChannel);
            return;
        };

        let humans = self.ctx.roster.humans_in(self.guild_id, channel);
        if humans.is_empty() {
            if !self.timers.is_armed(TimerKind::EmptyChannel) {
                debug!("⏲️ Canal vacío en guild {}, esperando {:?}", self.guild_id, self.ctx.settings.empty_channel_timeout);
                self.schedule(TimerKind::EmptyChannel, self.ctx.settings.empty_channel_timeout);
            }
        } else {
            self.timers.cancel(TimerKind::EmptyChannel);
        }
    }

    /// Un fallo del nodo fuera de un comando se trata como pérdida de conexión.
    async fn recover(&mut self, error: PlaybackError) {
        warn!("⚠️ Error del nodo en guild {}: {}", self.guild_id, error);
        if matches!(error, PlaybackError::NodeUnavailable(_)) {
            if let Err(e) = self.drive(Input::ConnectionLost).await {
                error!("❌ No se pudo recuperar la sesión de guild {}: {}", self.guild_id, e);
            }
        }
    }

    // Máquina de estados

    /// Aplica una entrada y todas las que sus efectos generen, en orden.
    /// Solo el rechazo de la primera entrada se devuelve como error.
    async fn drive(&mut self, input: Input) -> Result<(), PlaybackError> {
        let mut pending = VecDeque::from([input]);
        let mut first = true;

        while let Some(input) = pending.pop_front() {
            let from = self.machine.state();
            let effects = match self.machine.apply(&input) {
                Ok(effects) => effects,
                Err(e) if first => return Err(e),
                Err(e) => {
                    debug!("Entrada {:?} ignorada en {}: {}", input, from, e);
                    continue;
                }
            };
            first = false;

            if from != self.machine.state() {
                debug!("🔀 Guild {}: {} → {} ({:?})", self.guild_id, from, self.machine.state(), input);
            }

            for effect in effects {
                self.run_effect(effect, from, &mut pending).await?;
            }
        }
        Ok(())
    }

    async fn run_effect(
        &mut self,
        effect: Effect,
        from: PlaybackState,
        pending: &mut VecDeque<Input>,
    ) -> Result<(), PlaybackError> {
        match effect {
            Effect::Connect => {
                let channel_id = self
                    .session_channel()
                    .ok_or_else(|| PlaybackError::InvalidInput("join a voice channel first".into()))?;
                let fresh = self.client.connected_channel() != Some(channel_id);
                self.client.connect(channel_id).await.map_err(node_unavailable)?;
                // Un reproductor nuevo en el nodo no conoce los filtros
                if fresh {
                    self.push_filters(pending).await?;
                }
                pending.push_back(Input::VoiceReady);
            }
            Effect::LoadNext => self.load_next(pending).await?,
            Effect::ReloadCurrent => {
                self.timers.cancel(TimerKind::Retry);
                let current = self.queue.peek_current().map(|entry| entry.track().clone());
                let position = self.clock.position();
                let resumed = self
                    .client
                    .resume_after_reconnect(
                        current.as_ref(),
                        position.as_millis() as u64,
                        self.volume,
                        self.resume_paused,
                    )
                    .await;
                match resumed {
                    Ok(Some(seq)) => {
                        info!("▶️ Reanudando guild {} en {:?} (seq {})", self.guild_id, position, seq);
                        self.start_offset = position;
                        self.push_filters(pending).await?;
                    }
                    Ok(None) => pending.push_back(Input::VoiceReady),
                    Err(NodeError::ConnectionLost) => pending.push_back(Input::ConnectionLost),
                    Err(e) => return Err(node_unavailable(e)),
                }
            }
            Effect::NodePause => {
                self.node_command(NodeRequest::Pause, pending).await?;
                self.clock.pause();
            }
            Effect::NodeResume => {
                self.node_command(NodeRequest::Resume, pending).await?;
                self.clock.resume();
            }
            Effect::NodeStop => {
                if let Err(e) = self.client.stop().await {
                    debug!("Stop no confirmado por el nodo en guild {}: {}", self.guild_id, e);
                }
            }
            Effect::NodeSeek(position_ms) => {
                self.node_command(NodeRequest::Seek { position_ms }, pending).await?;
                self.clock.seek(Duration::from_millis(position_ms));
            }
            Effect::NodeVolume(percent) => {
                self.volume = percent;
                self.node_command(NodeRequest::SetVolume { percent }, pending).await?;
            }
            Effect::NodeFilters => self.push_filters(pending).await?,
            Effect::DeferPause(paused) => self.resume_paused = paused,
            Effect::DeferSeek(position_ms) => {
                let position = Duration::from_millis(position_ms);
                self.clock.seek(position);
                self.start_offset = position;
            }
            Effect::StoreVolume(percent) => self.volume = percent,
            Effect::Advance(reason) => self.advance(reason, pending),
            Effect::ClearQueue => {
                self.queue.reset();
                self.reset_votes();
                self.clock.stop();
                self.resume_paused = false;
            }
            Effect::Disconnect => {
                self.timers.cancel(TimerKind::EmptyChannel);
                if let Err(e) = self.client.disconnect().await {
                    warn!("⚠️ Error desconectando guild {}: {}", self.guild_id, e);
                }
                self.target_channel = None;
                pending.push_back(Input::Disconnected);
            }
            Effect::ScheduleReconnect => {
                match from {
                    PlaybackState::Reconnecting => {}
                    // Una pausa diferida mientras cargaba sigue en pie
                    PlaybackState::Connecting => self.clock.pause(),
                    _ => {
                        self.resume_paused = from == PlaybackState::Paused;
                        self.clock.pause();
                    }
                }
                self.reconnect_attempts += 1;
                if self.reconnect_attempts > self.ctx.settings.reconnect_attempts {
                    error!(
                        "❌ Reconexión agotada en guild {} tras {} intentos",
                        self.guild_id, self.ctx.settings.reconnect_attempts
                    );
                    pending.push_back(Input::RetriesExhausted);
                } else {
                    let delay = backoff_delay(
                        self.ctx.settings.reconnect_backoff,
                        self.ctx.settings.reconnect_backoff_max,
                        self.reconnect_attempts,
                    );
                    info!(
                        "🔄 Reintento {}/{} en guild {} en {:?}",
                        self.reconnect_attempts, self.ctx.settings.reconnect_attempts, self.guild_id, delay
                    );
                    self.schedule(TimerKind::Retry, delay);
                }
            }
            Effect::Reconnect => self.reconnect(pending).await,
            Effect::RetryNow => {
                info!("⏩ Comando durante la reconexión, reintentando ya en guild {}", self.guild_id);
                self.timers.cancel(TimerKind::Retry);
                self.reconnect(pending).await;
            }
            Effect::ScheduleIdleRelease => {
                self.schedule(TimerKind::Idle, self.ctx.settings.idle_timeout);
            }
            Effect::CancelIdleTimer => self.timers.cancel(TimerKind::Idle),
            Effect::CancelTimers => self.timers.cancel_all(),
            Effect::ResetReconnects => self.reconnect_attempts = 0,
            Effect::Evict => self.evicted = true,
            Effect::Notify(notice) => self.emit(notice),
        }
        Ok(())
    }

    async fn load_next(&mut self, pending: &mut VecDeque<Input>) -> Result<(), PlaybackError> {
        let Some(track) = self.queue.promote_next() else {
            pending.push_back(Input::QueueDrained);
            return Ok(());
        };

        self.reset_votes();
        self.start_offset = Duration::ZERO;
        self.resume_paused = false;
        match self.client.load_and_play(&track, 0, self.volume, false).await {
            Ok(seq) => {
                debug!("▶️ Cargando '{}' en guild {} (seq {})", track.title(), self.guild_id, seq);
                Ok(())
            }
            Err(NodeError::LoadRejected(message)) => {
                warn!("❌ El nodo rechazó '{}': {}", track.title(), message);
                self.notify(Notification::TrackFailed {
                    guild_id: self.guild_id,
                    title: track.title().to_string(),
                    message,
                });
                pending.push_back(Input::TrackEnded(TrackEndReason::LoadFailed));
                Ok(())
            }
            Err(NodeError::ConnectionLost) => {
                pending.push_back(Input::ConnectionLost);
                Ok(())
            }
            Err(e) => Err(node_unavailable(e)),
        }
    }

    /// Cierra el track actual según `reason` y decide qué sigue.
    fn advance(&mut self, reason: TrackEndReason, pending: &mut VecDeque<Input>) {
        let listened = self.clock.stop();
        let kind = match reason {
            TrackEndReason::Finished => FinishKind::Finished,
            TrackEndReason::LoadFailed => FinishKind::Failed,
            _ => FinishKind::Skipped,
        };

        if let Some(entry) = self.queue.finish_current(kind) {
            let counts = match kind {
                FinishKind::Finished => true,
                FinishKind::Failed => false,
                FinishKind::Skipped => listened >= self.ctx.settings.min_listen,
            };
            if counts {
                self.history
                    .push(PlayHistoryEvent::new(self.guild_id, entry.track(), listened));
            }
        }
        self.reset_votes();

        if self.queue.peek_next().is_some() {
            pending.push_back(Input::NextReady);
        } else {
            pending.push_back(Input::QueueDrained);
        }
    }

    async fn reconnect(&mut self, pending: &mut VecDeque<Input>) {
        match self.client.reconnect().await {
            Ok(()) => pending.push_back(Input::ConnectionRestored),
            Err(e) => {
                debug!("Reintento fallido en guild {}: {}", self.guild_id, e);
                pending.push_back(Input::ConnectionLost);
            }
        }
    }

    async fn push_filters(&mut self, pending: &mut VecDeque<Input>) -> Result<(), PlaybackError> {
        match self.filters.clone() {
            Some(filters) => self.node_command(NodeRequest::SetFilters { filters }, pending).await,
            None => Ok(()),
        }
    }

    fn reset_votes(&mut self) {
        self.votes.reset();
        self.previous_votes.reset();
    }

    async fn node_command(
        &mut self,
        request: NodeRequest,
        pending: &mut VecDeque<Input>,
    ) -> Result<(), PlaybackError> {
        match self.client.command(request).await {
            Ok(()) => Ok(()),
            // Se reintenta tras reconectar
            Err(NodeError::ConnectionLost) => {
                pending.push_back(Input::ConnectionLost);
                Ok(())
            }
            Err(e) => Err(node_unavailable(e)),
        }
    }

    fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.timers.generation += 1;
        let generation = self.timers.generation;
        let inbox = self.inbox.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(SessionMessage::Timer { kind, generation }).await;
            }
        });

        if let Some((_, previous)) = self.timers.slot(kind).replace((generation, task)) {
            previous.abort();
        }
    }

    fn emit(&self, notice: Notice) {
        let guild_id = self.guild_id;
        let notification = match notice {
            Notice::NowPlaying => match self.queue.peek_current() {
                Some(entry) => Notification::NowPlaying {
                    guild_id,
                    track: entry.track().clone(),
                },
                None => return,
            },
            Notice::QueueEnded => Notification::QueueEnded { guild_id },
            Notice::ConnectionFailed => Notification::ConnectionFailed {
                guild_id,
                attempts: self.ctx.settings.reconnect_attempts,
            },
            Notice::Left => Notification::Left { guild_id },
        };
        self.notify(notification);
    }

    fn notify(&self, notification: Notification) {
        if self.ctx.notifier.send(notification).is_err() {
            debug!("Nadie escucha notificaciones de guild {}", self.guild_id);
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let queue = self.queue.snapshot();
        SessionSnapshot {
            guild_id: self.guild_id,
            state: self.machine.state(),
            current: queue.current.clone(),
            queue,
            volume: self.volume,
            position_ms: self.clock.position().as_millis() as u64,
            voice_channel: self.client.connected_channel(),
        }
    }

    fn publish_status(&self) {
        self.status.send_replace(SessionStatus {
            state: self.machine.state(),
            last_activity: self.last_activity,
        });
    }

    /// Libera todo lo que la sesión tiene: timers, historial pendiente y voz.
    async fn finalize(&mut self) {
        self.timers.cancel_all();

        if let Some(entry) = self.queue.peek_current() {
            let track = entry.track().clone();
            let listened = self.clock.stop();
            if listened >= self.ctx.settings.min_listen {
                self.history
                    .push(PlayHistoryEvent::new(self.guild_id, &track, listened));
            }
        }

        if !self.history.is_empty() {
            self.history.flush(&self.ctx.history).await;
            if !self.history.is_empty() {
                warn!(
                    "⚠️ {} eventos de historial descartados en guild {}",
                    self.history.len(),
                    self.guild_id
                );
            }
        }

        if let Err(e) = self.client.disconnect().await {
            warn!("⚠️ Error liberando voz en guild {}: {}", self.guild_id, e);
        }

        self.status.send_replace(SessionStatus {
            state: PlaybackState::Idle,
            last_activity: self.last_activity,
        });
        info!("🛑 Sesión finalizada para guild {}", self.guild_id);
    }
}

fn node_unavailable(error: NodeError) -> PlaybackError {
    PlaybackError::NodeUnavailable(error.to_string())
}
