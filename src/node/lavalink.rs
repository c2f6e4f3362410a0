//! Lavalink v4 transport.
//!
//! Requests go over REST (`PATCH`/`DELETE` on the session's players), events
//! arrive on one websocket per process. The websocket reconnects forever with
//! bounded backoff; while it is down every guild with a live player sees a
//! `connectionClosed` and handles its own retry budget.

use async_trait::async_trait;
use dashmap::DashSet;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::{header::AUTHORIZATION, StatusCode};
use serenity::model::id::{ChannelId, GuildId, UserId};
use songbird::{error::JoinError, Songbird};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    backoff_delay,
    protocol::{
        parse_guild_id, IncomingMessage, LoadResult, PlayerPatch, SessionPatch, TrackPatch,
        VoicePatch,
    },
    NodeError, NodeEvent, NodeEventSender, NodeRequest, NodeTransport,
};
use crate::config::Config;
use crate::sources::node_search::TrackLoader;

const CLIENT_NAME: &str = concat!("open-music-engine/", env!("CARGO_PKG_VERSION"));
const RESUME_TIMEOUT_SECS: u64 = 60;
const LINK_BACKOFF_BASE: Duration = Duration::from_secs(1);
const LINK_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSettings {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub secure: bool,
}

impl NodeSettings {
    pub fn rest_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}/v4", scheme, self.host, self.port)
    }

    pub fn websocket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/v4/websocket", scheme, self.host, self.port)
    }
}

impl From<&Config> for NodeSettings {
    fn from(config: &Config) -> Self {
        Self {
            host: config.lavalink_host.clone(),
            port: config.lavalink_port,
            password: config.lavalink_password.clone(),
            secure: config.lavalink_secure,
        }
    }
}

/// Datos del servidor de voz de Discord que el nodo necesita.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceServerInfo {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

/// Lado Discord de la conexión de voz: unirse al canal y obtener credenciales.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<VoiceServerInfo, NodeError>;
    async fn leave(&self, guild_id: GuildId) -> Result<(), NodeError>;
}

/// Usa songbird solo para la negociación con el gateway; el audio lo envía el nodo.
pub struct SongbirdGateway {
    manager: Arc<Songbird>,
}

impl SongbirdGateway {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl VoiceGateway for SongbirdGateway {
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<VoiceServerInfo, NodeError> {
        let (info, _call) = self
            .manager
            .join_gateway(guild_id, channel_id)
            .await
            .map_err(|e| NodeError::Unavailable(format!("voice join failed: {}", e)))?;

        Ok(VoiceServerInfo {
            token: info.token,
            endpoint: info.endpoint,
            session_id: info.session_id,
        })
    }

    async fn leave(&self, guild_id: GuildId) -> Result<(), NodeError> {
        match self.manager.remove(guild_id).await {
            Ok(()) | Err(JoinError::NoCall) => Ok(()),
            Err(e) => Err(NodeError::Unavailable(format!("voice leave failed: {}", e))),
        }
    }
}

pub struct LavalinkNode {
    http: reqwest::Client,
    settings: NodeSettings,
    user_id: UserId,
    session_id: RwLock<Option<String>>,
    resume_from: RwLock<Option<String>>,
    players: DashSet<GuildId>,
    gateway: Arc<dyn VoiceGateway>,
    events: NodeEventSender,
}

impl LavalinkNode {
    pub fn new(
        settings: NodeSettings,
        user_id: UserId,
        gateway: Arc<dyn VoiceGateway>,
        events: NodeEventSender,
    ) -> Result<Arc<Self>, NodeError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(CLIENT_NAME)
            .build()
            .map_err(|e| NodeError::Unavailable(e.to_string()))?;

        info!("🎼 Configurando nodo de audio en {}:{}", settings.host, settings.port);

        Ok(Arc::new(Self {
            http,
            settings,
            user_id,
            session_id: RwLock::new(None),
            resume_from: RwLock::new(None),
            players: DashSet::new(),
            gateway,
            events,
        }))
    }

    /// Lanza el loop del websocket. Termina cuando se cancela `shutdown`.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move { node.run(shutdown).await })
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.listen() => outcome,
            };

            match outcome {
                Ok(true) => attempt = 0,
                Ok(false) => {}
                Err(e) => error!("❌ Error en websocket del nodo: {}", e),
            }
            self.connection_dropped();

            attempt = attempt.saturating_add(1);
            let delay = backoff_delay(LINK_BACKOFF_BASE, LINK_BACKOFF_MAX, attempt);
            warn!("🔄 Reconectando al nodo en {:?} (intento {})", delay, attempt);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("👋 Loop del nodo detenido");
    }

    /// Escucha el websocket hasta que se cierre. Devuelve si llegó a `ready`.
    async fn listen(&self) -> Result<bool, NodeError> {
        let mut request = self
            .settings
            .websocket_url()
            .into_client_request()
            .map_err(|e| NodeError::Protocol(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert("authorization", header_value(&self.settings.password)?);
        headers.insert("user-id", header_value(&self.user_id.to_string())?);
        headers.insert("client-name", HeaderValue::from_static(CLIENT_NAME));
        let resume_from = self.resume_from.read().clone();
        if let Some(previous) = resume_from {
            headers.insert("session-id", header_value(&previous)?);
        }

        let (mut socket, _) = connect_async(request)
            .await
            .map_err(|e| NodeError::Unavailable(e.to_string()))?;
        info!("🔗 Websocket del nodo conectado");

        let mut ready = false;
        while let Some(message) = socket.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if self.handle_message(text.as_str()).await {
                        ready = true;
                    }
                }
                Ok(Message::Close(frame)) => {
                    warn!("📡 El nodo cerró el websocket: {:?}", frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("📡 Error leyendo websocket del nodo: {}", e);
                    break;
                }
            }
        }

        Ok(ready)
    }

    /// Procesa un mensaje del websocket. Devuelve `true` para `ready`.
    async fn handle_message(&self, text: &str) -> bool {
        let message = match serde_json::from_str::<IncomingMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("⚠️ Mensaje del nodo inválido: {}", e);
                return false;
            }
        };

        match message {
            IncomingMessage::Ready {
                resumed,
                session_id,
            } => {
                info!("✅ Nodo listo (sesión {}, reanudada: {})", session_id, resumed);
                *self.session_id.write() = Some(session_id.clone());
                *self.resume_from.write() = None;

                if let Err(e) = self.configure_resuming(&session_id).await {
                    warn!("⚠️ No se pudo activar la reanudación: {}", e);
                }

                if resumed {
                    let guilds: Vec<GuildId> = self.players.iter().map(|g| *g).collect();
                    for guild_id in guilds {
                        self.emit(guild_id, NodeEvent::ConnectionRestored);
                    }
                } else {
                    // El nodo perdió los reproductores; cada sesión vuelve a conectar.
                    self.players.clear();
                }
                true
            }
            IncomingMessage::PlayerUpdate { guild_id, state } => {
                if let Some(guild_id) = parse_guild_id(&guild_id) {
                    self.emit(
                        guild_id,
                        NodeEvent::PlayerUpdate {
                            position_ms: state.position,
                            connected: state.connected,
                        },
                    );
                }
                false
            }
            IncomingMessage::Event(payload) => {
                if let Some((guild_id, event)) = payload.into_node_event() {
                    self.emit(guild_id, event);
                }
                false
            }
            IncomingMessage::Other => false,
        }
    }

    fn connection_dropped(&self) {
        let previous = self.session_id.write().take();
        if previous.is_some() {
            *self.resume_from.write() = previous;
        }

        let guilds: Vec<GuildId> = self.players.iter().map(|g| *g).collect();
        for guild_id in guilds {
            self.emit(
                guild_id,
                NodeEvent::ConnectionClosed {
                    code: 1006,
                    reason: "node websocket closed".to_string(),
                },
            );
        }
    }

    fn emit(&self, guild_id: GuildId, event: NodeEvent) {
        if self.events.send((guild_id, event)).is_err() {
            debug!("Router de eventos cerrado, evento de guild {} descartado", guild_id);
        }
    }

    fn current_session(&self) -> Result<String, NodeError> {
        self.session_id.read().clone().ok_or(NodeError::ConnectionLost)
    }

    async fn configure_resuming(&self, session_id: &str) -> Result<(), NodeError> {
        let url = format!("{}/sessions/{}", self.settings.rest_base(), session_id);
        let response = self
            .http
            .patch(&url)
            .header(AUTHORIZATION, &self.settings.password)
            .json(&SessionPatch {
                resuming: true,
                timeout: RESUME_TIMEOUT_SECS,
            })
            .send()
            .await
            .map_err(request_error)?;
        check_response(response, false).await
    }

    async fn update_player(
        &self,
        guild_id: GuildId,
        patch: PlayerPatch,
        loading: bool,
    ) -> Result<(), NodeError> {
        let session_id = self.current_session()?;
        let url = format!(
            "{}/sessions/{}/players/{}",
            self.settings.rest_base(),
            session_id,
            guild_id
        );

        debug!("📤 PATCH player {}: {:?}", guild_id, patch);
        let response = self
            .http
            .patch(&url)
            .header(AUTHORIZATION, &self.settings.password)
            .json(&patch)
            .send()
            .await
            .map_err(request_error)?;
        check_response(response, loading).await
    }

    async fn destroy_player(&self, guild_id: GuildId) -> Result<(), NodeError> {
        let session_id = self.current_session()?;
        let url = format!(
            "{}/sessions/{}/players/{}",
            self.settings.rest_base(),
            session_id,
            guild_id
        );

        let response = self
            .http
            .delete(&url)
            .header(AUTHORIZATION, &self.settings.password)
            .send()
            .await
            .map_err(request_error)?;

        match check_response(response, false).await {
            // Ya no existía en el nodo
            Err(NodeError::ConnectionLost) => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl NodeTransport for LavalinkNode {
    async fn send(&self, guild_id: GuildId, request: NodeRequest) -> Result<(), NodeError> {
        match request {
            NodeRequest::Connect { channel_id } => {
                let voice = self.gateway.join(guild_id, channel_id).await?;
                let patch = PlayerPatch {
                    voice: Some(VoicePatch {
                        token: voice.token,
                        endpoint: voice.endpoint,
                        session_id: voice.session_id,
                    }),
                    ..Default::default()
                };
                if let Err(e) = self.update_player(guild_id, patch, false).await {
                    warn!("⚠️ El nodo no aceptó la voz de guild {}: {}", guild_id, e);
                    if let Err(leave) = self.gateway.leave(guild_id).await {
                        warn!("⚠️ Error saliendo del canal en guild {}: {}", guild_id, leave);
                    }
                    return Err(e);
                }
                self.players.insert(guild_id);
                Ok(())
            }
            NodeRequest::Disconnect => {
                self.players.remove(&guild_id);
                let destroyed = match self.destroy_player(guild_id).await {
                    Err(NodeError::ConnectionLost) => Ok(()),
                    other => other,
                };
                self.gateway.leave(guild_id).await?;
                destroyed
            }
            NodeRequest::LoadAndPlay {
                track,
                start_ms,
                seq,
                volume,
                paused,
            } => {
                let patch = PlayerPatch {
                    track: Some(TrackPatch::play(&track, seq)),
                    position: Some(start_ms),
                    paused: Some(paused),
                    volume: Some(volume),
                    ..Default::default()
                };
                self.update_player(guild_id, patch, true).await
            }
            NodeRequest::Pause => {
                let patch = PlayerPatch {
                    paused: Some(true),
                    ..Default::default()
                };
                self.update_player(guild_id, patch, false).await
            }
            NodeRequest::Resume => {
                let patch = PlayerPatch {
                    paused: Some(false),
                    ..Default::default()
                };
                self.update_player(guild_id, patch, false).await
            }
            NodeRequest::Stop => {
                let patch = PlayerPatch {
                    track: Some(TrackPatch::stop()),
                    ..Default::default()
                };
                self.update_player(guild_id, patch, false).await
            }
            NodeRequest::Seek { position_ms } => {
                let patch = PlayerPatch {
                    position: Some(position_ms),
                    ..Default::default()
                };
                self.update_player(guild_id, patch, false).await
            }
            NodeRequest::SetVolume { percent } => {
                let patch = PlayerPatch {
                    volume: Some(percent),
                    ..Default::default()
                };
                self.update_player(guild_id, patch, false).await
            }
            NodeRequest::SetFilters { filters } => {
                let patch = PlayerPatch {
                    filters: Some(filters),
                    ..Default::default()
                };
                self.update_player(guild_id, patch, false).await
            }
        }
    }
}

#[async_trait]
impl TrackLoader for LavalinkNode {
    async fn load_tracks(&self, identifier: &str) -> Result<LoadResult, NodeError> {
        let url = format!(
            "{}/loadtracks?identifier={}",
            self.settings.rest_base(),
            urlencoding::encode(identifier)
        );
        debug!("🔍 Cargando tracks: {}", identifier);

        let response = self
            .http
            .get(&url)
            .header(AUTHORIZATION, &self.settings.password)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body, false));
        }

        response
            .json::<LoadResult>()
            .await
            .map_err(|e| NodeError::Protocol(format!("invalid loadtracks body: {}", e)))
    }
}

fn header_value(value: &str) -> Result<HeaderValue, NodeError> {
    HeaderValue::from_str(value).map_err(|e| NodeError::Protocol(format!("invalid header: {}", e)))
}

fn request_error(e: reqwest::Error) -> NodeError {
    if e.is_connect() || e.is_timeout() {
        NodeError::ConnectionLost
    } else {
        NodeError::Unavailable(e.to_string())
    }
}

async fn check_response(response: reqwest::Response, loading: bool) -> Result<(), NodeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, body, loading))
}

/// Traduce un status HTTP del nodo. Un 404 significa que el nodo perdió la
/// sesión o el reproductor, y se trata como pérdida de conexión.
fn status_error(status: StatusCode, body: String, loading: bool) -> NodeError {
    match status {
        StatusCode::NOT_FOUND => NodeError::ConnectionLost,
        StatusCode::BAD_REQUEST if loading => NodeError::LoadRejected(body),
        s if s.is_server_error() => NodeError::Unavailable(format!("{}: {}", s, body)),
        s => NodeError::Protocol(format!("{}: {}", s, body)),
    }
}
