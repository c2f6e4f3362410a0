//! # Node Module
//!
//! Typed control channel to the external audio node.
//!
//! - [`NodeTransport`] is the seam to the wire: the production implementation
//!   is [`lavalink::LavalinkNode`] (REST + websocket), tests use a scripted fake.
//! - [`AudioNodeClient`] is owned by one guild session. It holds the
//!   [`VoiceConnectionHandle`], numbers every `loadAndPlay` with a monotonically
//!   increasing sequence and uses it to discard stale track events.
//! - Events flow back as `(GuildId, NodeEvent)` pairs on a [`NodeEventSender`]
//!   and are routed to the owning session's inbox.

pub mod lavalink;
pub mod protocol;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::sources::SharedTrack;

pub use lavalink::LavalinkNode;

/// Canal por el que los transportes entregan eventos del nodo.
pub type NodeEventSender = mpsc::UnboundedSender<(GuildId, NodeEvent)>;
pub type NodeEventReceiver = mpsc::UnboundedReceiver<(GuildId, NodeEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeRequest {
    Connect {
        channel_id: ChannelId,
    },
    Disconnect,
    LoadAndPlay {
        track: SharedTrack,
        start_ms: u64,
        seq: u64,
        volume: u16,
        paused: bool,
    },
    Pause,
    Resume,
    Stop,
    Seek {
        position_ms: u64,
    },
    SetVolume {
        percent: u16,
    },
    /// Filtros de audio opacos para el nodo (objeto JSON tal cual).
    SetFilters {
        filters: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    TrackStarted {
        track_id: String,
        seq: Option<u64>,
    },
    TrackEnded {
        track_id: String,
        reason: TrackEndReason,
        seq: Option<u64>,
    },
    TrackException {
        track_id: String,
        message: String,
        seq: Option<u64>,
    },
    TrackStuck {
        track_id: String,
        threshold_ms: u64,
        seq: Option<u64>,
    },
    PlayerUpdate {
        position_ms: u64,
        connected: bool,
    },
    ConnectionClosed {
        code: u16,
        reason: String,
    },
    ConnectionRestored,
}

impl NodeEvent {
    /// Secuencia del comando `loadAndPlay` al que responde el evento.
    pub fn seq(&self) -> Option<u64> {
        match self {
            NodeEvent::TrackStarted { seq, .. }
            | NodeEvent::TrackEnded { seq, .. }
            | NodeEvent::TrackException { seq, .. }
            | NodeEvent::TrackStuck { seq, .. } => *seq,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("audio node unavailable: {0}")]
    Unavailable(String),
    #[error("connection to the audio node was lost")]
    ConnectionLost,
    #[error("node rejected the track: {0}")]
    LoadRejected(String),
    #[error("unexpected node response: {0}")]
    Protocol(String),
}

/// Envía peticiones al nodo para una guild.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn send(&self, guild_id: GuildId, request: NodeRequest) -> Result<(), NodeError>;
}

/// Conexión de voz activa (nodo + canal). Se libera con [`release`](Self::release);
/// si se suelta sin liberar, el `Drop` agenda la desconexión.
pub struct VoiceConnectionHandle {
    guild_id: GuildId,
    channel_id: ChannelId,
    transport: Arc<dyn NodeTransport>,
    released: bool,
}

impl VoiceConnectionHandle {
    fn new(guild_id: GuildId, channel_id: ChannelId, transport: Arc<dyn NodeTransport>) -> Self {
        Self {
            guild_id,
            channel_id,
            transport,
            released: false,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub async fn release(mut self) -> Result<(), NodeError> {
        self.released = true;
        info!("👋 Liberando conexión de voz en guild {}", self.guild_id);
        self.transport.send(self.guild_id, NodeRequest::Disconnect).await
    }

    /// Descarta el handle sin avisar al nodo (el nodo ya lo perdió).
    fn forget(mut self) {
        self.released = true;
    }
}

impl std::fmt::Debug for VoiceConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceConnectionHandle")
            .field("guild_id", &self.guild_id)
            .field("channel_id", &self.channel_id)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for VoiceConnectionHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let guild_id = self.guild_id;
        let transport = self.transport.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!("⚠️ Conexión de voz soltada sin liberar en guild {}", guild_id);
                runtime.spawn(async move {
                    if let Err(e) = transport.send(guild_id, NodeRequest::Disconnect).await {
                        warn!("⚠️ Error desconectando guild {}: {}", guild_id, e);
                    }
                });
            }
            Err(_) => warn!("⚠️ Sin runtime para liberar la conexión de voz de guild {}", guild_id),
        }
    }
}

/// Cliente del nodo propiedad de una sesión.
pub struct AudioNodeClient {
    guild_id: GuildId,
    transport: Arc<dyn NodeTransport>,
    seq: u64,
    handle: Option<VoiceConnectionHandle>,
    last_channel: Option<ChannelId>,
    deferred: Option<NodeRequest>,
}

impl AudioNodeClient {
    pub fn new(guild_id: GuildId, transport: Arc<dyn NodeTransport>) -> Self {
        Self {
            guild_id,
            transport,
            seq: 0,
            handle: None,
            last_channel: None,
            deferred: None,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    pub fn connected_channel(&self) -> Option<ChannelId> {
        self.handle.as_ref().map(|h| h.channel_id())
    }

    /// Conecta al canal. Reutiliza el handle si ya está en ese canal; si está
    /// en otro, libera el anterior antes de abrir el nuevo.
    pub async fn connect(&mut self, channel_id: ChannelId) -> Result<(), NodeError> {
        if self.connected_channel() == Some(channel_id) {
            return Ok(());
        }

        if let Some(previous) = self.handle.take() {
            debug!("🔄 Cambiando de canal de voz en guild {}", self.guild_id);
            if let Err(e) = previous.release().await {
                warn!("⚠️ Error liberando conexión previa: {}", e);
            }
        }

        self.transport
            .send(self.guild_id, NodeRequest::Connect { channel_id })
            .await?;
        self.handle = Some(VoiceConnectionHandle::new(
            self.guild_id,
            channel_id,
            self.transport.clone(),
        ));
        self.last_channel = Some(channel_id);
        info!("🔊 Conectado a canal de voz {} en guild {}", channel_id, self.guild_id);
        Ok(())
    }

    /// Libera la voz. Sin handle pero con un canal pendiente (reconexión a
    /// medias) se pide igualmente la desconexión.
    pub async fn disconnect(&mut self) -> Result<(), NodeError> {
        self.deferred = None;
        let last_channel = self.last_channel.take();
        match self.handle.take() {
            Some(handle) => handle.release().await,
            None if last_channel.is_some() => {
                info!("👋 Liberando voz pendiente en guild {}", self.guild_id);
                self.transport.send(self.guild_id, NodeRequest::Disconnect).await
            }
            None => Ok(()),
        }
    }

    /// Vuelve a abrir la conexión de voz en el último canal conocido. Si el
    /// intento falla, el handle anterior se conserva para poder liberarlo.
    pub async fn reconnect(&mut self) -> Result<(), NodeError> {
        let channel_id = self
            .connected_channel()
            .or(self.last_channel)
            .ok_or_else(|| NodeError::Unavailable("no voice channel to rejoin".to_string()))?;

        let stale = self.handle.take();
        if let Err(e) = self
            .transport
            .send(self.guild_id, NodeRequest::Connect { channel_id })
            .await
        {
            self.handle = stale;
            return Err(e);
        }

        if let Some(stale) = stale {
            stale.forget();
        }
        self.handle = Some(VoiceConnectionHandle::new(
            self.guild_id,
            channel_id,
            self.transport.clone(),
        ));
        self.last_channel = Some(channel_id);
        info!("🔌 Reconectado al canal {} en guild {}", channel_id, self.guild_id);
        Ok(())
    }

    /// Pide al nodo reproducir `track`. Devuelve la secuencia asignada.
    pub async fn load_and_play(
        &mut self,
        track: &SharedTrack,
        start_ms: u64,
        volume: u16,
        paused: bool,
    ) -> Result<u64, NodeError> {
        self.seq += 1;
        let request = NodeRequest::LoadAndPlay {
            track: track.clone(),
            start_ms,
            seq: self.seq,
            volume,
            paused,
        };
        self.dispatch(request).await?;
        Ok(self.seq)
    }

    /// Detiene el track actual; cualquier evento posterior del track queda obsoleto.
    pub async fn stop(&mut self) -> Result<(), NodeError> {
        self.supersede();
        self.command(NodeRequest::Stop).await
    }

    /// Comandos de transporte. Sin conexión de voz no hay nada que enviar.
    pub async fn command(&mut self, request: NodeRequest) -> Result<(), NodeError> {
        if self.handle.is_none() {
            debug!("🔇 Sin conexión de voz, comando omitido: {:?}", request);
            return Ok(());
        }
        self.dispatch(request).await
    }

    /// Invalida los eventos pendientes del track actual.
    pub fn supersede(&mut self) {
        self.seq += 1;
    }

    /// Vuelve a una secuencia anterior cuando el nodo nunca aceptó la carga
    /// que la avanzó.
    pub fn rewind(&mut self, seq: u64) {
        if seq < self.seq {
            debug!("↩️ Secuencia de guild {} vuelve a {}", self.guild_id, seq);
            self.seq = seq;
            if matches!(&self.deferred, Some(NodeRequest::LoadAndPlay { seq: pending, .. }) if *pending > seq) {
                self.deferred = None;
            }
        }
    }

    /// Tras reconectar: un `loadAndPlay` diferido que sigue siendo el último se
    /// reenvía con la misma secuencia y los parámetros actuales; si no, recarga
    /// `current` en `position_ms` y reintenta una vez el comando de transporte
    /// que falló.
    pub async fn resume_after_reconnect(
        &mut self,
        current: Option<&SharedTrack>,
        position_ms: u64,
        volume: u16,
        paused: bool,
    ) -> Result<Option<u64>, NodeError> {
        let deferred = self.deferred.take();

        if let Some(NodeRequest::LoadAndPlay { track, seq, .. }) = &deferred {
            if *seq == self.seq {
                info!("🔁 Reenviando reproducción pendiente (seq {})", self.seq);
                let request = NodeRequest::LoadAndPlay {
                    track: track.clone(),
                    start_ms: position_ms,
                    seq: self.seq,
                    volume,
                    paused,
                };
                self.dispatch(request).await?;
                return Ok(Some(self.seq));
            }
        }

        let seq = match current {
            Some(track) => Some(self.load_and_play(track, position_ms, volume, paused).await?),
            None => None,
        };
        if let Some(request) = deferred {
            if !matches!(request, NodeRequest::LoadAndPlay { .. }) {
                debug!("🔁 Reintentando comando diferido: {:?}", request);
                self.dispatch(request).await?;
            }
        }
        Ok(seq)
    }

    /// Filtra eventos de tracks ya reemplazados.
    pub fn accept(&self, event: NodeEvent) -> Option<NodeEvent> {
        match event.seq() {
            Some(seq) if seq < self.seq => {
                debug!(
                    "🗑️ Evento obsoleto descartado en guild {} (seq {} < {})",
                    self.guild_id, seq, self.seq
                );
                None
            }
            _ => Some(event),
        }
    }

    async fn dispatch(&mut self, request: NodeRequest) -> Result<(), NodeError> {
        match self.transport.send(self.guild_id, request.clone()).await {
            Err(NodeError::ConnectionLost) => {
                warn!("📡 Conexión perdida enviando {:?} en guild {}", request, self.guild_id);
                self.deferred = Some(request);
                Err(NodeError::ConnectionLost)
            }
            other => other,
        }
    }
}

/// Retardo exponencial acotado: `base * 2^(attempt-1)`, sin pasar de `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::FakeNode;
    use crate::sources::{SourceType, TrackRef};
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;

    fn track(name: &str) -> SharedTrack {
        Arc::new(TrackRef::new(name, name, SourceType::YouTube, UserId::new(1)))
    }

    fn client(node: &Arc<FakeNode>) -> AudioNodeClient {
        AudioNodeClient::new(GuildId::new(7), node.clone())
    }

    #[tokio::test]
    async fn test_connect_reuses_same_channel_and_tears_down_old() {
        let node = FakeNode::new();
        let mut client = client(&node);

        client.connect(ChannelId::new(1)).await.unwrap();
        client.connect(ChannelId::new(1)).await.unwrap();
        client.connect(ChannelId::new(2)).await.unwrap();

        assert_eq!(
            node.requests(),
            vec![
                NodeRequest::Connect { channel_id: ChannelId::new(1) },
                NodeRequest::Disconnect,
                NodeRequest::Connect { channel_id: ChannelId::new(2) },
            ]
        );
        assert_eq!(client.connected_channel(), Some(ChannelId::new(2)));
    }

    #[tokio::test]
    async fn test_stale_events_are_dropped() {
        let node = FakeNode::new();
        let mut client = client(&node);
        client.connect(ChannelId::new(1)).await.unwrap();

        let first = client.load_and_play(&track("a"), 0, 100, false).await.unwrap();
        let second = client.load_and_play(&track("b"), 0, 100, false).await.unwrap();
        assert!(second > first);

        let stale = NodeEvent::TrackEnded {
            track_id: "a".into(),
            reason: TrackEndReason::Replaced,
            seq: Some(first),
        };
        assert_eq!(client.accept(stale), None);

        let fresh = NodeEvent::TrackStarted { track_id: "b".into(), seq: Some(second) };
        assert_eq!(client.accept(fresh.clone()), Some(fresh));
        assert!(client.accept(NodeEvent::ConnectionRestored).is_some());
    }

    #[tokio::test]
    async fn test_commands_without_voice_are_noops() {
        let node = FakeNode::new();
        let mut client = client(&node);
        client.command(NodeRequest::Pause).await.unwrap();
        assert!(node.requests().is_empty());
    }

    #[tokio::test]
    async fn test_deferred_play_is_replayed_only_if_current() {
        let node = FakeNode::new();
        let mut client = client(&node);
        client.connect(ChannelId::new(1)).await.unwrap();

        node.set_connection_lost(true);
        let err = client.load_and_play(&track("a"), 0, 100, false).await.unwrap_err();
        assert_eq!(err, NodeError::ConnectionLost);
        node.set_connection_lost(false);

        let seq = client.resume_after_reconnect(None, 0, 100, false).await.unwrap();
        assert_eq!(seq, Some(client.seq()));
        assert_eq!(node.last_seq(), Some(client.seq()));
    }

    #[tokio::test]
    async fn test_superseded_play_is_not_replayed() {
        let node = FakeNode::new();
        let mut client = client(&node);
        client.connect(ChannelId::new(1)).await.unwrap();

        node.set_connection_lost(true);
        let _ = client.load_and_play(&track("old"), 0, 100, false).await;
        node.set_connection_lost(false);
        client.supersede();

        let current = track("new");
        client
            .resume_after_reconnect(Some(&current), 42_000, 80, false)
            .await
            .unwrap();

        let plays: Vec<_> = node
            .requests()
            .into_iter()
            .filter_map(|r| match r {
                NodeRequest::LoadAndPlay { track, start_ms, .. } => {
                    Some((track.title().to_string(), start_ms))
                }
                _ => None,
            })
            .collect();
        assert_eq!(plays, vec![("new".to_string(), 42_000)]);
    }

    #[tokio::test]
    async fn test_deferred_transport_command_retried_once() {
        let node = FakeNode::new();
        let mut client = client(&node);
        client.connect(ChannelId::new(1)).await.unwrap();
        let current = track("a");
        client.load_and_play(&current, 0, 100, false).await.unwrap();

        node.set_connection_lost(true);
        assert!(client.command(NodeRequest::Seek { position_ms: 5_000 }).await.is_err());
        node.set_connection_lost(false);

        client
            .resume_after_reconnect(Some(&current), 5_000, 100, false)
            .await
            .unwrap();
        client.resume_after_reconnect(Some(&current), 5_000, 100, false).await.unwrap();

        let seeks = node
            .requests()
            .iter()
            .filter(|r| matches!(r, NodeRequest::Seek { .. }))
            .count();
        assert_eq!(seeks, 1);
    }

    #[tokio::test]
    async fn test_failed_reconnect_keeps_voice_releasable() {
        let node = FakeNode::new();
        let mut client = client(&node);
        client.connect(ChannelId::new(1)).await.unwrap();

        node.set_connection_lost(true);
        assert_eq!(client.reconnect().await, Err(NodeError::ConnectionLost));
        assert_eq!(client.reconnect().await, Err(NodeError::ConnectionLost));
        assert_eq!(client.connected_channel(), Some(ChannelId::new(1)));

        client.disconnect().await.unwrap();
        assert_eq!(
            node.requests(),
            vec![
                NodeRequest::Connect { channel_id: ChannelId::new(1) },
                NodeRequest::Disconnect,
            ]
        );
        assert!(!client.is_connected());

        // Ya liberada, una segunda desconexión no envía nada
        client.disconnect().await.unwrap();
        assert_eq!(node.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_pending_play_is_resent_with_current_params() {
        let node = FakeNode::new();
        let mut client = client(&node);
        client.connect(ChannelId::new(1)).await.unwrap();

        node.set_connection_lost(true);
        let _ = client.load_and_play(&track("a"), 0, 100, false).await;
        node.set_connection_lost(false);

        let seq = client
            .resume_after_reconnect(None, 12_000, 40, true)
            .await
            .unwrap();
        assert_eq!(
            node.requests().last(),
            Some(&NodeRequest::LoadAndPlay {
                track: track("a"),
                start_ms: 12_000,
                seq: client.seq(),
                volume: 40,
                paused: true,
            })
        );
        assert_eq!(seq, Some(client.seq()));
    }

    #[tokio::test]
    async fn test_rewind_accepts_events_of_the_previous_track_again() {
        let node = FakeNode::new();
        let mut client = client(&node);
        client.connect(ChannelId::new(1)).await.unwrap();
        let playing = client.load_and_play(&track("a"), 0, 100, false).await.unwrap();

        node.set_load_failure(Some(NodeError::Unavailable("busy".into())));
        assert!(client.load_and_play(&track("b"), 0, 100, false).await.is_err());
        client.rewind(playing);

        let ended = NodeEvent::TrackEnded {
            track_id: "a".into(),
            reason: TrackEndReason::Finished,
            seq: Some(playing),
        };
        assert_eq!(client.accept(ended.clone()), Some(ended));
    }

    #[tokio::test]
    async fn test_dropped_handle_disconnects() {
        let node = FakeNode::new();
        {
            let mut client = client(&node);
            client.connect(ChannelId::new(1)).await.unwrap();
        }
        tokio::task::yield_now().await;
        assert_eq!(node.requests().last(), Some(&NodeRequest::Disconnect));
    }

    #[test]
    fn test_backoff_is_bounded() {
        let base = Duration::from_millis(1000);
        let max = Duration::from_millis(15_000);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(4000));
        assert_eq!(backoff_delay(base, max, 10), max);
        assert_eq!(backoff_delay(base, max, u32::MAX), max);
    }
}
