//! Test doubles shared by the session, registry and node client tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, RoleId, UserId};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::audio::{
    history::{HistorySink, Notification, PlayHistoryEvent},
    permissions::Requester,
    session::{SessionContext, SessionHandle, SessionSettings},
};
use crate::node::{NodeError, NodeEvent, NodeRequest, NodeTransport, TrackEndReason};
use crate::sources::{MockTrackResolver, ResolveError, SourceType, TrackRef};
use crate::storage::{GuildSettings, MockConfigStore, UserSettings};
use crate::voice::VoiceRoster;

pub const GUILD: GuildId = GuildId::new(1);
pub const VOICE: ChannelId = ChannelId::new(10);
pub const DJ_ROLE: RoleId = RoleId::new(900);

/// Nodo falso: registra las peticiones aceptadas y puede simular caídas.
#[derive(Default)]
pub struct FakeNode {
    requests: Mutex<Vec<NodeRequest>>,
    connection_lost: AtomicBool,
    load_failure: Mutex<Option<NodeError>>,
}

impl FakeNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<NodeRequest> {
        self.requests.lock().clone()
    }

    /// Mientras esté activo, toda petición salvo `Disconnect` falla con
    /// `ConnectionLost` (salir del gateway no necesita al nodo).
    pub fn set_connection_lost(&self, lost: bool) {
        self.connection_lost.store(lost, Ordering::SeqCst);
    }

    /// Error con el que el nodo rechaza cada `LoadAndPlay`.
    pub fn set_load_failure(&self, failure: Option<NodeError>) {
        *self.load_failure.lock() = failure;
    }

    /// Secuencia del último `LoadAndPlay` aceptado.
    pub fn last_seq(&self) -> Option<u64> {
        self.requests.lock().iter().rev().find_map(|request| match request {
            NodeRequest::LoadAndPlay { seq, .. } => Some(*seq),
            _ => None,
        })
    }

    fn last_track_id(&self) -> String {
        self.requests
            .lock()
            .iter()
            .rev()
            .find_map(|request| match request {
                NodeRequest::LoadAndPlay { track, .. } => Some(track.identifier().to_string()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl NodeTransport for FakeNode {
    async fn send(&self, _guild_id: GuildId, request: NodeRequest) -> Result<(), NodeError> {
        if self.connection_lost.load(Ordering::SeqCst) && request != NodeRequest::Disconnect {
            return Err(NodeError::ConnectionLost);
        }
        if let NodeRequest::LoadAndPlay { .. } = request {
            if let Some(failure) = self.load_failure.lock().clone() {
                return Err(failure);
            }
        }
        self.requests.lock().push(request);
        Ok(())
    }
}

/// Sink de historial que guarda todo en memoria.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PlayHistoryEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<PlayHistoryEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl HistorySink for RecordingSink {
    async fn record(&self, event: PlayHistoryEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Resolver que devuelve un track por consulta; "nothing" no encuentra nada
/// y "silence" devuelve una lista vacía.
pub fn fixture_resolver() -> MockTrackResolver {
    let mut resolver = MockTrackResolver::new();
    resolver.expect_resolve().returning(|query, requester| {
        if query.text == "nothing" {
            return Err(ResolveError::NoMatches(query.text.clone()));
        }
        if query.text == "silence" {
            return Ok(Vec::new());
        }
        Ok(vec![TrackRef::new(
            query.text.clone(),
            query.text.clone(),
            SourceType::YouTube,
            requester,
        )
        .with_encoded(format!("enc:{}", query.text))
        .with_duration(Duration::from_secs(180))])
    });
    resolver
}

pub fn fixture_store() -> MockConfigStore {
    let mut store = MockConfigStore::new();
    store.expect_guild_settings().returning(|guild_id| {
        Ok(GuildSettings {
            dj_role_id: Some(DJ_ROLE.get()),
            ..GuildSettings::new(guild_id)
        })
    });
    store
        .expect_user_settings()
        .returning(|user_id| Ok(UserSettings::new(user_id)));
    store
}

pub struct Harness {
    pub node: Arc<FakeNode>,
    pub roster: Arc<VoiceRoster>,
    pub sink: Arc<RecordingSink>,
    pub ctx: SessionContext,
    notifications: Mutex<mpsc::UnboundedReceiver<Notification>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(SessionSettings::default())
    }

    pub fn with_settings(settings: SessionSettings) -> Self {
        let node = FakeNode::new();
        let roster = Arc::new(VoiceRoster::new());
        let sink = Arc::new(RecordingSink::default());
        let (notifier, notifications) = mpsc::unbounded_channel();

        let ctx = SessionContext {
            settings,
            transport: node.clone(),
            resolver: Arc::new(fixture_resolver()),
            history: sink.clone(),
            store: Arc::new(fixture_store()),
            roster: roster.clone(),
            notifier,
        };

        Self {
            node,
            roster,
            sink,
            ctx,
            notifications: Mutex::new(notifications),
        }
    }

    pub fn spawn(&self) -> (SessionHandle, JoinHandle<()>) {
        SessionHandle::spawn(0, GUILD, self.ctx.clone())
    }

    pub fn join(&self, user: u64, bot: bool) {
        self.roster.update(GUILD, UserId::new(user), Some(VOICE), bot);
    }

    pub fn leave(&self, user: u64) {
        self.roster.update(GUILD, UserId::new(user), None, false);
    }

    pub fn requester(&self, user: u64) -> Requester {
        Requester::new(UserId::new(user)).in_channel(VOICE)
    }

    pub fn dj(&self, user: u64) -> Requester {
        self.requester(user).with_roles(vec![DJ_ROLE])
    }

    /// El nodo confirma que empezó el último track cargado.
    pub async fn started(&self, handle: &SessionHandle) {
        handle
            .deliver(NodeEvent::TrackStarted {
                track_id: self.node.last_track_id(),
                seq: self.node.last_seq(),
            })
            .await;
        let _ = handle.snapshot().await;
    }

    /// El nodo reporta el fin del último track cargado.
    pub async fn ended(&self, handle: &SessionHandle, reason: TrackEndReason) {
        handle
            .deliver(NodeEvent::TrackEnded {
                track_id: self.node.last_track_id(),
                reason,
                seq: self.node.last_seq(),
            })
            .await;
        let _ = handle.snapshot().await;
    }

    pub fn drain_notifications(&self) -> Vec<Notification> {
        let mut receiver = self.notifications.lock();
        let mut drained = Vec::new();
        while let Ok(notification) = receiver.try_recv() {
            drained.push(notification);
        }
        drained
    }
}
