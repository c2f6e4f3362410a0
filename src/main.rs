use anyhow::Result;
use serenity::{http::Http, model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use open_music_engine::audio::{
    history::Notification, SessionContext, SessionRegistry, SessionSettings,
};
use open_music_engine::bot::MusicEventHandler;
use open_music_engine::cache::CachedResolver;
use open_music_engine::config::Config;
use open_music_engine::node::{
    lavalink::{NodeSettings, SongbirdGateway},
    LavalinkNode,
};
use open_music_engine::sources::NodeSearchResolver;
use open_music_engine::storage::JsonStorage;
use open_music_engine::voice::VoiceRoster;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_engine=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music Engine v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    // Inicializar almacenamiento JSON
    let storage = Arc::new(JsonStorage::new(config.data_dir.clone()).await?);

    // El nodo necesita el id del bot antes de arrancar el cliente
    let http = Http::new(&config.discord_token);
    let user_id = http.get_current_user().await?.id;

    // Inicializar nodo de audio
    info!("🎼 Inicializando Lavalink...");
    let songbird = Songbird::serenity();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let gateway = Arc::new(SongbirdGateway::new(songbird.clone()));
    let node = LavalinkNode::new(NodeSettings::from(&config), user_id, gateway, events_tx)?;
    let link_shutdown = CancellationToken::new();
    let link = node.start(link_shutdown.clone());

    // Motor de sesiones
    let roster = Arc::new(VoiceRoster::new());
    let (notifier, mut notifications) = mpsc::unbounded_channel();
    let resolver = Arc::new(CachedResolver::new(
        NodeSearchResolver::new(node.clone(), config.max_playlist_size),
        config.resolve_cache_ttl,
    ));
    let ctx = SessionContext {
        settings: SessionSettings::from(&config),
        transport: node.clone(),
        resolver: resolver.clone(),
        history: storage.clone(),
        store: storage.clone(),
        roster: roster.clone(),
        notifier,
    };
    let registry = SessionRegistry::new(ctx);
    let router = registry.spawn_event_router(events_rx);
    let sweeper = registry.spawn_sweeper(config.sweep_interval, config.session_idle_evict);
    let cache_janitor = spawn_cache_janitor(resolver, config.resolve_cache_ttl, link_shutdown.clone());

    // La capa de chat renderiza estas notificaciones; aquí solo se registran
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            log_notification(&notification);
        }
    });

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let handler = MusicEventHandler::new(registry.clone(), roster);
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    let shutdown_registry = registry.clone();
    let signal_shutdown = link_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        shutdown_registry.shutdown().await;
        signal_shutdown.cancel();
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    registry.shutdown().await;
    link_shutdown.cancel();
    for task in [router, sweeper, cache_janitor, link] {
        if let Err(e) = task.await {
            warn!("⚠️ Tarea terminó con error: {}", e);
        }
    }

    Ok(())
}

/// Purga periódica de resoluciones vencidas.
fn spawn_cache_janitor(
    resolver: Arc<CachedResolver<NodeSearchResolver>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = resolver.cleanup_expired();
                    let metrics = resolver.metrics();
                    debug!(
                        "🧹 Cache: {} expiradas, {:.1}% aciertos ({} / {})",
                        removed,
                        metrics.hit_rate() * 100.0,
                        metrics.hits,
                        metrics.hits + metrics.misses
                    );
                }
            }
        }
    })
}

fn log_notification(notification: &Notification) {
    let guild_id = notification.guild_id();
    match notification {
        Notification::NowPlaying { track, .. } => {
            info!("🎵 [{}] Reproduciendo: {}", guild_id, track.title())
        }
        Notification::QueueEnded { .. } => info!("📭 [{}] La cola terminó", guild_id),
        Notification::TrackFailed { title, message, .. } => {
            warn!("❌ [{}] No se pudo reproducir '{}': {}", guild_id, title, message)
        }
        Notification::ConnectionFailed { attempts, .. } => warn!(
            "📡 [{}] Conexión con el nodo perdida tras {} intentos",
            guild_id, attempts
        ),
        Notification::Left { .. } => info!("👋 [{}] Desconectado del canal de voz", guild_id),
    }
}
