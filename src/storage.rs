use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::{GuildId, RoleId, UserId};
use std::{collections::HashMap, num::NonZeroU64, path::PathBuf};
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};

use crate::audio::history::{HistorySink, PlayHistoryEvent};
use crate::sources::SearchBackend;

pub const DEFAULT_PREFIX: &str = "!";

/// Configuración de servidor almacenada en JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildSettings {
    pub guild_id: u64,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub dj_role_id: Option<u64>,
}

impl GuildSettings {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id: guild_id.get(),
            prefix: default_prefix(),
            dj_role_id: None,
        }
    }

    pub fn dj_role(&self) -> Option<RoleId> {
        self.dj_role_id.and_then(NonZeroU64::new).map(RoleId::from)
    }
}

/// Preferencias por usuario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: u64,
    #[serde(default)]
    pub search_backend: SearchBackend,
    #[serde(default)]
    pub no_prefix: bool,
}

impl UserSettings {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id: user_id.get(),
            search_backend: SearchBackend::default(),
            no_prefix: false,
        }
    }
}

/// Acumulado de reproducciones de un usuario para un track.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayStats {
    pub title: String,
    pub plays: u64,
    pub listened_ms: u64,
    pub last_played: Option<DateTime<Utc>>,
}

/// Lectura de la configuración persistida. El motor nunca la escribe.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn guild_settings(&self, guild_id: GuildId) -> Result<GuildSettings>;
    async fn user_settings(&self, user_id: UserId) -> Result<UserSettings>;
}

#[derive(Default)]
struct StorageState {
    guilds: HashMap<u64, GuildSettings>,
    users: HashMap<u64, UserSettings>,
    history: HashMap<String, PlayStats>,
}

/// Manager de almacenamiento basado en archivos JSON
pub struct JsonStorage {
    data_dir: PathBuf,
    state: Mutex<StorageState>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        // Crear directorios de datos si no existen
        fs::create_dir_all(data_dir.join("servers")).await?;
        fs::create_dir_all(data_dir.join("users")).await?;

        info!("📁 Storage inicializado en: {}", data_dir.display());

        let history = match fs::read_to_string(data_dir.join("history.json")).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("⚠️ history.json inválido, se empieza vacío: {}", e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        let storage = Self {
            data_dir,
            state: Mutex::new(StorageState {
                history,
                ..Default::default()
            }),
        };

        let loaded = storage.load_all_guilds().await?;
        if loaded > 0 {
            info!("📂 Cargadas {} configuraciones de servidor", loaded);
        }

        Ok(storage)
    }

    // Métodos privados

    async fn load_all_guilds(&self) -> Result<usize> {
        let mut files = fs::read_dir(self.data_dir.join("servers")).await?;
        let mut loaded = 0;
        let mut state = self.state.lock().await;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            let Some(guild_id) = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };

            match read_json::<GuildSettings>(&path).await {
                Ok(settings) => {
                    state.guilds.insert(guild_id, settings);
                    loaded += 1;
                }
                Err(e) => warn!("Error cargando configuración para guild {}: {}", guild_id, e),
            }
        }

        Ok(loaded)
    }

    fn user_path(&self, user_id: u64) -> PathBuf {
        self.data_dir.join("users").join(format!("user_{}.json", user_id))
    }
}

#[async_trait]
impl ConfigStore for JsonStorage {
    async fn guild_settings(&self, guild_id: GuildId) -> Result<GuildSettings> {
        if let Some(settings) = self.state.lock().await.guilds.get(&guild_id.get()) {
            return Ok(settings.clone());
        }
        Ok(GuildSettings::new(guild_id))
    }

    async fn user_settings(&self, user_id: UserId) -> Result<UserSettings> {
        if let Some(settings) = self.state.lock().await.users.get(&user_id.get()) {
            return Ok(settings.clone());
        }

        let path = self.user_path(user_id.get());
        let settings = match read_json::<UserSettings>(&path).await {
            Ok(settings) => settings,
            Err(_) => UserSettings::new(user_id),
        };
        self.state
            .lock()
            .await
            .users
            .insert(user_id.get(), settings.clone());
        Ok(settings)
    }
}

#[async_trait]
impl HistorySink for JsonStorage {
    async fn record(&self, event: PlayHistoryEvent) -> Result<()> {
        let key = history_key(event.user_id, &event.track_id);
        // El lock se mantiene durante la escritura para no intercalar snapshots
        let mut state = self.state.lock().await;
        let previous = state.history.get(&key).cloned();

        let mut stats = previous.clone().unwrap_or_default();
        stats.title = event.title.clone();
        stats.plays += 1;
        stats.listened_ms += event.listened.as_millis() as u64;
        stats.last_played = Some(event.finished_at);
        state.history.insert(key.clone(), stats);

        let written = match serde_json::to_string_pretty(&state.history) {
            Ok(content) => fs::write(self.data_dir.join("history.json"), content)
                .await
                .map_err(anyhow::Error::from),
            Err(e) => Err(e.into()),
        };

        if let Err(e) = written {
            // La memoria solo refleja lo que quedó en disco
            match previous {
                Some(stats) => state.history.insert(key, stats),
                None => state.history.remove(&key),
            };
            warn!("⚠️ No se pudo guardar el historial de {}: {}", event.user_id, e);
            return Err(e);
        }

        debug!("💾 Historial guardado para {}:{}", event.user_id, event.track_id);
        Ok(())
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn history_key(user_id: UserId, track_id: &str) -> String {
    format!("{}:{}", user_id.get(), track_id)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let content = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}
