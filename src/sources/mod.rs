//! # Sources Module
//!
//! Track references and the resolver seam.
//!
//! The engine never talks to YouTube, SoundCloud or Spotify directly: it asks a
//! [`TrackResolver`] to turn a free-text query or URL into one or more
//! [`TrackRef`]s. The default resolver ([`node_search::NodeSearchResolver`])
//! delegates the search to the audio node itself, and
//! [`crate::cache::CachedResolver`] can sit in front of any resolver.

pub mod node_search;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;

pub use node_search::NodeSearchResolver;

/// Referencia compartida a un track; la cola y los eventos la comparten sin copiarla.
pub type SharedTrack = Arc<TrackRef>;

/// Backend de búsqueda preferido por el usuario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchBackend {
    #[serde(alias = "ytsearch")]
    YouTube,
    #[serde(alias = "scsearch")]
    SoundCloud,
    #[default]
    #[serde(alias = "spsearch")]
    Spotify,
}

impl SearchBackend {
    /// Prefijo de búsqueda que entiende el nodo.
    pub fn prefix(&self) -> &'static str {
        match self {
            SearchBackend::YouTube => "ytsearch",
            SearchBackend::SoundCloud => "scsearch",
            SearchBackend::Spotify => "spsearch",
        }
    }
}

/// Origen de un track (etiqueta de procedencia del resolver).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    YouTube,
    SoundCloud,
    Spotify,
    Http,
    Other,
}

impl SourceType {
    pub fn from_source_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "youtube" | "youtube_music" => SourceType::YouTube,
            "soundcloud" => SourceType::SoundCloud,
            "spotify" => SourceType::Spotify,
            "http" | "local" => SourceType::Http,
            _ => SourceType::Other,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceType::YouTube => "youtube",
            SourceType::SoundCloud => "soundcloud",
            SourceType::Spotify => "spotify",
            SourceType::Http => "http",
            SourceType::Other => "other",
        };
        f.write_str(name)
    }
}

/// Representa un track resuelto y reproducible. Inmutable una vez creado.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRef {
    identifier: String,
    encoded: Option<String>,
    uri: Option<String>,
    title: String,
    author: Option<String>,
    duration: Option<Duration>,
    requester: UserId,
    source: SourceType,
}

impl TrackRef {
    pub fn new(
        identifier: impl Into<String>,
        title: impl Into<String>,
        source: SourceType,
        requester: UserId,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            encoded: None,
            uri: None,
            title: title.into(),
            author: None,
            duration: None,
            requester,
            source,
        }
    }

    // Getters
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
    pub fn encoded(&self) -> Option<&str> {
        self.encoded.as_deref()
    }
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }
    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }
    /// `None` para transmisiones en vivo.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }
    pub fn requester(&self) -> UserId {
        self.requester
    }
    pub fn source(&self) -> SourceType {
        self.source
    }
    pub fn is_stream(&self) -> bool {
        self.duration.is_none()
    }

    // Builders
    pub fn with_encoded(mut self, encoded: impl Into<String>) -> Self {
        self.encoded = Some(encoded.into());
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_requester(mut self, requester: UserId) -> Self {
        self.requester = requester;
        self
    }
}

/// Consulta de búsqueda ya validada por la capa de chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pub text: String,
    pub backend: SearchBackend,
}

impl Query {
    pub fn new(text: impl Into<String>, backend: SearchBackend) -> Self {
        Self {
            text: text.into().trim().to_string(),
            backend,
        }
    }

    pub fn is_url(&self) -> bool {
        url::Url::parse(&self.text)
            .map(|url| matches!(url.scheme(), "http" | "https"))
            .unwrap_or(false)
    }

    /// Identificador que se envía al nodo: la URL tal cual o `prefijo:texto`.
    pub fn identifier(&self) -> String {
        if self.is_url() {
            self.text.clone()
        } else {
            format!("{}:{}", self.backend.prefix(), self.text)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no results for '{0}'")]
    NoMatches(String),
    #[error("search backend failed: {0}")]
    Backend(String),
}

/// Trait común para todo lo que convierte una consulta en tracks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackResolver: Send + Sync {
    /// Devuelve los tracks en orden. Una búsqueda de texto devuelve a lo sumo
    /// los candidatos del backend; una URL de playlist devuelve la playlist entera.
    async fn resolve(&self, query: &Query, requester: UserId) -> Result<Vec<TrackRef>, ResolveError>;
}
