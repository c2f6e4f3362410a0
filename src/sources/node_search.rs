use async_trait::async_trait;
use serenity::model::id::UserId;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Query, ResolveError, TrackRef, TrackResolver};
use crate::node::{protocol::LoadResult, NodeError};

/// Búsqueda de tracks a través del endpoint de carga del nodo.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackLoader: Send + Sync {
    async fn load_tracks(&self, identifier: &str) -> Result<LoadResult, NodeError>;
}

/// Resolver por defecto: delega la búsqueda en el nodo de audio.
pub struct NodeSearchResolver {
    loader: Arc<dyn TrackLoader>,
    max_playlist_size: usize,
}

impl NodeSearchResolver {
    pub fn new(loader: Arc<dyn TrackLoader>, max_playlist_size: usize) -> Self {
        Self {
            loader,
            max_playlist_size,
        }
    }
}

#[async_trait]
impl TrackResolver for NodeSearchResolver {
    async fn resolve(&self, query: &Query, requester: UserId) -> Result<Vec<TrackRef>, ResolveError> {
        if query.text.is_empty() {
            return Err(ResolveError::NoMatches(String::new()));
        }

        let identifier = query.identifier();
        let result = self
            .loader
            .load_tracks(&identifier)
            .await
            .map_err(|e| ResolveError::Backend(e.to_string()))?;

        let tracks = match result {
            LoadResult::Track(track) => vec![track.into_track_ref(requester)],
            // Una búsqueda devuelve candidatos; solo se encola el primero
            LoadResult::Search(tracks) => tracks
                .into_iter()
                .take(1)
                .map(|t| t.into_track_ref(requester))
                .collect(),
            LoadResult::Playlist(playlist) => {
                info!(
                    "📜 Playlist '{}' con {} tracks",
                    playlist.info.name,
                    playlist.tracks.len()
                );
                playlist
                    .tracks
                    .into_iter()
                    .take(self.max_playlist_size)
                    .map(|t| t.into_track_ref(requester))
                    .collect()
            }
            LoadResult::Empty {} => Vec::new(),
            LoadResult::Error(exception) => {
                let message = exception.message.unwrap_or(exception.cause);
                warn!("⚠️ El nodo no pudo cargar '{}': {}", identifier, message);
                return Err(ResolveError::Backend(message));
            }
        };

        if tracks.is_empty() {
            debug!("🔍 Sin resultados para '{}'", identifier);
            return Err(ResolveError::NoMatches(query.text.clone()));
        }

        Ok(tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SearchBackend;
    use serde_json::json;

    fn wire_track(id: &str) -> serde_json::Value {
        json!({
            "encoded": format!("enc-{}", id),
            "info": {
                "identifier": id,
                "author": "artist",
                "length": 1000,
                "isStream": false,
                "title": format!("title {}", id),
                "uri": null,
                "sourceName": "soundcloud"
            }
        })
    }

    fn load_result(value: serde_json::Value) -> LoadResult {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_search_uses_backend_prefix_and_takes_first() {
        let mut loader = MockTrackLoader::new();
        loader
            .expect_load_tracks()
            .withf(|id| id == "scsearch:lofi")
            .times(1)
            .returning(|_| {
                Ok(load_result(json!({
                    "loadType": "search",
                    "data": [wire_track("a"), wire_track("b")]
                })))
            });

        let resolver = NodeSearchResolver::new(Arc::new(loader), 100);
        let tracks = resolver
            .resolve(&Query::new("lofi", SearchBackend::SoundCloud), UserId::new(4))
            .await
            .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].identifier(), "a");
        assert_eq!(tracks[0].encoded(), Some("enc-a"));
    }

    #[tokio::test]
    async fn test_playlists_are_truncated() {
        let mut loader = MockTrackLoader::new();
        loader.expect_load_tracks().returning(|_| {
            Ok(load_result(json!({
                "loadType": "playlist",
                "data": {
                    "info": { "name": "mix", "selectedTrack": -1 },
                    "pluginInfo": {},
                    "tracks": [wire_track("1"), wire_track("2"), wire_track("3")]
                }
            })))
        });

        let resolver = NodeSearchResolver::new(Arc::new(loader), 2);
        let query = Query::new("https://soundcloud.com/x/sets/mix", SearchBackend::Spotify);
        let tracks = resolver.resolve(&query, UserId::new(4)).await.unwrap();
        assert_eq!(tracks.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_and_errors() {
        let mut loader = MockTrackLoader::new();
        loader
            .expect_load_tracks()
            .times(1)
            .returning(|_| Ok(load_result(json!({ "loadType": "empty", "data": {} }))));
        loader
            .expect_load_tracks()
            .returning(|_| Err(NodeError::ConnectionLost));

        let resolver = NodeSearchResolver::new(Arc::new(loader), 10);
        let query = Query::new("zzzz", SearchBackend::YouTube);
        assert_eq!(
            resolver.resolve(&query, UserId::new(1)).await,
            Err(ResolveError::NoMatches("zzzz".into()))
        );
        assert!(matches!(
            resolver.resolve(&query, UserId::new(1)).await,
            Err(ResolveError::Backend(_))
        ));
    }
}
