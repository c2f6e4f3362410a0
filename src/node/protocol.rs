//! Wire format of the audio node (Lavalink v4 compatible JSON).

use serde::{Deserialize, Serialize};
use serenity::model::id::{GuildId, UserId};
use std::{num::NonZeroU64, time::Duration};

use super::{NodeEvent, TrackEndReason};
use crate::sources::{SourceType, TrackRef};

/// Mensajes que llegan por el websocket del nodo.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    #[serde(rename_all = "camelCase")]
    Ready { resumed: bool, session_id: String },
    #[serde(rename_all = "camelCase")]
    PlayerUpdate { guild_id: String, state: PlayerState },
    Event(EventPayload),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PlayerState {
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub connected: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    #[serde(rename = "TrackStartEvent", rename_all = "camelCase")]
    TrackStart { guild_id: String, track: WireTrack },
    #[serde(rename = "TrackEndEvent", rename_all = "camelCase")]
    TrackEnd {
        guild_id: String,
        track: WireTrack,
        reason: TrackEndReason,
    },
    #[serde(rename = "TrackExceptionEvent", rename_all = "camelCase")]
    TrackException {
        guild_id: String,
        track: WireTrack,
        exception: WireException,
    },
    #[serde(rename = "TrackStuckEvent", rename_all = "camelCase")]
    TrackStuck {
        guild_id: String,
        track: WireTrack,
        threshold_ms: u64,
    },
    #[serde(rename = "WebSocketClosedEvent", rename_all = "camelCase")]
    WebSocketClosed {
        guild_id: String,
        code: u16,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        by_remote: bool,
    },
    #[serde(other)]
    Other,
}

impl EventPayload {
    /// Convierte el evento al modelo interno. Devuelve `None` para eventos
    /// que el motor no usa o con un guild id inválido.
    pub fn into_node_event(self) -> Option<(GuildId, NodeEvent)> {
        match self {
            EventPayload::TrackStart { guild_id, track } => Some((
                parse_guild_id(&guild_id)?,
                NodeEvent::TrackStarted {
                    seq: track.seq(),
                    track_id: track.info.identifier,
                },
            )),
            EventPayload::TrackEnd {
                guild_id,
                track,
                reason,
            } => Some((
                parse_guild_id(&guild_id)?,
                NodeEvent::TrackEnded {
                    seq: track.seq(),
                    track_id: track.info.identifier,
                    reason,
                },
            )),
            EventPayload::TrackException {
                guild_id,
                track,
                exception,
            } => Some((
                parse_guild_id(&guild_id)?,
                NodeEvent::TrackException {
                    seq: track.seq(),
                    track_id: track.info.identifier,
                    message: exception.message.unwrap_or(exception.cause),
                },
            )),
            EventPayload::TrackStuck {
                guild_id,
                track,
                threshold_ms,
            } => Some((
                parse_guild_id(&guild_id)?,
                NodeEvent::TrackStuck {
                    seq: track.seq(),
                    track_id: track.info.identifier,
                    threshold_ms,
                },
            )),
            EventPayload::WebSocketClosed {
                guild_id,
                code,
                reason,
                ..
            } => Some((
                parse_guild_id(&guild_id)?,
                NodeEvent::ConnectionClosed { code, reason },
            )),
            EventPayload::Other => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireException {
    pub message: Option<String>,
    #[serde(default)]
    pub cause: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTrack {
    pub encoded: String,
    pub info: WireTrackInfo,
    #[serde(default)]
    pub user_data: Option<UserData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTrackInfo {
    pub identifier: String,
    #[serde(default)]
    pub author: String,
    /// Milisegundos; 0 en transmisiones.
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub is_stream: bool,
    pub title: String,
    pub uri: Option<String>,
    #[serde(default)]
    pub source_name: String,
}

impl WireTrack {
    pub fn seq(&self) -> Option<u64> {
        self.user_data.as_ref().and_then(|data| data.seq)
    }

    pub fn into_track_ref(self, requester: UserId) -> TrackRef {
        let info = self.info;
        let mut track = TrackRef::new(
            info.identifier,
            info.title,
            SourceType::from_source_name(&info.source_name),
            requester,
        )
        .with_encoded(self.encoded);

        if let Some(uri) = info.uri {
            track = track.with_uri(uri);
        }
        if !info.author.is_empty() {
            track = track.with_author(info.author);
        }
        if !info.is_stream {
            track = track.with_duration(Duration::from_millis(info.length));
        }
        track
    }
}

/// Resultado de `GET /v4/loadtracks`.
#[derive(Debug, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "camelCase")]
pub enum LoadResult {
    Track(WireTrack),
    Playlist(WirePlaylist),
    Search(Vec<WireTrack>),
    Empty {},
    Error(WireException),
}

#[derive(Debug, Deserialize)]
pub struct WirePlaylist {
    pub info: PlaylistInfo,
    pub tracks: Vec<WireTrack>,
}

#[derive(Debug, Deserialize)]
pub struct PlaylistInfo {
    pub name: String,
}

/// Cuerpo de `PATCH /v4/sessions/{sessionId}/players/{guildId}`.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<TrackPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoicePatch>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackPatch {
    /// `Some(None)` se serializa como `null` y detiene el reproductor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<UserData>,
}

impl TrackPatch {
    pub fn play(track: &TrackRef, seq: u64) -> Self {
        let user_data = Some(UserData { seq: Some(seq) });
        match track.encoded() {
            Some(encoded) => Self {
                encoded: Some(Some(encoded.to_string())),
                identifier: None,
                user_data,
            },
            None => Self {
                encoded: None,
                identifier: Some(track.identifier().to_string()),
                user_data,
            },
        }
    }

    pub fn stop() -> Self {
        Self {
            encoded: Some(None),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoicePatch {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

/// Cuerpo de `PATCH /v4/sessions/{sessionId}`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionPatch {
    pub resuming: bool,
    pub timeout: u64,
}

pub fn parse_guild_id(raw: &str) -> Option<GuildId> {
    raw.parse::<NonZeroU64>().ok().map(GuildId::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn track_json(seq: Option<u64>) -> serde_json::Value {
        json!({
            "encoded": "QAAAjQIAJVJpY2sgQXN0bGV5",
            "info": {
                "identifier": "dQw4w9WgXcQ",
                "isSeekable": true,
                "author": "Rick Astley",
                "length": 212000,
                "isStream": false,
                "position": 0,
                "title": "Never Gonna Give You Up",
                "uri": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                "sourceName": "youtube"
            },
            "pluginInfo": {},
            "userData": seq.map(|s| json!({ "seq": s })).unwrap_or(json!({}))
        })
    }

    #[test]
    fn test_parse_ready() {
        let raw = r#"{"op":"ready","resumed":false,"sessionId":"la1"}"#;
        match serde_json::from_str::<IncomingMessage>(raw).unwrap() {
            IncomingMessage::Ready { resumed, session_id } => {
                assert!(!resumed);
                assert_eq!(session_id, "la1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_track_end_with_seq() {
        let raw = json!({
            "op": "event",
            "type": "TrackEndEvent",
            "guildId": "123",
            "track": track_json(Some(4)),
            "reason": "loadFailed"
        });
        let message: IncomingMessage = serde_json::from_value(raw).unwrap();
        let IncomingMessage::Event(payload) = message else {
            panic!("expected event");
        };
        assert_eq!(
            payload.into_node_event(),
            Some((
                GuildId::new(123),
                NodeEvent::TrackEnded {
                    track_id: "dQw4w9WgXcQ".into(),
                    reason: TrackEndReason::LoadFailed,
                    seq: Some(4),
                }
            ))
        );
    }

    #[test]
    fn test_unknown_ops_and_events_are_tolerated() {
        let stats = r#"{"op":"stats","players":1,"playingPlayers":1,"uptime":10}"#;
        assert!(matches!(
            serde_json::from_str::<IncomingMessage>(stats).unwrap(),
            IncomingMessage::Other
        ));

        let lyrics = json!({"op": "event", "type": "LyricsNotFoundEvent", "guildId": "1"});
        let IncomingMessage::Event(payload) = serde_json::from_value(lyrics).unwrap() else {
            panic!("expected event");
        };
        assert!(payload.into_node_event().is_none());
    }

    #[test]
    fn test_player_update() {
        let raw = json!({
            "op": "playerUpdate",
            "guildId": "55",
            "state": { "time": 1, "position": 6000, "connected": true, "ping": 20 }
        });
        let IncomingMessage::PlayerUpdate { guild_id, state } = serde_json::from_value(raw).unwrap()
        else {
            panic!("expected player update");
        };
        assert_eq!(parse_guild_id(&guild_id), Some(GuildId::new(55)));
        assert_eq!(state.position, 6000);
        assert!(state.connected);
    }

    #[test]
    fn test_load_results() {
        let search = json!({ "loadType": "search", "data": [track_json(None)] });
        let LoadResult::Search(tracks) = serde_json::from_value(search).unwrap() else {
            panic!("expected search");
        };
        let track = tracks[0].clone().into_track_ref(UserId::new(9));
        assert_eq!(track.title(), "Never Gonna Give You Up");
        assert_eq!(track.duration(), Some(Duration::from_secs(212)));
        assert_eq!(track.source(), SourceType::YouTube);
        assert_eq!(track.requester(), UserId::new(9));

        let empty = json!({ "loadType": "empty", "data": {} });
        assert!(matches!(serde_json::from_value(empty).unwrap(), LoadResult::Empty {}));
    }

    #[test]
    fn test_player_patch_bodies() {
        let track = TrackRef::new("id1", "Song", SourceType::YouTube, UserId::new(1))
            .with_encoded("ENC");
        let play = PlayerPatch {
            track: Some(TrackPatch::play(&track, 3)),
            position: Some(0),
            paused: Some(false),
            volume: Some(100),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&play).unwrap(),
            json!({
                "track": { "encoded": "ENC", "userData": { "seq": 3 } },
                "position": 0,
                "paused": false,
                "volume": 100
            })
        );

        let stop = PlayerPatch {
            track: Some(TrackPatch::stop()),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&stop).unwrap(),
            json!({ "track": { "encoded": null } })
        );

        let filters = PlayerPatch {
            filters: Some(json!({ "timescale": { "speed": 1.25 } })),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&filters).unwrap(),
            json!({ "filters": { "timescale": { "speed": 1.25 } } })
        );

        let unresolved = TrackRef::new("ytsearch:song", "song", SourceType::Other, UserId::new(1));
        assert_eq!(
            serde_json::to_value(TrackPatch::play(&unresolved, 1)).unwrap(),
            json!({ "identifier": "ytsearch:song", "userData": { "seq": 1 } })
        );
    }

    #[test]
    fn test_invalid_guild_ids() {
        assert_eq!(parse_guild_id("0"), None);
        assert_eq!(parse_guild_id("abc"), None);
    }
}
