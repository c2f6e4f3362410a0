//! Typed failures surfaced to the chat layer.
//!
//! Every command either returns a [`SessionSnapshot`](crate::audio::session::SessionSnapshot)
//! or one of these reasons so the caller can render a message. Transient node
//! hiccups never show up here; they are retried inside the session.

use thiserror::Error;

use crate::audio::permissions::VoteTally;
use crate::audio::queue::QueueError;
use crate::sources::ResolveError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    /// El solicitante no tiene permisos. Si fue un voto de skip, `vote` trae el conteo.
    #[error("permission denied")]
    PermissionDenied { vote: Option<VoteTally> },

    #[error("nothing is playing")]
    NothingPlaying,

    #[error("the queue is empty")]
    QueueEmpty,

    #[error("could not resolve track: {0}")]
    ResolveFailed(String),

    #[error("audio node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("index {index} out of range (queue has {len} tracks)")]
    OutOfRange { index: usize, len: usize },

    #[error("queue is full (max {0} tracks)")]
    QueueFull(usize),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// La sesión fue cerrada mientras el comando estaba en vuelo.
    #[error("session closed")]
    SessionClosed,
}

impl PlaybackError {
    pub fn denied() -> Self {
        Self::PermissionDenied { vote: None }
    }

    /// Errores del usuario o de permisos: nunca cambian el estado de la sesión.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. }
                | Self::OutOfRange { .. }
                | Self::InvalidInput(_)
                | Self::QueueFull(_)
                | Self::NothingPlaying
                | Self::QueueEmpty
        )
    }
}

impl From<QueueError> for PlaybackError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::OutOfRange { index, len } => Self::OutOfRange { index, len },
            QueueError::Full(max) => Self::QueueFull(max),
            QueueError::Empty => Self::QueueEmpty,
        }
    }
}

impl From<ResolveError> for PlaybackError {
    fn from(err: ResolveError) -> Self {
        Self::ResolveFailed(err.to_string())
    }
}
