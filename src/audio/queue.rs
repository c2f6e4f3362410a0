use rand::seq::SliceRandom;
use std::{collections::VecDeque, fmt, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{debug, info};

use crate::sources::SharedTrack;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("index {index} out of range (len {len})")]
    OutOfRange { index: usize, len: usize },
    #[error("queue is full (max {0})")]
    Full(usize),
    #[error("queue is empty")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopMode::Off => "off",
            LoopMode::Track => "track",
            LoopMode::Queue => "queue",
        })
    }
}

impl FromStr for LoopMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(LoopMode::Off),
            "track" | "song" => Ok(LoopMode::Track),
            "queue" | "all" => Ok(LoopMode::Queue),
            other => Err(format!("unknown loop mode '{}'", other)),
        }
    }
}

/// Dónde insertar un track nuevo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Position {
    #[default]
    Tail,
    Front,
    At(usize),
}

/// Cómo terminó el track actual; decide qué hace el loop con él.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishKind {
    Finished,
    Skipped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    id: u64,
    track: SharedTrack,
    skip_to: bool,
}

impl QueueEntry {
    /// Orden de inserción, único dentro de la cola.
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn track(&self) -> &SharedTrack {
        &self.track
    }
}

/// Cola de una guild. Solo la muta el loop de comandos de su sesión.
///
/// `entries` son los próximos tracks en orden; el que suena vive aparte en
/// `current` y no aparece en la vista de "próximos".
#[derive(Debug, Clone)]
pub struct Queue {
    entries: Vec<QueueEntry>,
    current: Option<QueueEntry>,
    history: VecDeque<SharedTrack>,
    loop_mode: LoopMode,
    next_id: u64,
    max_size: usize,
    max_history: usize,
}

impl Queue {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            current: None,
            history: VecDeque::new(),
            loop_mode: LoopMode::Off,
            next_id: 0,
            max_size,
            max_history: 50,
        }
    }

    /// Agrega un track a la cola y devuelve el índice donde quedó.
    pub fn enqueue(&mut self, track: SharedTrack, position: Position) -> Result<usize, QueueError> {
        if self.entries.len() >= self.max_size {
            return Err(QueueError::Full(self.max_size));
        }

        let index = match position {
            Position::Tail => self.entries.len(),
            Position::Front => 0,
            Position::At(index) if index <= self.entries.len() => index,
            Position::At(index) => {
                return Err(QueueError::OutOfRange {
                    index,
                    len: self.entries.len(),
                })
            }
        };

        debug!("➕ Agregado a la cola en posición {}: {}", index, track.title());
        let entry = self.new_entry(track);
        self.entries.insert(index, entry);
        Ok(index)
    }

    /// Agrega varios tracks (playlist) hasta llenar la cola. Devuelve cuántos entraron.
    pub fn enqueue_many(&mut self, tracks: impl IntoIterator<Item = SharedTrack>) -> usize {
        let available = self.max_size.saturating_sub(self.entries.len());
        let mut added = 0;

        for track in tracks.into_iter().take(available) {
            let entry = self.new_entry(track);
            self.entries.push(entry);
            added += 1;
        }

        info!("➕ Agregadas {} canciones a la cola", added);
        added
    }

    pub fn remove_at(&mut self, index: usize) -> Result<QueueEntry, QueueError> {
        self.check_index(index)?;
        let entry = self.entries.remove(index);
        debug!("❌ Track eliminado en posición {}", index);
        Ok(entry)
    }

    /// Elimina los primeros `count` tracks pendientes.
    pub fn remove_front(&mut self, count: usize) -> Result<usize, QueueError> {
        if count == 0 || count > self.entries.len() {
            return Err(QueueError::OutOfRange {
                index: count,
                len: self.entries.len(),
            });
        }
        self.entries.drain(..count);
        Ok(count)
    }

    pub fn move_to(&mut self, from: usize, to: usize) -> Result<(), QueueError> {
        self.check_index(from)?;
        self.check_index(to)?;

        if from != to {
            let entry = self.entries.remove(from);
            self.entries.insert(to, entry);
            debug!("📍 Track movido de posición {} a {}", from, to);
        }
        Ok(())
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
        match mode {
            LoopMode::Off => info!("➡️ Repetición desactivada"),
            LoopMode::Track => info!("🔂 Repetir canción activado"),
            LoopMode::Queue => info!("🔁 Repetir cola activado"),
        }
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn peek_current(&self) -> Option<&QueueEntry> {
        self.current.as_ref()
    }

    pub fn peek_next(&self) -> Option<&QueueEntry> {
        self.entries
            .iter()
            .find(|entry| entry.skip_to)
            .or_else(|| self.entries.first())
    }

    /// Marca un track como el siguiente a sonar (una sola vez).
    pub fn mark_skip_to(&mut self, index: usize) -> Result<(), QueueError> {
        self.check_index(index)?;
        for entry in &mut self.entries {
            entry.skip_to = false;
        }
        self.entries[index].skip_to = true;
        Ok(())
    }

    /// Saca el siguiente track de la cola y lo vuelve el actual.
    pub fn promote_next(&mut self) -> Option<SharedTrack> {
        if let Some(current) = &self.current {
            return Some(current.track.clone());
        }

        if self.entries.is_empty() {
            return None;
        }

        let index = self
            .entries
            .iter()
            .position(|entry| entry.skip_to)
            .unwrap_or(0);
        let mut entry = self.entries.remove(index);
        entry.skip_to = false;

        info!("➡️ Siguiente en cola: {}", entry.track.title());
        let track = entry.track.clone();
        self.current = Some(entry);
        Some(track)
    }

    /// Termina el track actual aplicando el modo de loop.
    pub fn finish_current(&mut self, kind: FinishKind) -> Option<QueueEntry> {
        let entry = self.current.take()?;

        if kind != FinishKind::Failed {
            self.push_history(entry.track.clone());
        }

        match (self.loop_mode, kind) {
            (_, FinishKind::Failed) => {}
            (LoopMode::Track, FinishKind::Finished) => {
                info!("🔂 Repitiendo track: {}", entry.track.title());
                self.entries.insert(0, entry.clone());
            }
            (LoopMode::Queue, _) => {
                info!("🔁 Track agregado al final por loop de cola: {}", entry.track.title());
                self.entries.push(entry.clone());
            }
            _ => {}
        }

        Some(entry)
    }

    /// Vuelve a encolar al frente el último track del historial.
    pub fn requeue_previous(&mut self) -> Option<SharedTrack> {
        let track = self.history.pop_back()?;
        let entry = self.new_entry(track.clone());
        self.entries.insert(0, entry);
        Some(track)
    }

    pub fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        self.entries.shuffle(&mut rng);
        info!("🔀 Cola mezclada");
    }

    /// Limpia los próximos tracks; el actual sigue sonando.
    pub fn clear(&mut self) -> usize {
        let cleared = self.entries.len();
        self.entries.clear();
        info!("🗑️ Cola limpiada: {} tracks removidos", cleared);
        cleared
    }

    /// Limpia todo, incluido el actual (stop).
    pub fn reset(&mut self) {
        self.entries.clear();
        self.current = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            current: self.current.as_ref().map(|entry| entry.track.clone()),
            upcoming: self.entries.iter().map(|entry| entry.track.clone()).collect(),
            loop_mode: self.loop_mode,
            total_duration: self.total_duration(),
        }
    }

    // Funciones privadas

    fn new_entry(&mut self, track: SharedTrack) -> QueueEntry {
        self.next_id += 1;
        QueueEntry {
            id: self.next_id,
            track,
            skip_to: false,
        }
    }

    fn check_index(&self, index: usize) -> Result<(), QueueError> {
        if index >= self.entries.len() {
            return Err(QueueError::OutOfRange {
                index,
                len: self.entries.len(),
            });
        }
        Ok(())
    }

    fn push_history(&mut self, track: SharedTrack) {
        self.history.push_back(track);
        if self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }

    fn total_duration(&self) -> Duration {
        self.current
            .iter()
            .chain(self.entries.iter())
            .filter_map(|entry| entry.track.duration())
            .sum()
    }
}

/// Vista de solo lectura para renderizar la cola.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub current: Option<SharedTrack>,
    pub upcoming: Vec<SharedTrack>,
    pub loop_mode: LoopMode,
    pub total_duration: Duration,
}

impl QueueSnapshot {
    /// Tracks en total, contando el que suena.
    pub fn total_len(&self) -> usize {
        self.upcoming.len() + usize::from(self.current.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{SourceType, TrackRef};
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;
    use std::sync::Arc;

    fn track(title: &str) -> SharedTrack {
        Arc::new(
            TrackRef::new(title, title, SourceType::YouTube, UserId::new(1))
                .with_duration(Duration::from_secs(180)),
        )
    }

    fn titles(queue: &Queue) -> Vec<String> {
        queue
            .snapshot()
            .upcoming
            .iter()
            .map(|t| t.title().to_string())
            .collect()
    }

    fn queue_of(names: &[&str]) -> Queue {
        let mut queue = Queue::new(100);
        for name in names {
            queue.enqueue(track(name), Position::Tail).unwrap();
        }
        queue
    }

    #[test]
    fn test_snapshot_keeps_insertion_order() {
        let queue = queue_of(&["a", "b", "c", "d"]);
        assert_eq!(titles(&queue), vec!["a", "b", "c", "d"]);
        assert_eq!(queue.snapshot().total_duration, Duration::from_secs(720));
    }

    #[test]
    fn test_enqueue_positions() {
        let mut queue = queue_of(&["a", "b"]);
        assert_eq!(queue.enqueue(track("front"), Position::Front), Ok(0));
        assert_eq!(queue.enqueue(track("mid"), Position::At(2)), Ok(2));
        assert_eq!(titles(&queue), vec!["front", "a", "mid", "b"]);
        assert_eq!(
            queue.enqueue(track("x"), Position::At(9)),
            Err(QueueError::OutOfRange { index: 9, len: 4 })
        );
    }

    #[test]
    fn test_full_queue_rejects_and_playlists_truncate() {
        let mut queue = Queue::new(3);
        assert_eq!(queue.enqueue_many(vec![track("a"), track("b"), track("c"), track("d")]), 3);
        assert_eq!(queue.enqueue(track("e"), Position::Tail), Err(QueueError::Full(3)));
        assert_eq!(titles(&queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_out_of_range_is_an_error_not_a_panic() {
        let mut queue = queue_of(&["a", "b"]);
        assert_eq!(
            queue.remove_at(2).unwrap_err(),
            QueueError::OutOfRange { index: 2, len: 2 }
        );
        assert_eq!(titles(&queue), vec!["a", "b"]);
        assert_eq!(queue.remove_at(0).unwrap().track().title(), "a");
        assert_eq!(titles(&queue), vec!["b"]);
    }

    #[test]
    fn test_move_to() {
        let mut queue = queue_of(&["a", "b", "c"]);
        queue.move_to(0, 2).unwrap();
        assert_eq!(titles(&queue), vec!["b", "c", "a"]);
        assert!(queue.move_to(0, 3).is_err());
    }

    #[test]
    fn test_current_is_not_listed_as_upcoming() {
        let mut queue = queue_of(&["a", "b"]);
        assert_eq!(queue.promote_next().unwrap().title(), "a");
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.current.unwrap().title(), "a");
        assert_eq!(titles(&queue), vec!["b"]);
        assert_eq!(queue.snapshot().total_len(), 2);
    }

    #[test]
    fn test_loop_off_discards_finished_track() {
        let mut queue = queue_of(&["a", "b"]);
        queue.promote_next();
        queue.finish_current(FinishKind::Finished);
        assert_eq!(titles(&queue), vec!["b"]);
        assert_eq!(queue.requeue_previous().unwrap().title(), "a");
    }

    #[test]
    fn test_loop_track_replays_until_skipped() {
        let mut queue = queue_of(&["a", "b"]);
        queue.set_loop_mode(LoopMode::Track);
        for _ in 0..3 {
            assert_eq!(queue.promote_next().unwrap().title(), "a");
            queue.finish_current(FinishKind::Finished);
        }
        assert_eq!(queue.promote_next().unwrap().title(), "a");
        queue.finish_current(FinishKind::Skipped);
        assert_eq!(queue.promote_next().unwrap().title(), "b");
    }

    #[test]
    fn test_loop_queue_rotates_to_tail() {
        let mut queue = queue_of(&["a", "b", "c"]);
        queue.set_loop_mode(LoopMode::Queue);
        queue.promote_next();
        queue.finish_current(FinishKind::Finished);
        assert_eq!(titles(&queue), vec!["b", "c", "a"]);
        queue.promote_next();
        queue.finish_current(FinishKind::Skipped);
        assert_eq!(titles(&queue), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_failed_tracks_never_requeue() {
        let mut queue = queue_of(&["a", "b"]);
        queue.set_loop_mode(LoopMode::Queue);
        queue.promote_next();
        queue.finish_current(FinishKind::Failed);
        assert_eq!(titles(&queue), vec!["b"]);
        assert!(queue.requeue_previous().is_none());
    }

    #[test]
    fn test_skip_to_marker_is_one_shot() {
        let mut queue = queue_of(&["a", "b", "c", "d"]);
        queue.mark_skip_to(2).unwrap();
        assert_eq!(queue.peek_next().unwrap().track().title(), "c");
        assert_eq!(queue.promote_next().unwrap().title(), "c");
        queue.finish_current(FinishKind::Finished);
        assert_eq!(queue.promote_next().unwrap().title(), "a");
        assert_eq!(titles(&queue), vec!["b", "d"]);
    }

    #[test]
    fn test_previous_is_requeued_once() {
        let mut queue = queue_of(&["a", "b"]);
        queue.promote_next();
        queue.finish_current(FinishKind::Finished);
        assert_eq!(queue.requeue_previous().unwrap().title(), "a");
        assert_eq!(titles(&queue), vec!["a", "b"]);
        assert!(queue.requeue_previous().is_none());
    }

    #[test]
    fn test_remove_front() {
        let mut queue = queue_of(&["a", "b", "c"]);
        assert_eq!(queue.remove_front(2), Ok(2));
        assert_eq!(titles(&queue), vec!["c"]);
        assert!(queue.remove_front(5).is_err());
    }

    #[test]
    fn test_loop_mode_parsing() {
        assert_eq!("Track".parse::<LoopMode>(), Ok(LoopMode::Track));
        assert_eq!("all".parse::<LoopMode>(), Ok(LoopMode::Queue));
        assert!("sometimes".parse::<LoopMode>().is_err());
    }
}
