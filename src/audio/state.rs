//! Playback state machine.
//!
//! [`transition`] is a pure function of `(state, input)`: it never touches the
//! queue, the node or a timer. It returns the next state plus the list of
//! [`Effect`]s the owning session must carry out, in order. Effects may feed
//! follow-up inputs back (a finished voice handshake, a drained queue), which
//! keeps every mutation flowing through this single table.

use std::fmt;

use crate::error::PlaybackError;
use crate::node::TrackEndReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Connecting,
    Playing,
    Paused,
    Buffering,
    Skipping,
    Disconnecting,
    Reconnecting,
}

impl PlaybackState {
    /// Estados con un track cargado (o cargándose) en el nodo.
    pub fn has_track(&self) -> bool {
        matches!(
            self,
            PlaybackState::Connecting
                | PlaybackState::Playing
                | PlaybackState::Paused
                | PlaybackState::Buffering
        )
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Connecting => "connecting",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Buffering => "buffering",
            PlaybackState::Skipping => "skipping",
            PlaybackState::Disconnecting => "disconnecting",
            PlaybackState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    // Comandos de usuario
    Play,
    Pause,
    Resume,
    Skip,
    Stop,
    Seek(u64),
    SetVolume(u16),
    SetFilters,
    Leave,
    // Eventos del nodo
    TrackStarted,
    TrackEnded(TrackEndReason),
    TrackStuck,
    PositionUpdate,
    ConnectionLost,
    ConnectionRestored,
    // Resultados internos de efectos y timers
    VoiceReady,
    NextReady,
    QueueDrained,
    RetryDue,
    RetriesExhausted,
    IdleTimeout,
    Disconnected,
}

impl Input {
    fn is_command(&self) -> bool {
        matches!(
            self,
            Input::Play
                | Input::Pause
                | Input::Resume
                | Input::Skip
                | Input::Stop
                | Input::Seek(_)
                | Input::SetVolume(_)
                | Input::SetFilters
                | Input::Leave
        )
    }
}

/// Avisos visibles para el usuario que produce la máquina.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    NowPlaying,
    QueueEnded,
    ConnectionFailed,
    Left,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Abrir (o reutilizar) la conexión de voz.
    Connect,
    /// Promover el siguiente de la cola y pedir al nodo que lo reproduzca.
    LoadNext,
    /// Recargar el track actual en la posición guardada tras una reconexión.
    ReloadCurrent,
    NodePause,
    NodeResume,
    NodeStop,
    NodeSeek(u64),
    NodeVolume(u16),
    /// Enviar al nodo los filtros guardados en la sesión.
    NodeFilters,
    /// Recordar si el track debe quedar en pausa cuando el nodo lo arranque.
    DeferPause(bool),
    /// Recordar la posición para la próxima carga.
    DeferSeek(u64),
    /// Guardar el volumen sin enviarlo; viaja con la próxima carga.
    StoreVolume(u16),
    /// Terminar el track actual con esta razón y decidir el siguiente.
    Advance(TrackEndReason),
    ClearQueue,
    Disconnect,
    ScheduleReconnect,
    Reconnect,
    /// Cancelar el backoff pendiente y reintentar ya.
    RetryNow,
    ScheduleIdleRelease,
    CancelIdleTimer,
    CancelTimers,
    ResetReconnects,
    Evict,
    Notify(Notice),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: PlaybackState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: PlaybackState, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }

    fn stay(state: PlaybackState) -> Self {
        Self::to(state, Vec::new())
    }
}

/// Tabla de transiciones. Los comandos inválidos para el estado devuelven
/// error; los eventos del nodo fuera de contexto se ignoran.
pub fn transition(state: PlaybackState, input: &Input) -> Result<Transition, PlaybackError> {
    use Effect::*;
    use PlaybackState::*;

    let result = match (state, input) {
        // Arranque
        (Idle, Input::Play) => Transition::to(Connecting, vec![CancelIdleTimer, Connect]),
        (Reconnecting, Input::Play) => Transition::to(Reconnecting, vec![RetryNow]),
        (_, Input::Play) => Transition::stay(state),
        (Connecting, Input::VoiceReady) => Transition::to(Connecting, vec![LoadNext]),
        (Connecting | Buffering | Playing, Input::TrackStarted) => {
            Transition::to(Playing, vec![ResetReconnects, Notify(Notice::NowPlaying)])
        }
        (Paused, Input::TrackStarted) => Transition::to(Paused, vec![ResetReconnects]),

        // Fin de track y avance de cola
        (Connecting | Playing | Paused | Buffering, Input::TrackEnded(reason)) => {
            Transition::to(Skipping, vec![Advance(*reason)])
        }
        (Skipping, Input::NextReady) => Transition::to(Connecting, vec![LoadNext]),
        (Skipping | Connecting, Input::QueueDrained) => Transition::to(
            Idle,
            vec![NodeStop, ScheduleIdleRelease, Notify(Notice::QueueEnded)],
        ),

        // Transporte
        (Playing | Buffering, Input::Pause) => Transition::to(Paused, vec![NodePause]),
        (Paused, Input::Pause) => Transition::stay(Paused),
        (Paused, Input::Resume) => Transition::to(Playing, vec![NodeResume]),
        (Playing | Buffering, Input::Resume) => Transition::stay(state),
        (Playing | Paused | Buffering, Input::Seek(position)) => {
            Transition::to(state, vec![NodeSeek(*position)])
        }
        (Playing | Paused | Buffering | Connecting, Input::Skip) => {
            Transition::to(Skipping, vec![Advance(TrackEndReason::Stopped)])
        }
        (Reconnecting, Input::Skip) => Transition::to(
            Skipping,
            vec![CancelTimers, Advance(TrackEndReason::Stopped)],
        ),

        // Durante la reconexión el comando se guarda y se reintenta ya
        (Reconnecting, Input::Pause) => Transition::to(Reconnecting, vec![DeferPause(true), RetryNow]),
        (Reconnecting, Input::Resume) => {
            Transition::to(Reconnecting, vec![DeferPause(false), RetryNow])
        }
        (Reconnecting, Input::Seek(position)) => {
            Transition::to(Reconnecting, vec![DeferSeek(*position), RetryNow])
        }
        (Reconnecting, Input::SetVolume(percent)) => {
            Transition::to(Reconnecting, vec![StoreVolume(*percent), RetryNow])
        }
        (Reconnecting, Input::SetFilters) => Transition::to(Reconnecting, vec![RetryNow]),

        // Track cargándose: la pausa espera al arranque, el seek va directo
        (Connecting, Input::Pause) => Transition::to(Connecting, vec![DeferPause(true)]),
        (Connecting, Input::Resume) => Transition::to(Connecting, vec![DeferPause(false)]),
        (Connecting, Input::Seek(position)) => {
            Transition::to(Connecting, vec![DeferSeek(*position), NodeSeek(*position)])
        }

        (_, Input::SetVolume(percent)) => Transition::to(state, vec![NodeVolume(*percent)]),
        (_, Input::SetFilters) => Transition::to(state, vec![NodeFilters]),

        // Stop / salida
        (Idle, Input::Stop) => Transition::to(Idle, vec![ClearQueue]),
        (Disconnecting, Input::Stop) => Transition::stay(Disconnecting),
        (_, Input::Stop) => Transition::to(
            Idle,
            vec![CancelTimers, ClearQueue, NodeStop, ScheduleIdleRelease],
        ),
        (Disconnecting, Input::Leave) => Transition::stay(Disconnecting),
        (_, Input::Leave) => Transition::to(
            Disconnecting,
            vec![
                CancelTimers,
                ClearQueue,
                NodeStop,
                Evict,
                Notify(Notice::Left),
                Disconnect,
            ],
        ),
        (Idle, Input::IdleTimeout) => Transition::to(Disconnecting, vec![Disconnect]),
        (Disconnecting, Input::Disconnected) => Transition::to(Idle, vec![]),

        // Atascos del nodo
        (Playing, Input::TrackStuck) => Transition::to(Buffering, vec![]),
        (Buffering, Input::PositionUpdate) => Transition::to(Playing, vec![]),

        // Pérdida de conexión
        (Idle, Input::ConnectionLost) => Transition::to(Idle, vec![CancelIdleTimer, Disconnect]),
        (Disconnecting, Input::ConnectionLost) => Transition::stay(Disconnecting),
        (_, Input::ConnectionLost) => Transition::to(Reconnecting, vec![ScheduleReconnect]),
        (Reconnecting, Input::RetryDue) => Transition::to(Reconnecting, vec![Reconnect]),
        (Reconnecting, Input::ConnectionRestored) => {
            Transition::to(Connecting, vec![ReloadCurrent])
        }
        (Reconnecting, Input::RetriesExhausted) => Transition::to(
            Idle,
            vec![
                CancelTimers,
                ClearQueue,
                Disconnect,
                Notify(Notice::ConnectionFailed),
                Evict,
            ],
        ),

        (_, input) if input.is_command() => return Err(PlaybackError::NothingPlaying),
        _ => Transition::stay(state),
    };

    Ok(result)
}

/// Dueño del estado actual de una sesión.
#[derive(Debug, Default, Clone)]
pub struct PlaybackStateMachine {
    state: PlaybackState,
}

impl PlaybackStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Aplica una entrada. Si la entrada es rechazada el estado no cambia.
    pub fn apply(&mut self, input: &Input) -> Result<Vec<Effect>, PlaybackError> {
        let Transition { next, effects } = transition(self.state, input)?;
        self.state = next;
        Ok(effects)
    }

    /// Vuelve a un estado previo (comando que el nodo nunca confirmó).
    pub fn restore(&mut self, state: PlaybackState) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(state: PlaybackState, input: Input) -> Transition {
        transition(state, &input).unwrap()
    }

    #[test]
    fn test_play_from_idle_connects_then_loads() {
        let t = run(PlaybackState::Idle, Input::Play);
        assert_eq!(t.next, PlaybackState::Connecting);
        assert_eq!(t.effects, vec![Effect::CancelIdleTimer, Effect::Connect]);

        let t = run(PlaybackState::Connecting, Input::VoiceReady);
        assert_eq!(t.effects, vec![Effect::LoadNext]);

        let t = run(PlaybackState::Connecting, Input::TrackStarted);
        assert_eq!(t.next, PlaybackState::Playing);
    }

    #[test]
    fn test_play_while_playing_only_queues() {
        let t = run(PlaybackState::Playing, Input::Play);
        assert_eq!(t, Transition::stay(PlaybackState::Playing));
    }

    #[test]
    fn test_finished_track_never_stays_playing() {
        let t = run(PlaybackState::Playing, Input::TrackEnded(TrackEndReason::Finished));
        assert_eq!(t.next, PlaybackState::Skipping);
        assert_eq!(t.effects, vec![Effect::Advance(TrackEndReason::Finished)]);

        assert_eq!(run(PlaybackState::Skipping, Input::NextReady).next, PlaybackState::Connecting);
        let drained = run(PlaybackState::Skipping, Input::QueueDrained);
        assert_eq!(drained.next, PlaybackState::Idle);
        assert!(drained.effects.contains(&Effect::ScheduleIdleRelease));
        assert!(!drained.effects.contains(&Effect::Disconnect));
    }

    #[test]
    fn test_pause_resume_cycle() {
        assert_eq!(run(PlaybackState::Playing, Input::Pause).effects, vec![Effect::NodePause]);
        assert_eq!(run(PlaybackState::Paused, Input::Resume).next, PlaybackState::Playing);
        assert_eq!(
            transition(PlaybackState::Idle, &Input::Pause),
            Err(PlaybackError::NothingPlaying)
        );
    }

    #[test]
    fn test_stop_cancels_in_flight_waits() {
        for state in [
            PlaybackState::Connecting,
            PlaybackState::Buffering,
            PlaybackState::Reconnecting,
        ] {
            let t = run(state, Input::Stop);
            assert_eq!(t.next, PlaybackState::Idle);
            assert_eq!(t.effects[0], Effect::CancelTimers);
            assert!(t.effects.contains(&Effect::NodeStop));
        }
    }

    #[test]
    fn test_reconnect_path() {
        let t = run(PlaybackState::Playing, Input::ConnectionLost);
        assert_eq!(t.next, PlaybackState::Reconnecting);
        assert_eq!(run(PlaybackState::Reconnecting, Input::RetryDue).effects, vec![Effect::Reconnect]);
        assert_eq!(
            run(PlaybackState::Reconnecting, Input::ConnectionRestored).next,
            PlaybackState::Connecting
        );

        let gave_up = run(PlaybackState::Reconnecting, Input::RetriesExhausted);
        assert_eq!(gave_up.next, PlaybackState::Idle);
        let notices = gave_up
            .effects
            .iter()
            .filter(|e| matches!(e, Effect::Notify(_)))
            .count();
        assert_eq!(notices, 1);
        assert!(gave_up.effects.contains(&Effect::Disconnect));
    }

    #[test]
    fn test_commands_during_reconnect_retry_immediately() {
        let cases = [
            (Input::Play, vec![Effect::RetryNow]),
            (Input::Pause, vec![Effect::DeferPause(true), Effect::RetryNow]),
            (Input::Resume, vec![Effect::DeferPause(false), Effect::RetryNow]),
            (Input::Seek(9_000), vec![Effect::DeferSeek(9_000), Effect::RetryNow]),
            (Input::SetVolume(30), vec![Effect::StoreVolume(30), Effect::RetryNow]),
            (Input::SetFilters, vec![Effect::RetryNow]),
        ];
        for (input, effects) in cases {
            assert_eq!(
                run(PlaybackState::Reconnecting, input),
                Transition::to(PlaybackState::Reconnecting, effects)
            );
        }

        let skip = run(PlaybackState::Reconnecting, Input::Skip);
        assert_eq!(skip.effects[0], Effect::CancelTimers);
        for input in [Input::Stop, Input::Leave] {
            assert_eq!(run(PlaybackState::Reconnecting, input).effects[0], Effect::CancelTimers);
        }
    }

    #[test]
    fn test_transport_while_loading_is_deferred() {
        assert_eq!(
            run(PlaybackState::Connecting, Input::Pause),
            Transition::to(PlaybackState::Connecting, vec![Effect::DeferPause(true)])
        );
        assert_eq!(
            run(PlaybackState::Connecting, Input::Resume).effects,
            vec![Effect::DeferPause(false)]
        );
        assert_eq!(
            run(PlaybackState::Connecting, Input::Seek(4_000)).effects,
            vec![Effect::DeferSeek(4_000), Effect::NodeSeek(4_000)]
        );
        assert_eq!(
            transition(PlaybackState::Skipping, &Input::Pause),
            Err(PlaybackError::NothingPlaying)
        );
    }

    #[test]
    fn test_filters_pass_through_in_any_state() {
        for state in [PlaybackState::Idle, PlaybackState::Playing, PlaybackState::Paused] {
            assert_eq!(run(state, Input::SetFilters), Transition::to(state, vec![Effect::NodeFilters]));
        }
    }

    #[test]
    fn test_stuck_track_buffers_until_position_moves() {
        assert_eq!(run(PlaybackState::Playing, Input::TrackStuck).next, PlaybackState::Buffering);
        assert_eq!(run(PlaybackState::Buffering, Input::PositionUpdate).next, PlaybackState::Playing);
        assert_eq!(run(PlaybackState::Paused, Input::PositionUpdate).next, PlaybackState::Paused);
    }

    #[test]
    fn test_out_of_context_node_events_are_ignored() {
        let t = run(PlaybackState::Idle, Input::TrackEnded(TrackEndReason::Stopped));
        assert_eq!(t, Transition::stay(PlaybackState::Idle));
        let t = run(PlaybackState::Idle, Input::ConnectionRestored);
        assert_eq!(t, Transition::stay(PlaybackState::Idle));
    }

    #[test]
    fn test_machine_keeps_state_on_rejected_input() {
        let mut machine = PlaybackStateMachine::new();
        assert!(machine.apply(&Input::Resume).is_err());
        assert_eq!(machine.state(), PlaybackState::Idle);
        machine.apply(&Input::Play).unwrap();
        assert_eq!(machine.state(), PlaybackState::Connecting);
        machine.restore(PlaybackState::Idle);
        assert_eq!(machine.state().to_string(), "idle");
    }
}
