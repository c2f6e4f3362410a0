//! DJ-role policy and skip votes.
//!
//! Restricted commands go through [`PermissionPolicy::can_execute`]. A skip or
//! a jump back to the previous track that interrupts somebody else's track
//! becomes a vote, counted by [`SkipVotes`] per playing entry. Each of the two
//! commands keeps its own tally.

use serenity::model::id::{ChannelId, RoleId, UserId};
use std::{collections::HashSet, fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Play,
    Pause,
    Resume,
    Skip,
    SkipTo,
    Previous,
    Stop,
    Seek,
    SetVolume,
    SetFilters,
    SetLoop,
    Remove,
    Move,
    Shuffle,
    Clear,
    Disconnect,
}

impl CommandKind {
    /// Comandos que requieren DJ (o estar solo en el canal).
    pub fn is_restricted(&self) -> bool {
        matches!(
            self,
            CommandKind::Skip
                | CommandKind::SkipTo
                | CommandKind::Previous
                | CommandKind::Stop
                | CommandKind::SetVolume
                | CommandKind::SetFilters
                | CommandKind::SetLoop
                | CommandKind::Remove
                | CommandKind::Move
                | CommandKind::Shuffle
                | CommandKind::Clear
                | CommandKind::Disconnect
        )
    }
}

/// Quién envía el comando, tal como lo ve la capa de chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub user_id: UserId,
    pub roles: Vec<RoleId>,
    pub is_admin: bool,
    pub voice_channel: Option<ChannelId>,
}

impl Requester {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            roles: Vec::new(),
            is_admin: false,
            voice_channel: None,
        }
    }

    pub fn with_roles(mut self, roles: Vec<RoleId>) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }

    pub fn in_channel(mut self, channel_id: ChannelId) -> Self {
        self.voice_channel = Some(channel_id);
        self
    }

    pub fn has_role(&self, role_id: RoleId) -> bool {
        self.roles.contains(&role_id)
    }
}

/// Lo que la política necesita saber de la sesión.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    pub dj_role: Option<RoleId>,
    /// Humanos en el canal de voz de la sesión (sin bots).
    pub listeners: &'a [UserId],
    pub current_requester: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    /// Solo para skip y previous: el comando cuenta como un voto.
    Vote,
}

/// Regla de redondeo del umbral de votos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoteRule {
    /// Más de la mitad de los oyentes.
    #[default]
    Majority,
    /// La mitad o más.
    HalfOrMore,
}

impl VoteRule {
    pub fn required(&self, humans: usize) -> usize {
        let required = match self {
            VoteRule::Majority => humans / 2 + 1,
            VoteRule::HalfOrMore => humans.div_ceil(2),
        };
        required.max(1)
    }
}

impl FromStr for VoteRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "majority" | "gt50" => Ok(VoteRule::Majority),
            "half" | "ge50" => Ok(VoteRule::HalfOrMore),
            other => Err(format!("unknown skip vote rule '{}'", other)),
        }
    }
}

impl fmt::Display for VoteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VoteRule::Majority => "majority",
            VoteRule::HalfOrMore => "half",
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionPolicy {
    vote_rule: VoteRule,
}

impl PermissionPolicy {
    pub fn new(vote_rule: VoteRule) -> Self {
        Self { vote_rule }
    }

    pub fn vote_rule(&self) -> VoteRule {
        self.vote_rule
    }

    pub fn can_execute(
        &self,
        command: CommandKind,
        requester: &Requester,
        ctx: &PolicyContext<'_>,
    ) -> Decision {
        if !command.is_restricted() {
            return Decision::Allow;
        }

        let is_dj = ctx.dj_role.is_some_and(|role| requester.has_role(role));
        if is_dj || requester.is_admin {
            return Decision::Allow;
        }

        // Solo en el canal (o sin nadie más escuchando)
        if ctx.listeners.iter().all(|user| *user == requester.user_id) {
            return Decision::Allow;
        }

        match command {
            CommandKind::Skip | CommandKind::Previous
                if ctx.current_requester == Some(requester.user_id) =>
            {
                Decision::Allow
            }
            // Volver atrás sin nada sonando no interrumpe a nadie
            CommandKind::Previous if ctx.current_requester.is_none() => Decision::Allow,
            CommandKind::Skip | CommandKind::Previous => Decision::Vote,
            _ => Decision::Deny,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteTally {
    pub votes: usize,
    pub required: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Passed,
    Pending(VoteTally),
}

/// Votos (de skip o de previous) del track que está sonando. Se reinicia al
/// cambiar de track.
#[derive(Debug, Default, Clone)]
pub struct SkipVotes {
    entry_id: Option<u64>,
    voters: HashSet<UserId>,
}

impl SkipVotes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra un voto para `entry_id`. Solo cuentan los votantes que siguen
    /// en el canal; un mismo usuario nunca cuenta dos veces.
    pub fn cast(
        &mut self,
        entry_id: u64,
        voter: UserId,
        listeners: &[UserId],
        rule: VoteRule,
    ) -> VoteOutcome {
        if self.entry_id != Some(entry_id) {
            self.entry_id = Some(entry_id);
            self.voters.clear();
        }

        if listeners.contains(&voter) {
            self.voters.insert(voter);
        }

        let votes = self
            .voters
            .iter()
            .filter(|user| listeners.contains(user))
            .count();
        let required = rule.required(listeners.len());

        if votes >= required {
            self.reset();
            VoteOutcome::Passed
        } else {
            VoteOutcome::Pending(VoteTally { votes, required })
        }
    }

    pub fn reset(&mut self) {
        self.entry_id = None;
        self.voters.clear();
    }
}
