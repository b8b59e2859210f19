//! Structured build log entries as produced by the worker and the agent.

/// Verbosity of a log entry, in Nix order: `error` is the most important,
/// `vomit` the chattiest.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Notice = 2,
    Info = 3,
    Talkative = 4,
    Chatty = 5,
    Debug = 6,
    Vomit = 7,
}

impl Level {
    /// Decode a level from its wire byte.
    pub fn from_u8(value: u8) -> Option<Level> {
        use Level::*;
        Some(match value {
            0 => Error,
            1 => Warn,
            2 => Notice,
            3 => Info,
            4 => Talkative,
            5 => Chatty,
            6 => Debug,
            7 => Vomit,
            _ => return None,
        })
    }

    /// The wire byte of the level.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A typed value attached to an activity or result.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Field {
    /// An unsigned integer field.
    Int(u64),
    /// A string field.
    String(String),
}

/// One record of the build log. `ms` is milliseconds since logger start and
/// is monotonically non-decreasing in enqueue order per producer. `act_id`
/// and `parent` form a forest of nested activities.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogEntry {
    /// A plain message line.
    Msg {
        level: Level,
        ms: u64,
        text: String,
    },
    /// Start of a nested, timed span of work.
    StartActivity {
        act_id: u64,
        level: Level,
        ms: u64,
        kind: u64,
        text: String,
        fields: Vec<Field>,
        parent: u64,
    },
    /// End of a previously started activity.
    StopActivity {
        act_id: u64,
        ms: u64,
    },
    /// A typed result attached to a running activity.
    Result {
        act_id: u64,
        ms: u64,
        kind: u64,
        fields: Vec<Field>,
    },
}

impl LogEntry {
    /// Milliseconds since logger start carried by the entry.
    pub fn ms(&self) -> u64 {
        match self {
            LogEntry::Msg { ms, .. }
            | LogEntry::StartActivity { ms, .. }
            | LogEntry::StopActivity { ms, .. }
            | LogEntry::Result { ms, .. } => *ms,
        }
    }

    /// Whether the bus may drop the entry when full. Activity records are
    /// never dropped, plain messages are.
    pub fn is_discardable(&self) -> bool {
        matches!(self, LogEntry::Msg { .. })
    }

    /// The level of a `Msg` entry, `None` for activity records.
    pub(crate) fn msg_level(&self) -> Option<Level> {
        match self {
            LogEntry::Msg { level, .. } => Some(*level),
            _ => None,
        }
    }
}
