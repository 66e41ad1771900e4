use crate::error::ConfigError;
use std::fmt;
use std::str::FromStr;

/// The kind of work a span represents, derived from its name.
///
/// Sampling ratios and slow-operation thresholds are configured per category,
/// so that high-volume work (world updates, network packets) can be sampled
/// sparsely while still being held to a tight latency budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpanCategory {
    /// Any span that does not match a more specific category.
    Default,
    /// World and map update ticks (`Update*`, `Map.*`).
    Update,
    /// Network packet handling (`Packet*`, `Recv*`, `Send*`).
    Packet,
    /// Script hooks (`WorldScript*`).
    WorldScript,
}

const UPDATE_PREFIXES: &[&str] = &["Update", "Map."];
const PACKET_PREFIXES: &[&str] = &["Packet", "Recv", "Send"];
const WORLD_SCRIPT_PREFIXES: &[&str] = &["WorldScript"];

impl SpanCategory {
    /// All categories, in declaration order.
    pub const ALL: [SpanCategory; 4] = [
        SpanCategory::Default,
        SpanCategory::Update,
        SpanCategory::Packet,
        SpanCategory::WorldScript,
    ];

    /// Classifies a span by its name prefix, ignoring ASCII case.
    pub fn from_span_name(name: &str) -> Self {
        if has_any_prefix(name, UPDATE_PREFIXES) {
            SpanCategory::Update
        } else if has_any_prefix(name, PACKET_PREFIXES) {
            SpanCategory::Packet
        } else if has_any_prefix(name, WORLD_SCRIPT_PREFIXES) {
            SpanCategory::WorldScript
        } else {
            SpanCategory::Default
        }
    }

    /// The lowercase name used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanCategory::Default => "default",
            SpanCategory::Update => "update",
            SpanCategory::Packet => "packet",
            SpanCategory::WorldScript => "worldscript",
        }
    }
}

fn has_any_prefix(name: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|prefix| {
        name.get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    })
}

impl fmt::Display for SpanCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpanCategory {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        SpanCategory::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigError::UnknownCategory(s.to_string()))
    }
}

/// One value per [`SpanCategory`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PerCategory<T> {
    default: T,
    update: T,
    packet: T,
    world_script: T,
}

impl<T> PerCategory<T> {
    /// Creates a table from one value per category.
    pub const fn new(default: T, update: T, packet: T, world_script: T) -> Self {
        PerCategory {
            default,
            update,
            packet,
            world_script,
        }
    }

    /// Returns the value configured for `category`.
    pub fn get(&self, category: SpanCategory) -> &T {
        match category {
            SpanCategory::Default => &self.default,
            SpanCategory::Update => &self.update,
            SpanCategory::Packet => &self.packet,
            SpanCategory::WorldScript => &self.world_script,
        }
    }

    /// Replaces the value configured for `category`.
    pub fn set(&mut self, category: SpanCategory, value: T) {
        match category {
            SpanCategory::Default => self.default = value,
            SpanCategory::Update => self.update = value,
            SpanCategory::Packet => self.packet = value,
            SpanCategory::WorldScript => self.world_script = value,
        }
    }

    pub(crate) fn map<U>(self, mut f: impl FnMut(T) -> U) -> PerCategory<U> {
        PerCategory {
            default: f(self.default),
            update: f(self.update),
            packet: f(self.packet),
            world_script: f(self.world_script),
        }
    }
}
