//! Session identity shared by every exchange of one UI session.
//!
//! The id comes from the first source in a chain that can produce one:
//! OS randomness as a v4 UUID, then std's randomly seeded hasher state, then
//! the wall clock. The last source cannot fail.

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::BuildHasher;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A way of producing an opaque session id.
pub trait IdSource {
    fn name(&self) -> &'static str;

    /// `None` when the source is unavailable in this environment.
    fn generate(&self) -> Option<String>;
}

/// v4 UUID from the OS CSPRNG.
pub struct RandomUuid;

impl IdSource for RandomUuid {
    fn name(&self) -> &'static str {
        "random-uuid"
    }

    fn generate(&self) -> Option<String> {
        let mut bytes = [0u8; 16];
        getrandom::fill(&mut bytes).ok()?;
        Some(uuid::Builder::from_random_bytes(bytes).into_uuid().to_string())
    }
}

/// Four hex groups drawn from std's per-process random hasher keys.
pub struct HashedRandom;

impl IdSource for HashedRandom {
    fn name(&self) -> &'static str {
        "hashed-random"
    }

    fn generate(&self) -> Option<String> {
        let state = RandomState::new();
        let groups: Vec<String> = (0u32..4)
            .map(|i| format!("{:08x}", state.hash_one(i) as u32))
            .collect();
        Some(groups.join("-"))
    }
}

/// Wall clock mixed with the process id. Degraded, never fails.
pub struct Clock;

impl IdSource for Clock {
    fn name(&self) -> &'static str {
        "clock"
    }

    fn generate(&self) -> Option<String> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        Some(format!(
            "sess-{}-{:x}",
            epoch_millis(),
            std::process::id() ^ nanos
        ))
    }
}

/// Opaque conversation id sent with every request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Create an id from the default source chain.
    pub fn create() -> Self {
        Self::from_sources(&[&RandomUuid, &HashedRandom, &Clock])
    }

    /// Create an id from the first source that yields one.
    pub fn from_sources(sources: &[&dyn IdSource]) -> Self {
        for source in sources {
            if let Some(id) = source.generate().filter(|id| !id.is_empty()) {
                tracing::debug!(source = source.name(), "session id created");
                return Self(id);
            }
            tracing::warn!(source = source.name(), "session id source unavailable");
        }
        // Every source declined; the clock alone always answers.
        Self(Clock.generate().unwrap_or_else(|| format!("sess-{}", epoch_millis())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
