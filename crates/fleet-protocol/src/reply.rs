//! Device command protocol.
//!
//! Plain text, one command per read, one reply per command. A command that
//! exactly matches the device's vocabulary is answered with a random integer
//! in [`REPLY_RANGE`]; anything else is answered with [`NO_MATCH_REPLY`].

use std::ops::RangeInclusive;
use std::sync::Arc;

use rand::Rng;

/// Largest command read in a single message.
pub const MAX_COMMAND_SIZE: usize = 1024;

/// Reply for commands outside the vocabulary.
pub const NO_MATCH_REPLY: &str = "0";

/// Range of replies for recognized commands.
pub const REPLY_RANGE: RangeInclusive<u32> = 1..=100;

/// Immutable snapshot of a device's command vocabulary.
///
/// Cheap to clone; each accepted connection holds its own copy so later
/// edits to the device never affect connections already in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSet(Arc<[String]>);

impl CommandSet {
    pub fn new(commands: &[String]) -> Self {
        Self(commands.iter().cloned().collect())
    }

    pub fn contains(&self, command: &str) -> bool {
        self.0.iter().any(|c| c == command)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Computes the reply for one raw message.
    pub fn reply(&self, message: &[u8]) -> String {
        self.reply_with(message, &mut rand::thread_rng())
    }

    /// Computes the reply using the supplied random source.
    ///
    /// Non-UTF-8 input never matches.
    pub fn reply_with<R: Rng + ?Sized>(&self, message: &[u8], rng: &mut R) -> String {
        match std::str::from_utf8(message) {
            Ok(command) if self.contains(command) => rng.gen_range(REPLY_RANGE).to_string(),
            _ => NO_MATCH_REPLY.to_string(),
        }
    }
}

impl Default for CommandSet {
    fn default() -> Self {
        Self(Arc::from(Vec::new()))
    }
}

impl From<&[String]> for CommandSet {
    fn from(commands: &[String]) -> Self {
        Self::new(commands)
    }
}
