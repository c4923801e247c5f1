//! Shared types and identifiers for coresync.
//!
//! This crate defines the data model used across the coresync workspace:
//! identifiers ([`CoreIdentity`], [`ContentHash`], [`Generation`]),
//! remote state ([`BlobMetadata`], [`SegmentRef`], [`BlobRef`]),
//! scheduling records ([`WorkItem`], [`PullRecord`], [`PullOutcome`]),
//! and configuration ([`SyncConfig`]).

pub mod events;

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Content-addressed identifier for a segment file: `blake3(file_bytes)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash arbitrary data with BLAKE3.
    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }

    /// Return the raw 32-byte representation.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a 64-character lowercase or uppercase hex string.
    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        if s.len() != 64 {
            return Err(ParseError::HexLength(s.len()));
        }
        if !s.is_ascii() {
            return Err(ParseError::HexDigit(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| ParseError::HexDigit(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl From<[u8; 32]> for ContentHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for ContentHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({self})")
    }
}

/// Monotonic version number of a core's remote state.
///
/// Generation 0 means "nothing applied yet"; the first push produces 1.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct Generation(pub u64);

impl Generation {
    /// The generation of a core that has never been pushed or pulled.
    pub const ZERO: Generation = Generation(0);

    /// The generation that follows this one.
    pub fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Addresses one logical shard replica-set's shared copy.
///
/// Displayed and parsed as `collection/shard/core`. Deserialization applies
/// the same component checks as [`CoreIdentity::new`].
#[derive(Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "RawCoreIdentity")]
pub struct CoreIdentity {
    collection: String,
    shard: String,
    core: String,
}

impl CoreIdentity {
    /// Build an identity from its three components.
    ///
    /// Components must be non-empty, must not contain `/`, and must not be
    /// `.` or `..` (identities double as directory names).
    pub fn new(
        collection: impl Into<String>,
        shard: impl Into<String>,
        core: impl Into<String>,
    ) -> Result<Self, ParseError> {
        let id = Self {
            collection: collection.into(),
            shard: shard.into(),
            core: core.into(),
        };
        for part in [&id.collection, &id.shard, &id.core] {
            if part.is_empty() || part.contains('/') || part == "." || part == ".." {
                return Err(ParseError::CoreComponent(part.clone()));
            }
        }
        Ok(id)
    }

    /// Collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Shard name within the collection.
    pub fn shard(&self) -> &str {
        &self.shard
    }

    /// Core name within the shard.
    pub fn core(&self) -> &str {
        &self.core
    }
}

/// Unchecked wire form of [`CoreIdentity`].
#[derive(Deserialize)]
struct RawCoreIdentity {
    collection: String,
    shard: String,
    core: String,
}

impl TryFrom<RawCoreIdentity> for CoreIdentity {
    type Error = ParseError;

    fn try_from(raw: RawCoreIdentity) -> Result<Self, Self::Error> {
        Self::new(raw.collection, raw.shard, raw.core)
    }
}

impl fmt::Display for CoreIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.collection, self.shard, self.core)
    }
}

impl fmt::Debug for CoreIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoreIdentity({self})")
    }
}

impl FromStr for CoreIdentity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(c), Some(s), Some(n), None) => Self::new(c, s, n),
            _ => Err(ParseError::CoreFormat(s.to_string())),
        }
    }
}

/// Errors from parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// A core identity string was not `collection/shard/core`.
    #[error("expected collection/shard/core, got {0:?}")]
    CoreFormat(String),

    /// A core identity component was empty or contained a separator.
    #[error("invalid core identity component {0:?}")]
    CoreComponent(String),

    /// A content hash had the wrong number of hex digits.
    #[error("content hash must be 64 hex digits, got {0}")]
    HexLength(usize),

    /// A content hash contained a non-hex character.
    #[error("invalid hex in content hash {0:?}")]
    HexDigit(String),
}

// ---------------------------------------------------------------------------
// Remote state
// ---------------------------------------------------------------------------

/// A segment file referenced by a generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentRef {
    /// File name as the index engine knows it (e.g. `_0.cfs`).
    pub name: String,
    /// BLAKE3 hash of the file contents.
    pub hash: ContentHash,
    /// File size in bytes.
    pub size: u64,
}

impl SegmentRef {
    /// Describe a segment from its name and contents.
    pub fn for_data(name: impl Into<String>, data: &[u8]) -> Self {
        Self {
            name: name.into(),
            hash: ContentHash::from_data(data),
            size: data.len() as u64,
        }
    }
}

/// Address of one segment blob in the object store.
///
/// Blobs are content-addressed within a core, so a file that survives
/// across generations is stored once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BlobRef {
    /// Core the blob belongs to.
    pub core: CoreIdentity,
    /// Content hash of the blob.
    pub hash: ContentHash,
}

impl BlobRef {
    /// Address the blob backing `segment` in `core`.
    pub fn new(core: CoreIdentity, hash: ContentHash) -> Self {
        Self { core, hash }
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.core, self.hash)
    }
}

/// Authoritative remote state of a core at one generation.
///
/// Created by a push and superseded, never mutated, by the next push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    /// Core this metadata describes.
    pub core: CoreIdentity,
    /// Monotonic generation number.
    pub generation: Generation,
    /// Segment files making up this generation.
    pub segments: Vec<SegmentRef>,
}

impl BlobMetadata {
    /// Whether this generation references a blob with the given hash.
    pub fn references(&self, hash: &ContentHash) -> bool {
        self.segments.iter().any(|s| s.hash == *hash)
    }

    /// Blob references for every segment in this generation.
    pub fn blob_refs(&self) -> impl Iterator<Item = BlobRef> + '_ {
        self.segments
            .iter()
            .map(|s| BlobRef::new(self.core.clone(), s.hash))
    }
}

// ---------------------------------------------------------------------------
// Scheduling records
// ---------------------------------------------------------------------------

/// A request to bring a core up to at least `requested_generation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Core to refresh.
    pub core: CoreIdentity,
    /// Highest generation any trigger asked for.
    pub requested_generation: Generation,
    /// When the first request for this core entered the queue.
    pub enqueued_at: tokio::time::Instant,
}

/// Why a pull was put back without counting as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeferReason {
    /// Another holder kept the core's lease past the acquisition timeout.
    LeaseContended,
    /// The remote generation advanced while the pull held its lease.
    StaleGeneration,
}

/// Result of the most recent pull attempt for a core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullOutcome {
    /// A pull is currently running.
    InProgress,
    /// The core is at the remote generation.
    Succeeded,
    /// The attempt was put back for rescheduling.
    Deferred(DeferReason),
    /// The attempt failed and will be retried.
    Failed {
        /// Error description.
        reason: String,
    },
    /// Retries are exhausted; no further pulls until an operator resets it.
    PermanentlyFailed {
        /// Error description of the last attempt.
        reason: String,
    },
}

impl PullOutcome {
    /// Whether this outcome counts as a failed attempt.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PullOutcome::Failed { .. } | PullOutcome::PermanentlyFailed { .. }
        )
    }
}

/// Bookkeeping of the last pull of one core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRecord {
    /// Core this record describes.
    pub core: CoreIdentity,
    /// Generation the last attempt was asked to reach.
    pub attempted_generation: Generation,
    /// Outcome of the last attempt.
    pub outcome: PullOutcome,
    /// Unix timestamp (milliseconds) of the last update.
    pub updated_at_ms: u64,
    /// Consecutive failed attempts since the last success.
    pub consecutive_failures: u32,
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for the synchronization engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// How long the feeder waits for a core's lease before deferring.
    pub lease_timeout: Duration,
    /// A lease held longer than this is revoked so waiters can proceed.
    pub max_lease_hold: Duration,
    /// Per-request timeout for object store calls during a pull.
    pub fetch_timeout: Duration,
    /// Backoff after the first failed attempt.
    pub backoff_base: Duration,
    /// Upper bound on backoff between attempts.
    pub backoff_max: Duration,
    /// Failed attempts allowed before a core is marked permanently failed.
    pub max_pull_attempts: u32,
    /// Minimum age of a delete candidate before it may be removed.
    pub delete_grace_period: Duration,
    /// Name this node uses as the holder token on its leases.
    pub holder: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(5),
            max_lease_hold: Duration::from_secs(600),
            fetch_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
            max_pull_attempts: 5,
            delete_grace_period: Duration::from_secs(600),
            holder: "coresync".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
