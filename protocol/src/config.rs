//! # Protocol Configuration & Constants
//!
//! Every magic number in stakescope lives here. If you're hardcoding an
//! interval or a fan-out somewhere else, move it here first.
//!
//! The gossip values are tuned for clusters of a few thousand nodes talking
//! over the public internet: packets must fit the IPv6 minimum MTU, rounds
//! must be frequent enough to converge within a minute, and nothing may be
//! chatty enough to look like an amplification vector.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Wire Format
// ---------------------------------------------------------------------------

/// Largest UDP payload we ever emit or accept. 1280 (IPv6 minimum MTU)
/// minus 40 bytes of IPv6 header minus 8 bytes of UDP header.
pub const PACKET_DATA_SIZE: usize = 1280 - 40 - 8;

/// Upper bound on the payload body of a single gossip value. Leaves room
/// for the value's envelope and the message header around it; anything
/// larger is rejected on decode.
pub const MAX_CRDS_VALUE_SIZE: usize = PACKET_DATA_SIZE - 160;

/// Ed25519 public key length in bytes.
pub const IDENTITY_LENGTH: usize = 32;

/// Ed25519 signature length. Always 64 bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Domain separator hashed into pong replies so that a pong can never be
/// replayed as a signature over anything else.
pub const PING_PONG_HASH_PREFIX: &[u8] = b"STAKESCOPE_PING_PONG";

// ---------------------------------------------------------------------------
// Gossip Timing
// ---------------------------------------------------------------------------

/// How often a pull round runs.
pub const PULL_INTERVAL: Duration = Duration::from_millis(2_000);

/// How often a push round runs. Pushes are cheap and carry the freshest
/// information, so they run faster than pulls.
pub const PUSH_INTERVAL: Duration = Duration::from_millis(500);

/// How often maintenance (eviction, prunes, self refresh checks) runs.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(1_000);

/// How often the local node re-signs its own records.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// An entry not refreshed for this long is evicted from the directory.
pub const ENTRY_TIMEOUT: Duration = Duration::from_secs(60);

/// Values whose wallclock is further than this from local time are not
/// pushed: they are either stale or from a badly skewed clock.
pub const PUSH_MSG_TIMEOUT: Duration = Duration::from_secs(30);

/// Window during which a value already pushed to a peer is not pushed again.
pub const PUSHED_WINDOW: Duration = Duration::from_secs(30);

/// How long a prune request stays in force.
pub const PRUNE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a successful pong keeps a peer promoted to verified.
pub const PING_TTL: Duration = Duration::from_secs(1_280);

/// Minimum delay between two pings to the same peer.
pub const PING_RATE_LIMIT: Duration = Duration::from_secs(10);

/// Every UDP send is abandoned after this long.
pub const SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// First pause after a failed socket receive; doubles per consecutive
/// failure up to [`RECV_ERROR_BACKOFF_MAX`].
pub const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Longest pause between receive attempts on a failing socket.
pub const RECV_ERROR_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// No valid packet for this long escalates to an operational warning.
pub const SILENCE_THRESHOLD: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Gossip Fan-out & Limits
// ---------------------------------------------------------------------------

/// Number of peers each fresh value is pushed to (redundancy factor).
pub const PUSH_FANOUT: usize = 6;

/// Number of peers contacted per pull round.
pub const PULL_FANOUT: usize = 3;

/// Maximum number of values returned for one pull request.
pub const MAX_PULL_RESPONSE_VALUES: usize = 64;

/// Origins delivered by more than this many peers trigger prunes.
pub const MIN_INGRESS_NODES: usize = 2;

/// Upper bound on the number of pings sent per maintenance tick.
pub const MAX_PINGS_PER_ROUND: usize = 32;

/// Bloom filter false-positive rate targeted by pull requests.
pub const BLOOM_FALSE_RATE: f64 = 0.1;

/// Bloom filter bit budget per pull request. Chosen so that a filter, its
/// mask and the caller's contact record fit in one packet.
pub const BLOOM_MAX_BITS: usize = 512 * 8;

/// Largest number of services a contact record may advertise. Keeps the
/// record small enough to ride along with a full bloom filter.
pub const MAX_SERVICES: usize = 8;

/// Largest number of origins one prune message may name.
pub const MAX_PRUNE_ORIGINS: usize = 32;

// ---------------------------------------------------------------------------
// Stake
// ---------------------------------------------------------------------------

/// Stake only changes at epoch boundaries. Once a minute is plenty.
pub const STAKE_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Timeout for one stake RPC request.
pub const STAKE_RPC_TIMEOUT: Duration = Duration::from_secs(15);

/// Number of base units in one whole token, for human-friendly thresholds.
pub const BASE_UNITS_PER_TOKEN: u64 = 1_000_000_000;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Default gossip listening port.
pub const DEFAULT_GOSSIP_PORT: u16 = 8001;

/// Default HTTP API port.
pub const DEFAULT_API_PORT: u16 = 9741;

/// Software version advertised in the local contact record.
pub const SOFTWARE_VERSION: (u16, u16, u16) = (0, 1, 0);
