//! Consensus-wide constants shared across validation and the p2p layer.

/// The maximum allowed number of outputs in a transaction (network rule).
pub const MAX_TX_OUTPUTS: usize = u16::MAX as usize;
/// The minimum number of outputs in a coinbase transaction (network rule).
pub const MIN_COINBASE_OUTPUTS: usize = 2;
/// Numerator of the coinbase share owed to the foundation address.
pub const FOUNDATION_REWARD_NUMERATOR: i64 = 3;
/// Denominator of the coinbase share owed to the foundation address.
pub const FOUNDATION_REWARD_DENOMINATOR: i64 = 10;

/// Sanity-check version bit: when set, output program hashes must carry a
/// known prefix.
pub const CHECK_TX_OUT: u32 = 0x0000_0001;

/// Sequence an input must carry to spend a time-locked output.
pub const FINAL_SEQUENCE: u32 = u32::MAX - 1;

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: u32 = 0;
/// Maximum number of peers tracked by the registry; persistent peers are
/// exempt.
pub const DEFAULT_MAX_PEERS: usize = 125;
/// Maximum number of block hashes returned for a single getblocks request.
pub const MAX_BLOCKS_PER_MSG: usize = 500;
/// Maximum number of inventory vectors in a single inv/getdata message.
pub const MAX_INV_PER_MSG: usize = 50_000;
/// Maximum payload size of a response-blocks message.
pub const RESPONSE_BLOCKS_MAX_SIZE: usize = 8_000_000 * 10;
/// Payload size of a request-consensus message: a single height.
pub const REQUEST_CONSENSUS_SIZE: usize = 4;

/// Service flag advertising the public SPV service; mempool requests are
/// only honored when set.
pub const OPEN_SERVICE: u64 = 1 << 2;
