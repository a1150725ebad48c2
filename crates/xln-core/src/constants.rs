//! Protocol constants shared by both consensus layers.

/// Maximum transactions queued per bilateral account.
pub const MEMPOOL_LIMIT: usize = 1000;

/// Committed frames retained in the in-memory history tail.
pub const FRAME_HISTORY_LIMIT: usize = 10;

/// Hard cap on an encoded account frame.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Hard cap on transactions inside one account frame.
pub const MAX_FRAME_TXS: usize = 1000;

/// The prev-frame reference carried by every height-0 frame.
pub const GENESIS_PREV_HASH: &str = "genesis";

/// Quorum fraction for entity commits (numerator / denominator).
pub const QUORUM_NUM: u64 = 2;
pub const QUORUM_DEN: u64 = 3;

/// Maximum routes returned by pathfinding.
pub const MAX_ROUTES: usize = 100;

/// Fee parts-per-million denominator.
pub const FEE_PPM_DENOMINATOR: u128 = 1_000_000;

/// Default height interval between periodic snapshots.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 100;
