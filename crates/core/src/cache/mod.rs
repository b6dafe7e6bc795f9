pub mod dedup;
pub mod response;
pub mod slots;
pub mod ttl;

pub use dedup::{DedupDecision, DedupGuard, DedupKey};
pub use response::{CannedKind, CannedReply, ResponseCache, ResponseCacheStats};
pub use slots::{SlotCache, SlotCacheStats, SlotFreshness, SlotLookup};
pub use ttl::{CacheEntry, TtlCache};
