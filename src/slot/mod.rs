pub mod cache;
pub mod key;
pub mod resolver;
pub mod vast;

pub use cache::RegexSlotCache;
pub use resolver::{MatchKind, ResolvedSlot, SlotResolver};
pub use vast::{VastDurationBounds, VastResolution};
