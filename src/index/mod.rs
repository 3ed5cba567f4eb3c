pub mod governor;
pub mod holding;
pub mod holdings;

pub use governor::{CapacityGovernor, DEFAULT_EXCESS_FACTOR, DEFAULT_KEEP_FLOOR};
pub use holding::{Holding, HoldingStore, PersistOutcome, DEFAULT_VANISH_GRACE};
pub use holdings::{HoldingIndex, Placement, DEFAULT_GROW_CHUNK};
