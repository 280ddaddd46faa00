pub mod memory;
pub mod search;
pub mod stats;
pub mod sweep;

pub use memory::MemoryCommand;
pub use search::{ContextCommand, RecallCommand, SearchCommand};
pub use stats::StatsCommand;
pub use sweep::{ConsolidateCommand, SweepCommand};
