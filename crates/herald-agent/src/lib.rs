//! The agentic core: provider↔tool loop, spend accounting, compaction, and
//! sub-agent spawning.

pub mod agentic;
pub mod compact;
pub mod cost;
pub mod spawn;

pub use agentic::{run_agentic_loop, AgentError, LoopObserver, LoopOptions};
pub use compact::compact_session;
pub use cost::{CostLedger, CostReport};
pub use spawn::{SpawnTool, SubAgentDefaults};
