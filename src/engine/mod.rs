pub mod budget;
pub mod completion;
pub mod compression;
pub mod dispatch;
pub mod generation;
pub mod iteration;
pub mod parser;
pub mod reaper;
pub mod scheduler;

pub use budget::{can_spawn, AgentForest, SpawnBudget, SpawnCheck};
pub use completion::{CompletionTrigger, SynthesisOutcome, Synthesizer};
pub use dispatch::{DispatchError, Dispatcher, TickMode, TickReport, TickResponse, TickStatus};
pub use iteration::{IterationEngine, IterationOutcome};
pub use parser::{parse_reply, IterationResult, ParsedReply};
pub use reaper::StaleMissionReaper;
pub use scheduler::ClaimScheduler;
