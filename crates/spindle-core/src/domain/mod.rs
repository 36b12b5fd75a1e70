//! Domain model (ids, phase, records, exports, logic, attempts, events, errors).

pub mod attempt;
pub mod errors;
pub mod events;
pub mod exports;
pub mod ids;
pub mod logic;
pub mod phase;
pub mod record;

pub use attempt::{BuildAttempt, Outcome, OutcomeKind};
pub use errors::{ErrorKind, SpindleError};
pub use events::SchedulerEvent;
pub use exports::{Exports, Injection};
pub use ids::{AttemptId, UnitId};
pub use logic::{BuildContext, EventHandler, FnLogic, Logic, LogicError, logic_fn};
pub use phase::Phase;
pub use record::{ComponentRecord, UnitStatus};
