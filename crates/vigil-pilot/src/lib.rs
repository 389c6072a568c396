//! Supervision core for terminal-driven coding agents.
//!
//! Watches what a target program prints to its terminal, recognises
//! questions, confusion and errors, and answers questions by injecting a
//! response into the target's input.
//!
//! - [`rules`] and [`classifier`] turn output chunks into detections.
//! - [`guard`] suppresses the supervisor's own echoed responses.
//! - [`decision`] picks a response through an optional [`DecisionOracle`]
//!   and applies the confidence gate.
//! - [`delivery`] runs the injection cascade with a raw terminal fallback.
//! - [`locator`] and [`process`] find the target among the shell's children.
//! - [`supervisor`] runs one actor per session and emits [`SupervisorEvent`]s.
//! - [`pty`] provides the pseudo-terminal the CLI supervises.

pub mod ansi;
pub mod classifier;
pub mod decision;
pub mod delivery;
pub mod event;
pub mod guard;
pub mod locator;
pub mod output;
pub mod process;
pub mod pty;
pub mod rules;
pub mod session;
pub mod supervisor;

pub use classifier::{classify, Classification, Detection};
pub use decision::{
    DecisionOracle, Escalation, EscalationKind, GuidanceSink, OracleContext, OracleDecision,
};
pub use delivery::{DeliveryReport, DeliveryRequest, DeliveryStrategy, TerminalChannel};
pub use event::{EventKind, SupervisorEvent};
pub use guard::{LoopGuard, Veto};
pub use locator::{LocatorState, TargetIdentity};
pub use process::{ProcessInfo, ProcessTable, SystemProcessTable};
pub use rules::{Rule, RuleKind, RuleTable};
pub use session::{SessionSnapshot, SessionStats};
pub use supervisor::{SessionCommand, SessionFeed, SessionHandle, StrategyFactory, Supervisor};
