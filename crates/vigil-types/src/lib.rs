//! Core types shared across all vigil crates.
//!
//! Defines configuration, identifiers, intervention records and the error
//! type used by the supervisor core and the CLI.

pub mod config;
pub mod error;
pub mod ids;
pub mod record;

pub use config::{
    CustomRuleConfig, DecisionConfig, DeliveryConfig, GuardConfig, LocatorConfig, PilotConfig,
    StrategyKind, CONFIG_FILENAME,
};
pub use error::VigilError;
pub use ids::SessionId;
pub use record::{Category, InterventionKind, InterventionRecord, Priority};
