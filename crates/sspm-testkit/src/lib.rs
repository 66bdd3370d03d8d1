//! In-process test doubles for the sync core: an in-memory [`sspm_store::Store`],
//! a collecting reporter, scripted integrations/definitions, and a recording
//! rules engine. Scenario tests across the workspace compose these instead
//! of a live database.

mod mem_store;
mod scripted;

pub use mem_store::{MemEntity, MemStore};
pub use scripted::{
    CollectingReporter, RecordingRulesEngine, ScriptedDefinition, ScriptedIntegration,
};
