//! Worker process for the sync core: scheduler, trigger listeners, and a
//! thin admin surface. `main.rs` stays thin; wiring lives in `boot`.

pub mod boot;
pub mod routes;
pub mod state;
