//! Pakforge - cosmetic mod deployment pipeline
//!
//! Fetches a shared base payload from ranked mirrors, patches the game's
//! item configuration, repacks the content archive with the external vpk
//! tool, and swaps it into a live installation, reconciling conflicts
//! between independent mod sources along the way.

pub mod conflict;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod install_log;
pub mod keyvalues;
pub mod pipeline;
pub mod priority;
pub mod recompile;
pub mod replace;
pub mod runner;
pub mod sources;
