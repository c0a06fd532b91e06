//! Provider abstractions.
//!
//! The actual STT engine, LLM, and mail transport are external
//! collaborators; each gets one capability trait and a deterministic mock
//! used for local runs and tests. Selection happens once at startup from
//! config.

pub mod delivery;
pub mod enhance;
pub mod stt;
