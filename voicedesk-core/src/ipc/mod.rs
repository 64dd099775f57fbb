//! Types broadcast from the engine to host shells.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a shell can
//! relay them as JSON.

pub mod events;
