//! Types published by the engine.
//!
//! Everything derives `serde::Serialize` + `serde::Deserialize` (camelCase
//! fields, snake_case or lowercase tags) so hosts can forward them as JSON
//! to a UI or the persistence layer unchanged.

pub mod events;
