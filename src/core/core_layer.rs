// The core module contains all business logic.
// Nothing in here knows which database or file format sits underneath.

#[path = "memory/mod.rs"]
pub mod memory;
