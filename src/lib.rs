// Persistent memory for a ticket-based support agent.
//
// - `core/` = domain models, store traits and services (no storage details)
// - `infra/` = SQLite, JSON-file and in-memory implementations of the core traits

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with several mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
pub mod core;
#[path = "infra/infra_layer.rs"]
pub mod infra;
