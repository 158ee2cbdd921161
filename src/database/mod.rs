/*!
 * Database module for persistent pipeline state.
 *
 * This module provides SQLite-based persistence for:
 * - Tasks and their per-stage run history
 * - Segments of the translate and synthesize stages
 * - Append-only recovery snapshots
 * - The task queue and stage artifacts
 */

pub mod connection;
pub mod models;
pub mod repository;
pub mod schema;

// Re-export main types
pub use connection::DatabaseConnection;
pub use repository::{QueueStatusPatch, QueueUpdate, Repository};
