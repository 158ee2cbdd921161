/*!
 * Priority backlog of tasks for the single pipeline worker.
 */

pub mod manager;
pub mod models;

pub use manager::TaskQueue;
pub use models::QueueSnapshot;
