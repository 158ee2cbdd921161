/*!
 * Stage scheduling for dubbing tasks.
 *
 * - `stage`: the fixed stage sequence
 * - `context`: per-run execution context
 * - `events`: typed events published while a task runs
 * - `media`: the media toolkit behind the atomic stages
 * - `scheduler`: the single-run scheduler driving the sequence
 * - `stages` / `segmented`: stage handlers
 */

pub mod context;
pub mod events;
pub mod media;
pub mod scheduler;
mod segmented;
pub mod stage;
mod stages;

pub use context::ExecutionContext;
pub use events::{EventSink, PipelineEvent};
pub use media::{CommandMediaToolkit, MediaToolkit};
pub use scheduler::{RunOutcome, Scheduler, StartOutcome};
pub use stage::Stage;
