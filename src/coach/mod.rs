//! Conversation orchestration core.
//!
//! The pipeline sequences the leaf components: crisis interception,
//! pattern detection, context assembly, the retried inference call,
//! phase evaluation, and background commitment extraction. Scheduled
//! checkins reuse the same context assembly through a separate entry
//! point.

pub mod checkin;
pub mod commitments;
pub mod context;
pub mod crisis;
pub mod patterns;
pub mod phase;
pub mod pipeline;
pub mod prompts;

pub use checkin::{CheckinKind, CheckinRunner, spawn_checkin_schedulers};
pub use commitments::{
    CommitmentExtractor, ExtractionHandle, ExtractionJob, extraction_queue,
    spawn_extraction_worker,
};
pub use context::ContextAssembler;
pub use crisis::CrisisSignal;
pub use patterns::PatternDetector;
pub use pipeline::{MessagePipeline, RetryPolicy, UserLocks};
