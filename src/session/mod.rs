//! Streaming session engine.
//!
//! A session owns one upstream call from dispatch to its terminal state:
//!
//! ```text
//! Created → Forwarding → {Streaming | Buffering} → Completing → {Completed, Failed}
//! ```
//!
//! Chunks are fanned out to subscribers in read order. When the client
//! disconnects the session keeps what it has, ends as a partial success, and
//! still persists and accounts the output.

mod classify;
mod engine;
mod registry;
mod state;
mod subscriber;
mod usage;

pub use classify::{FailureCause, ReadContext, SuspensionPoint, classify};
pub use engine::{EngineConfig, SessionControl, SessionEngine, SessionHandle, SessionRequest};
pub use registry::{ActiveSessions, SessionGuard};
pub use state::{FailureReason, SessionOutcome, SessionReport, SessionState};
pub use subscriber::{Collected, Frame, ResponseHead, Subscription};
pub use usage::UsageTracker;
