//! Decides why an upstream read stopped.
//!
//! The same transport error can mean different things: a cancelled read is a
//! clean end of the session when the client has gone, a timeout when the
//! deadline has passed, and an upstream fault otherwise. The decision uses
//! where the read was suspended and what the session knew at that moment.

use crate::client::{ReadError, ReadErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    ClientCancelled,
    Timeout,
    ProtocolError,
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspensionPoint {
    /// Waiting for response headers.
    Connect,
    BodyRead,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadContext {
    pub point: SuspensionPoint,
    /// The client subscription has been dropped.
    pub client_gone: bool,
    pub deadline_passed: bool,
    pub bytes_received: usize,
}

pub fn classify(err: &ReadError, ctx: &ReadContext) -> FailureCause {
    match err.kind {
        ReadErrorKind::Cancelled if ctx.client_gone => FailureCause::ClientCancelled,
        ReadErrorKind::Cancelled if ctx.deadline_passed => FailureCause::Timeout,
        ReadErrorKind::Cancelled => FailureCause::ProtocolError,
        ReadErrorKind::TimedOut => FailureCause::Timeout,
        ReadErrorKind::Connect | ReadErrorKind::Io
            if ctx.point == SuspensionPoint::Connect && ctx.bytes_received == 0 =>
        {
            FailureCause::Unreachable
        }
        ReadErrorKind::Connect | ReadErrorKind::Io | ReadErrorKind::Protocol => {
            FailureCause::ProtocolError
        }
    }
}
