//! Fan-out of upstream chunks to session subscribers.
//!
//! Each subscriber owns a bounded channel. A full channel gets a short grace
//! to drain; a subscriber still full after it is detached, so every
//! subscriber sees an in-order, gap-free prefix of the response. A closed
//! channel removes the subscriber from the set.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use futures::future::join_all;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::DropGuard;

use super::state::FailureReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_type: Option<String>,
    pub streaming: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Head(ResponseHead),
    Data(Bytes),
    Failed(FailureReason),
}

/// Receiving end held by a client or another sink.
///
/// The client's subscription carries a guard; dropping it tells the session
/// the client has gone, which changes how a cancelled read is classified.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Frame>,
    _presence: Option<DropGuard>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Reads to the end and joins every data frame.
    pub async fn collect(mut self) -> Collected {
        let mut collected = Collected::default();
        let mut body = BytesMut::new();
        while let Some(frame) = self.rx.recv().await {
            match frame {
                Frame::Head(head) => collected.head = Some(head),
                Frame::Data(chunk) => {
                    collected.frames += 1;
                    body.extend_from_slice(&chunk);
                }
                Frame::Failed(reason) => collected.failure = Some(reason),
            }
        }
        collected.body = body.freeze();
        collected
    }
}

impl Stream for Subscription {
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Collected {
    pub head: Option<ResponseHead>,
    pub body: Bytes,
    pub frames: usize,
    pub failure: Option<FailureReason>,
}

struct Sink {
    id: u64,
    tx: mpsc::Sender<Frame>,
}

pub(crate) struct SubscriberSet {
    sinks: Vec<Sink>,
    capacity: usize,
    patience: Duration,
    next_id: u64,
}

impl SubscriberSet {
    pub(crate) fn new(capacity: usize, patience: Duration) -> Self {
        Self {
            sinks: Vec::new(),
            capacity: capacity.max(2),
            patience,
            next_id: 0,
        }
    }

    /// Registers a subscriber, seeding it with `prefix` before any live frame.
    pub(crate) fn add(&mut self, prefix: Vec<Frame>, presence: Option<DropGuard>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity.max(prefix.len()));
        for frame in prefix {
            let _ = tx.try_send(frame);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.sinks.push(Sink { id, tx });
        Subscription {
            id,
            rx,
            _presence: presence,
        }
    }

    /// Delivers `frame` to every subscriber.
    ///
    /// Full subscribers are waited on together for at most `patience`, so one
    /// lagging client costs the read loop one grace period, not one per client.
    pub(crate) async fn broadcast(&mut self, frame: &Frame) {
        let mut full = Vec::new();
        self.sinks.retain(|sink| match sink.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                full.push((sink.id, sink.tx.clone(), frame));
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = sink.id, "Subscriber detached");
                false
            }
        });
        if full.is_empty() {
            return;
        }

        let patience = self.patience;
        let delivered = join_all(full.into_iter().map(|(id, tx, frame)| async move {
            (id, tx.send_timeout(frame, patience).await.is_ok())
        }))
        .await;
        for (id, ok) in delivered {
            if !ok {
                tracing::debug!(
                    subscriber = id,
                    patience_ms = patience.as_millis() as u64,
                    "Subscriber lagging; detached"
                );
                self.sinks.retain(|sink| sink.id != id);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Drops every sender so subscribers observe end of stream.
    pub(crate) fn close(&mut self) {
        self.sinks.clear();
    }
}
