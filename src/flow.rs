//! Edge-triggered back-pressure signalling between engines.
//!
//! Every producer that can flood a peer owns a `PressureSender` and flips it
//! when its outgoing accounting crosses a high or low water mark. A consumer
//! that wants to throttle itself subscribes with a `PressureReceiver` and
//! reacts to the *edges*: a `true` edge pauses reading input, a `false` edge
//! resumes it. Level triggering would loop, since reacting to pressure is
//! itself what relieves it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::task::AtomicWaker;

// state = (epoch << 1) | level. The epoch advances only when the level
// actually changes, so identical sets collapse into nothing.
struct Shared {
    state: AtomicU64,
    waker: AtomicWaker,
}

/// Creates a connected pressure signal pair.
pub fn pressure() -> (PressureSender, PressureReceiver) {
    let shared = Arc::new(Shared {
        state: AtomicU64::new(0),
        waker: AtomicWaker::new(),
    });
    (
        PressureSender {
            shared: shared.clone(),
        },
        PressureReceiver { shared, seen: 0 },
    )
}

/// The producing end of a pressure signal.
#[derive(Clone)]
pub struct PressureSender {
    shared: Arc<Shared>,
}

impl PressureSender {
    /// Sets the pressure level. Only a change of level is observable on the
    /// receiving side.
    pub fn set(&self, pressure: bool) {
        let state = self.shared.state.load(Ordering::Acquire);
        if (state & 1 != 0) == pressure {
            return;
        }
        let epoch = (state >> 1).wrapping_add(1);
        self.shared
            .state
            .store((epoch << 1) | pressure as u64, Ordering::Release);
        self.shared.waker.wake();
    }

    /// The current level, for diagnostics.
    pub fn get(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) & 1 != 0
    }
}

impl std::fmt::Debug for PressureSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureSender")
            .field("pressure", &self.get())
            .finish()
    }
}

/// The consuming end of a pressure signal. Single consumer.
pub struct PressureReceiver {
    shared: Arc<Shared>,
    seen: u64,
}

impl PressureReceiver {
    /// Resolves with the new level each time it changes.
    pub fn poll_edge(&mut self, cx: &mut Context<'_>) -> Poll<bool> {
        self.shared.waker.register(cx.waker());
        let state = self.shared.state.load(Ordering::Acquire);
        let epoch = state >> 1;
        if epoch != self.seen {
            self.seen = epoch;
            Poll::Ready(state & 1 != 0)
        } else {
            Poll::Pending
        }
    }

    /// The current level, without waiting for an edge.
    pub fn get(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) & 1 != 0
    }
}

impl std::fmt::Debug for PressureReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureReceiver")
            .field("pressure", &self.get())
            .finish()
    }
}

/// Tracks the upstream flow currently allowed to throttle an engine.
#[derive(Debug, Default)]
pub struct Throttled {
    upstream: Option<PressureReceiver>,
}

impl Throttled {
    /// Starts out detached from any flow.
    pub fn new() -> Throttled {
        Throttled::default()
    }

    /// Replaces the controlling flow. `None` detaches.
    pub fn throttle(&mut self, controlling: Option<PressureReceiver>) {
        self.upstream = controlling;
    }

    /// Polls for the next pressure edge from the controlling flow.
    pub fn poll_edge(&mut self, cx: &mut Context<'_>) -> Poll<bool> {
        match self.upstream {
            Some(ref mut upstream) => upstream.poll_edge(cx),
            None => Poll::Pending,
        }
    }

    /// The current upstream level; unthrottled when detached.
    pub fn is_pressured(&self) -> bool {
        self.upstream.as_ref().map_or(false, PressureReceiver::get)
    }
}
