//! The communication pipe: one shared link, many logical conversations.
//!
//! A [`CommPipe`] owns both halves of a [`LinkHandle`] plus a dispatch task
//! that decodes inbound frames and fans each envelope out to every matching
//! subscription and observer, exactly once, in arrival order.
//!
//! Correlation is by sequence id: [`CommPipe::write_and_wait`] stamps the
//! request with a fresh `seq_id` and subscribes to the echo *before* the
//! request leaves, so a response can never race past an unregistered waiter.
//! Multiple exchanges may be in flight at once; each waits only on its own
//! subscription, never on a global request slot.
//!
//! Subscriptions and observers release their slot on drop. That makes the
//! release happen on every exit path, including timeout and panic, so a
//! leaked observer slot is not a failure mode callers can reach.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use crate::link::LinkHandle;
use crate::wire::{Envelope, MsgKind};

type ObserverFn = Box<dyn Fn(&Envelope) + Send>;

/// What an inbound envelope must look like to reach a subscription.
pub enum SubFilter {
    /// Match on payload kind, e.g. every heartbeat.
    Kind(MsgKind),
    /// Match on an echoed sequence id (request/response correlation).
    Seq(u16),
    /// Arbitrary one-shot condition, e.g. "heartbeat from node X with a
    /// higher boot count".
    Predicate(Box<dyn Fn(&Envelope) -> bool + Send>),
}

impl SubFilter {
    fn matches(&self, env: &Envelope) -> bool {
        match self {
            SubFilter::Kind(kind) => env.kind() == *kind,
            SubFilter::Seq(seq) => env.header.seq_id == *seq,
            SubFilter::Predicate(pred) => pred(env),
        }
    }
}

struct SubSlot {
    token: u32,
    filter: SubFilter,
    /// Deliveries left before the slot retires. `usize::MAX` means unbounded.
    remaining: usize,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct PipeShared {
    subs: Mutex<Vec<SubSlot>>,
    observers: Mutex<Vec<(u32, ObserverFn)>>,
    next_token: AtomicU32,
    next_seq: AtomicU16,
}

/// Multiplexes request/response exchanges and asynchronous arrivals over one
/// physical link.
pub struct CommPipe {
    shared: Arc<PipeShared>,
    frames_out: mpsc::Sender<Vec<u8>>,
    dispatch: JoinHandle<()>,
}

impl CommPipe {
    /// Takes ownership of an established link and starts dispatching inbound
    /// traffic.
    pub fn new(link: LinkHandle) -> Self {
        let shared = Arc::new(PipeShared::default());
        let dispatch = tokio::spawn(dispatch_task(link.rx, shared.clone()));
        CommPipe {
            shared,
            frames_out: link.tx,
            dispatch,
        }
    }

    fn next_seq(&self) -> u16 {
        // seq 0 is reserved for "unstamped"
        loop {
            let seq = self.shared.next_seq.fetch_add(1, Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }

    async fn send_env(&self, env: Envelope) -> bool {
        if self.frames_out.send(env.encode()).await.is_err() {
            warn!("link closed, dropping outbound {:?}", env.kind());
            return false;
        }
        true
    }

    /// Sends one envelope without waiting for anything back. A zero `seq_id`
    /// is replaced with a live one.
    pub async fn write(&self, mut env: Envelope) -> bool {
        if env.header.seq_id == 0 {
            env.header.seq_id = self.next_seq();
        }
        self.send_env(env).await
    }

    /// Sends a request and collects its correlated responses.
    ///
    /// Waits until `expected` responses have arrived or `timeout` elapses;
    /// `expected == 0` means "as many as arrive within the timeout" (used by
    /// broadcasts). Fewer responses than expected is not an error; the caller
    /// gets whatever showed up.
    pub async fn write_and_wait(
        &self,
        mut env: Envelope,
        timeout: Duration,
        expected: usize,
    ) -> Vec<Envelope> {
        env.header.seq_id = self.next_seq();
        let qty = if expected == 0 { usize::MAX } else { expected };
        let sub = self.subscribe(SubFilter::Seq(env.header.seq_id), qty);
        if !self.send_env(env).await {
            return Vec::new();
        }
        sub.collect(timeout).await
    }

    /// Registers a bounded subscription. Delivery starts with the next
    /// envelope the dispatch task sees.
    pub fn subscribe(&self, filter: SubFilter, qty: usize) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.shared.next_token.fetch_add(1, Relaxed);
        self.shared.subs.lock().unwrap().push(SubSlot {
            token,
            filter,
            remaining: qty.max(1),
            tx,
        });
        Subscription {
            token,
            qty: qty.max(1),
            rx,
            shared: self.shared.clone(),
        }
    }

    /// Registers a persistent callback run against every inbound envelope.
    /// The callback runs on the dispatch task and must not block.
    pub fn subscribe_observer<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&Envelope) + Send + 'static,
    {
        let token = self.shared.next_token.fetch_add(1, Relaxed);
        self.shared
            .observers
            .lock()
            .unwrap()
            .push((token, Box::new(observer)));
        ObserverHandle {
            token,
            shared: self.shared.clone(),
        }
    }

    #[cfg(test)]
    fn live_subscriptions(&self) -> usize {
        self.shared.subs.lock().unwrap().len()
    }
}

impl Drop for CommPipe {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

async fn dispatch_task(mut frames: mpsc::Receiver<Vec<u8>>, shared: Arc<PipeShared>) {
    while let Some(frame) = frames.recv().await {
        let env = match Envelope::decode(&frame) {
            Ok(env) => env,
            Err(e) => {
                // An unmapped or corrupt message is simply absent from every
                // subscription result; it never takes the pipe down.
                debug!("dropping undecodable envelope ({} bytes): {e}", frame.len());
                continue;
            }
        };
        trace!("rx {:?} seq={}", env.kind(), env.header.seq_id);

        {
            let observers = shared.observers.lock().unwrap();
            for (_, observer) in observers.iter() {
                observer(&env);
            }
        }

        let mut subs = shared.subs.lock().unwrap();
        subs.retain_mut(|slot| {
            if !slot.filter.matches(&env) {
                return true;
            }
            if slot.tx.send(env.clone()).is_err() {
                // Receiver dropped; retire the slot.
                return false;
            }
            if slot.remaining != usize::MAX {
                slot.remaining -= 1;
            }
            slot.remaining > 0
        });
    }
}

/// A live bounded subscription. Dropping it releases the slot.
pub struct Subscription {
    token: u32,
    qty: usize,
    rx: mpsc::UnboundedReceiver<Envelope>,
    shared: Arc<PipeShared>,
}

impl Subscription {
    /// Waits up to `timeout` for the next matching envelope.
    pub async fn recv(&mut self, timeout: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + timeout;
        match timeout_at(deadline, self.rx.recv()).await {
            Ok(Some(env)) => Some(env),
            Ok(None) | Err(_) => None,
        }
    }

    /// Drains the subscription: collects until the subscribed quantity has
    /// arrived or `timeout` elapses, whichever is first.
    pub async fn collect(mut self, timeout: Duration) -> Vec<Envelope> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        while out.len() < self.qty {
            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(env)) => out.push(env),
                Ok(None) | Err(_) => break,
            }
        }
        out
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared
            .subs
            .lock()
            .unwrap()
            .retain(|slot| slot.token != self.token);
    }
}

/// A registered observer. Dropping it releases the slot.
pub struct ObserverHandle {
    token: u32,
    shared: Arc<PipeShared>,
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.shared
            .observers
            .lock()
            .unwrap()
            .retain(|(token, _)| *token != self.token);
    }
}
