//! Pre-allocated message pools.
//!
//! Each session owns two bounded pools: an inbound pool of parse views and
//! an outbound pool of send skeletons. Acquisition never allocates;
//! exhaustion is a backpressure signal, not an error. `acquire` waits and
//! is cancel-safe (dropping the future leaves the pool untouched).

use crate::fix::mem::IncomingMessage;
use std::sync::Mutex;
use tokio::sync::Notify;

struct Shared<T> {
    slots: Mutex<Vec<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> Shared<T> {
    fn new(slots: Vec<T>) -> Self {
        let capacity = slots.len();
        Shared {
            slots: Mutex::new(slots),
            notify: Notify::new(),
            capacity,
        }
    }

    fn try_take(&self) -> Option<T> {
        self.slots.lock().expect("pool lock").pop()
    }

    async fn take(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(v) = self.try_take() {
                return v;
            }
            notified.await;
        }
    }

    /// Returns a slot. A slot beyond capacity is dropped rather than
    /// inserted, so a stray double-return can never displace or corrupt a
    /// live claimant's slot.
    fn put(&self, v: T) {
        {
            let mut slots = self.slots.lock().expect("pool lock");
            if slots.len() >= self.capacity {
                return;
            }
            slots.push(v);
        }
        self.notify.notify_one();
    }

    fn available(&self) -> usize {
        self.slots.lock().expect("pool lock").len()
    }
}

/// Bounded pool of inbound parse views.
pub struct InboundPool {
    shared: Shared<IncomingMessage>,
}

impl InboundPool {
    pub fn new(capacity: usize, max_message_length: usize, max_tags: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| IncomingMessage::with_capacity(max_message_length, max_tags))
            .collect();
        InboundPool {
            shared: Shared::new(slots),
        }
    }

    pub fn try_acquire(&self) -> Option<IncomingMessage> {
        self.shared.try_take().map(|mut v| {
            v.pooled = false;
            v
        })
    }

    /// Waits for a view when the pool is empty. Cancellation-safe.
    pub async fn acquire(&self) -> IncomingMessage {
        let mut v = self.shared.take().await;
        v.pooled = false;
        v
    }

    pub fn release(&self, mut view: IncomingMessage) {
        if view.pooled {
            return;
        }
        view.pooled = true;
        view.reset();
        self.shared.put(view);
    }

    pub fn available(&self) -> usize {
        self.shared.available()
    }
}

/// A claimed outbound message skeleton.
///
/// The claim carries only the MsgType and a reusable body buffer; the
/// session stamps MsgSeqNum and SendingTime and renders the standard
/// header at commit time, so an aborted claim never consumes a sequence
/// number.
pub struct OutgoingMessage {
    msg_type: char,
    body: Vec<u8>,
    pub(crate) pooled: bool,
}

impl OutgoingMessage {
    fn with_capacity(capacity: usize) -> Self {
        OutgoingMessage {
            msg_type: '0',
            body: Vec::with_capacity(capacity),
            pooled: true,
        }
    }

    pub(crate) fn prepare(&mut self, msg_type: char) {
        self.msg_type = msg_type;
        self.body.clear();
    }

    pub fn msg_type(&self) -> char {
        self.msg_type
    }

    pub fn push(&mut self, tag: impl Into<u32>, value: &[u8]) -> &mut Self {
        self.body
            .extend_from_slice(crate::fix::encode::IntBytes::from(tag.into()).as_bytes());
        self.body.push(b'=');
        self.body.extend_from_slice(value);
        self.body.push(b'\x01');
        self
    }

    pub fn push_int(&mut self, tag: impl Into<u32>, value: u32) -> &mut Self {
        let v = crate::fix::encode::IntBytes::from(value);
        self.push(tag, v.as_bytes())
    }

    pub fn push_str(&mut self, tag: impl Into<u32>, value: &str) -> &mut Self {
        self.push(tag, value.as_bytes())
    }

    pub fn push_char(&mut self, tag: impl Into<u32>, value: char) -> &mut Self {
        let mut b = [0u8; 4];
        let s = value.encode_utf8(&mut b);
        self.push(tag, s.as_bytes())
    }

    pub(crate) fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Bounded pool of outbound send skeletons.
pub struct OutboundPool {
    shared: Shared<OutgoingMessage>,
}

impl OutboundPool {
    pub fn new(capacity: usize, body_capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| OutgoingMessage::with_capacity(body_capacity))
            .collect();
        OutboundPool {
            shared: Shared::new(slots),
        }
    }

    /// Claims a skeleton, or None when every slot is in flight.
    pub fn try_claim(&self, msg_type: char) -> Option<OutgoingMessage> {
        self.shared.try_take().map(|mut m| {
            m.pooled = false;
            m.prepare(msg_type);
            m
        })
    }

    pub fn release(&self, mut msg: OutgoingMessage) {
        if msg.pooled {
            return;
        }
        msg.pooled = true;
        msg.body.clear();
        self.shared.put(msg);
    }

    pub fn available(&self) -> usize {
        self.shared.available()
    }
}
