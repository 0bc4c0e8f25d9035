// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The message transaction engine.
//!
//! Requests that expect a response are carried by reusable records, each
//! holding a pinned post-message hypercall input and a wait primitive. A
//! record lives on exactly one of two lists: the free pool, or the active
//! list where the deferred-procedure path matches responses against
//! `(response type, correlation key)` pairs.

use crate::BusError;
use crate::hypercall::HypercallInterface;
use crate::pal::DmaBuffer;
use crate::pal::Platform;
use hvdef::HvStatus;
use hvdef::PostMessageInput;
use hvdef::SynicMessageType;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use vmbus_core::OutgoingMessage;
use vmbus_core::protocol;
use vmbus_core::protocol::MessageType;
use zerocopy::FromBytes;

/// Transient hypercall failures are retried this many times before the
/// request fails with a memory error.
const MAX_SEND_ATTEMPTS: u32 = 20;
const SEND_RETRY_DELAY: Duration = Duration::from_micros(20);

/// A response payload copied out of the synic message slot, starting with
/// the vmbus message header.
pub(crate) struct Response {
    data: [u8; protocol::MAX_MESSAGE_SIZE],
    len: u8,
}

impl Response {
    fn new(message: &[u8]) -> Self {
        let mut data = [0; protocol::MAX_MESSAGE_SIZE];
        data[..message.len()].copy_from_slice(message);
        Self {
            data,
            len: message.len() as u8,
        }
    }

    /// Reads the fixed-size body following the message header.
    pub fn body<T: FromBytes>(&self) -> Result<T, BusError> {
        let data = &self.data[..self.len as usize];
        let body = data.get(protocol::HEADER_SIZE..).ok_or(BusError::Io)?;
        T::read_from_prefix(body)
            .map(|(value, _)| value)
            .map_err(|_| BusError::Io)
    }
}

enum TxOutcome {
    Response(Response),
    Interrupted,
    Aborted,
}

struct TxState {
    resp_type: MessageType,
    key: u32,
    outcome: Option<TxOutcome>,
}

impl Default for TxState {
    fn default() -> Self {
        Self {
            resp_type: MessageType::INVALID,
            key: 0,
            outcome: None,
        }
    }
}

/// A reusable transaction record.
pub(crate) struct Transaction {
    /// Pinned hypercall input; its physical address is computed once at
    /// allocation and reused across sends.
    input: DmaBuffer,
    state: Mutex<TxState>,
    cond: Condvar,
}

pub(crate) struct TransactionPool {
    platform: Arc<dyn Platform>,
    gateway: Arc<dyn HypercallInterface>,
    free: Mutex<Vec<Arc<Transaction>>>,
    active: Mutex<Vec<Arc<Transaction>>>,
}

impl TransactionPool {
    pub fn new(platform: Arc<dyn Platform>, gateway: Arc<dyn HypercallInterface>) -> Self {
        Self {
            platform,
            gateway,
            free: Mutex::new(Vec::new()),
            active: Mutex::new(Vec::new()),
        }
    }

    /// Takes a record from the free pool, allocating and pinning a new one
    /// if the pool is empty.
    pub fn get(&self) -> Result<Arc<Transaction>, BusError> {
        if let Some(tx) = self.free.lock().pop() {
            return Ok(tx);
        }
        let input = DmaBuffer::alloc(&self.platform, hvdef::POST_MESSAGE_INPUT_SIZE)?;
        Ok(Arc::new(Transaction {
            input,
            state: Mutex::new(TxState::default()),
            cond: Condvar::new(),
        }))
    }

    /// Links the record into the active list so an arriving response can be
    /// matched against it. Must happen before the send.
    pub fn link(&self, tx: &Arc<Transaction>, resp_type: MessageType, key: u32) {
        {
            let mut state = tx.state.lock();
            state.resp_type = resp_type;
            state.key = key;
            state.outcome = None;
        }
        self.active.lock().push(tx.clone());
    }

    /// Returns a record to the free pool. Always unlinks from the active
    /// list first so the record can never be on both lists.
    pub fn release(&self, tx: Arc<Transaction>) {
        {
            let mut active = self.active.lock();
            if let Some(pos) = active.iter().position(|t| Arc::ptr_eq(t, &tx)) {
                active.swap_remove(pos);
            }
        }
        *tx.state.lock() = TxState::default();
        self.free.lock().push(tx);
    }

    /// Posts the message through the gateway, retrying briefly when the
    /// hypervisor is out of message buffers.
    pub fn send(&self, tx: &Transaction, msg: &OutgoingMessage) -> Result<(), BusError> {
        let data = msg.data();
        let mut input = PostMessageInput::default();
        input.connection_id = protocol::MESSAGE_CONNECTION_ID;
        input.message_type = SynicMessageType::CHANNEL.0;
        input.payload_size = data.len() as u32;
        input.payload[..data.len()].copy_from_slice(data);
        tx.input.write_obj(0, &input);

        let mut status = HvStatus::SUCCESS;
        for _ in 0..MAX_SEND_ATTEMPTS {
            status = self.gateway.post_message(tx.input.gpa(), &input);
            if status.is_ok() {
                return Ok(());
            }
            if !status.is_retryable() {
                tracing::warn!(status = ?status, "post message hypercall failed");
                return Err(BusError::Io);
            }
            std::thread::sleep(SEND_RETRY_DELAY);
        }
        tracing::warn!(status = ?status, "post message retries exhausted");
        Err(BusError::NoMemory)
    }

    /// Sends a message that expects no response, using a pooled record for
    /// the pinned input buffer.
    pub fn send_oneshot(&self, msg: &OutgoingMessage) -> Result<(), BusError> {
        let tx = self.get()?;
        let r = self.send(&tx, msg);
        self.release(tx);
        r
    }

    /// Blocks until a response, interruption, or abort. The caller owns the
    /// record while waiting and must release it afterwards regardless of
    /// the outcome.
    pub fn wait(&self, tx: &Transaction) -> Result<Response, BusError> {
        let mut state = tx.state.lock();
        while state.outcome.is_none() {
            tx.cond.wait(&mut state);
        }
        match state.outcome.take() {
            Some(TxOutcome::Response(response)) => Ok(response),
            Some(TxOutcome::Interrupted) => Err(BusError::Interrupted),
            Some(TxOutcome::Aborted) => Err(BusError::Io),
            None => unreachable!(),
        }
    }

    /// Matches a response against the active list, copying the payload into
    /// the record and waking its waiter. Returns false if nothing matched.
    pub fn notify(&self, resp_type: MessageType, key: u32, message: &[u8]) -> bool {
        let mut active = self.active.lock();
        let pos = active.iter().position(|tx| {
            let state = tx.state.lock();
            state.resp_type == resp_type && state.key == key
        });
        let Some(pos) = pos else {
            return false;
        };
        let tx = active.swap_remove(pos);
        drop(active);

        let mut state = tx.state.lock();
        state.outcome = Some(TxOutcome::Response(Response::new(message)));
        tx.cond.notify_all();
        true
    }

    /// Fails any waiter matching `(resp_type, key)` with an I/O error. The
    /// records stay linked; the waiters unlink them on their error paths.
    pub fn abort_matching(&self, resp_type: MessageType, key: u32) {
        let active = self.active.lock();
        for tx in active.iter() {
            let mut state = tx.state.lock();
            if state.resp_type == resp_type && state.key == key && state.outcome.is_none() {
                state.outcome = Some(TxOutcome::Aborted);
                tx.cond.notify_all();
            }
        }
    }

    /// Interrupts every pending wait, e.g. at bus teardown.
    pub fn interrupt_all(&self) {
        let active = self.active.lock();
        for tx in active.iter() {
            let mut state = tx.state.lock();
            if state.outcome.is_none() {
                state.outcome = Some(TxOutcome::Interrupted);
                tx.cond.notify_all();
            }
        }
    }

    /// Interrupts the waiter matching `(resp_type, key)`, as a signal
    /// aborting the caller's wait would.
    #[cfg(test)]
    pub fn interrupt_matching(&self, resp_type: MessageType, key: u32) -> bool {
        let active = self.active.lock();
        for tx in active.iter() {
            let mut state = tx.state.lock();
            if state.resp_type == resp_type && state.key == key && state.outcome.is_none() {
                state.outcome = Some(TxOutcome::Interrupted);
                tx.cond.notify_all();
                return true;
            }
        }
        false
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}
