// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The interrupt and deferred-procedure path.
//!
//! The ISR runs the installed event-flags dispatcher inline and defers
//! channel-management message processing to the DPC worker. The DPC
//! validates the synic slot, dispatches offers and rescinds to the
//! registration queues, and completes pending transactions.

use crate::VmbusCore;
use hvdef::SynicMessageType;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use vmbus_core::protocol;
use vmbus_core::protocol::Message;
use vmbus_core::protocol::MessageType;
use vmbus_core::protocol::SINT_MESSAGE;

/// The event-flags dispatcher installed at connect time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum EventDispatch {
    /// Installed before connect; ignores events.
    Null = 0,
    /// WS2008/WS2008R2: drain the shared receive bitmap after the per-CPU
    /// synic flag fires.
    Legacy = 1,
    /// Modern hosts: each per-CPU synic event flag is a channel id.
    Modern = 2,
}

impl EventDispatch {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Legacy,
            2 => Self::Modern,
            _ => Self::Null,
        }
    }
}

/// The queue feeding the channel-management DPC worker thread.
pub(crate) struct DpcShared {
    queue: Mutex<VecDeque<u32>>,
    cond: Condvar,
    shutdown: Mutex<bool>,
}

impl DpcShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            shutdown: Mutex::new(false),
        })
    }

    /// Queues a DPC for the per-CPU state that observed a message.
    pub fn queue(&self, cpu: u32) {
        self.queue.lock().push_back(cpu);
        self.cond.notify_one();
    }

    pub fn shutdown(&self) {
        *self.shutdown.lock() = true;
        self.cond.notify_all();
    }

    fn next(&self) -> Option<u32> {
        let mut queue = self.queue.lock();
        loop {
            if *self.shutdown.lock() {
                return None;
            }
            if let Some(cpu) = queue.pop_front() {
                return Some(cpu);
            }
            self.cond.wait(&mut queue);
        }
    }
}

/// Starts the DPC worker draining the queue into [`VmbusCore::message_dpc`].
pub(crate) fn start_dpc_thread(shared: Arc<DpcShared>, bus: Weak<VmbusCore>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("vmbus mgmt msg".into())
        .spawn(move || {
            while let Some(cpu) = shared.next() {
                let Some(bus) = bus.upgrade() else { break };
                bus.message_dpc(cpu);
            }
        })
        .expect("thread creation cannot fail at init")
}

impl VmbusCore {
    /// The bus interrupt service routine. The embedder's interrupt glue
    /// calls this on the CPU that took the interrupt.
    pub fn handle_interrupt(&self) {
        let cpu = self.platform.current_cpu();

        match EventDispatch::from_u8(self.event_dispatch.load(Ordering::Acquire)) {
            EventDispatch::Null => {}
            EventDispatch::Legacy => self.dispatch_events_legacy(cpu),
            EventDispatch::Modern => self.dispatch_events_modern(cpu),
        }

        if self.synic.message_slot_type(cpu) != SynicMessageType::NONE {
            self.dpc.queue(cpu);
        }
    }

    pub(crate) fn set_event_dispatch(&self, dispatch: EventDispatch) {
        self.event_dispatch.store(dispatch as u8, Ordering::Release);
    }

    /// Modern dispatch: every set bit in the per-CPU synic event flags for
    /// the message SINT names a channel with new data.
    fn dispatch_events_modern(&self, cpu: u32) {
        let page = &self.synic.cpu(cpu).event_flags_page;
        let base = crate::synic::SynicCpu::event_flag_word_base(SINT_MESSAGE);

        let table = self.channels.read();
        for word_index in 0..hvdef::SYNIC_EVENT_FLAG_WORDS {
            let mut word = page.atomic_u32(base + word_index).swap(0, Ordering::SeqCst);
            if word == 0 {
                continue;
            }
            while word != 0 {
                let bit = word.trailing_zeros();
                word &= !(1 << bit);
                let channel_id = word_index as u32 * 32 + bit;
                // Channel id 0 is the bus itself.
                if channel_id == 0 {
                    continue;
                }
                Self::invoke_callback(&table, channel_id);
            }
        }
    }

    /// Legacy dispatch: a single per-CPU synic flag gates the shared receive
    /// bitmap, which carries one bit per channel id.
    fn dispatch_events_legacy(&self, cpu: u32) {
        let page = &self.synic.cpu(cpu).event_flags_page;
        let base = crate::synic::SynicCpu::event_flag_word_base(SINT_MESSAGE);
        if page.atomic_u32(base).swap(0, Ordering::SeqCst) == 0 {
            return;
        }

        let highest = self.channels.highest_channel_id();
        let table = self.channels.read();
        for word_index in 0..=(highest / 32) as usize {
            let mut word = self
                .event_flags_page
                .atomic_u32(rx_flag_word(word_index))
                .swap(0, Ordering::SeqCst);
            if word == 0 {
                continue;
            }
            while word != 0 {
                let bit = word.trailing_zeros();
                word &= !(1 << bit);
                let channel_id = word_index as u32 * 32 + bit;
                if channel_id == 0 || channel_id > highest {
                    continue;
                }
                Self::invoke_callback(&table, channel_id);
            }
        }
    }

    /// The channel-management DPC: validates the slot contents, dispatches
    /// the control message, and completes end-of-message handling.
    pub(crate) fn message_dpc(&self, cpu: u32) {
        let message = self.synic.read_message_slot(cpu);
        let len = message.header.len as usize;
        if message.header.typ != SynicMessageType::CHANNEL
            || len < protocol::HEADER_SIZE
            || len > hvdef::SYNIC_MESSAGE_PAYLOAD_SIZE
        {
            tracing::debug!(
                typ = message.header.typ.0,
                len = message.header.len,
                "ignoring non-channel synic message"
            );
            self.synic.end_of_message(cpu);
            return;
        }

        match Message::parse(message.payload()) {
            Ok(parsed) => self.handle_message(parsed, message.payload()),
            Err(error) => {
                // The host cannot be punished for a bad message; drop it and
                // complete the slot anyway.
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "dropping malformed vmbus message"
                );
            }
        }

        self.synic.end_of_message(cpu);
    }

    fn handle_message(&self, message: Message<'_>, raw: &[u8]) {
        match message {
            Message::ChannelOffer(offer, ..) => self.handle_offer(offer),
            Message::RescindChannelOffer(rescind, ..) => self.handle_rescind(rescind),
            Message::RequestChannelsDone(..) => {
                tracing::debug!("all channel offers delivered");
            }
            Message::OpenChannelResponse(response, ..) => {
                self.complete_transaction(
                    MessageType::OPEN_CHANNEL_RESPONSE,
                    response.channel_id.0,
                    raw,
                );
            }
            Message::CreateGpadlResponse(response, ..) => {
                self.complete_transaction(
                    MessageType::CREATE_GPADL_RESPONSE,
                    response.gpadl_id.0,
                    raw,
                );
            }
            Message::FreeGpadlResponse(response, ..) => {
                self.complete_transaction(MessageType::FREE_GPADL_RESPONSE, response.gpadl_id.0, raw);
            }
            Message::ConnectResponse(..) => {
                self.complete_transaction(MessageType::CONNECT_RESPONSE, 0, raw);
            }
            // Messages that only the host should receive.
            Message::RequestChannels(..)
            | Message::OpenChannel(..)
            | Message::CloseChannel(..)
            | Message::CreateGpadl(..)
            | Message::CreateGpadlAddt(..)
            | Message::FreeGpadl(..)
            | Message::FreeChannel(..)
            | Message::Connect(..)
            | Message::Disconnect(..) => {
                tracing::warn!(?message, "dropping host-bound message echoed to the guest");
            }
        }
    }

    fn complete_transaction(&self, resp_type: MessageType, key: u32, raw: &[u8]) {
        if !self.transactions.notify(resp_type, key, raw) {
            tracing::warn!(
                resp_type = resp_type.0,
                key,
                "response matched no pending transaction, dropping"
            );
        }
    }

    fn invoke_callback(
        table: &[Option<Arc<crate::channels::Channel>>],
        channel_id: u32,
    ) {
        let Some(channel) = table.get(channel_id as usize).and_then(|c| c.as_ref()) else {
            return;
        };
        let callback = channel.callback.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Word index of a channel's receive flag within the shared event-flags
/// page.
fn rx_flag_word(word_index: usize) -> usize {
    word_index
}

/// Word index of a channel's transmit flag within the shared event-flags
/// page. The transmit bitmap occupies the second half of the page.
pub(crate) fn tx_flag_word(channel_id: u32) -> usize {
    protocol::EVENT_FLAG_PAGE_BITS / 32 + channel_id as usize / 32
}
