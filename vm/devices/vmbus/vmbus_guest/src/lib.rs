// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest-side root manager for the Hyper-V Virtual Machine Bus (VmBus).
//!
//! The manager owns the hypercall gateway, the per-processor synthetic
//! interrupt controller state, the request/response transaction engine, the
//! channel lifecycle, and the shared-memory (GPADL) allocator. Device
//! drivers sit above it and consume five operations: open, close,
//! allocate-gpadl, free-gpadl, and signal.
//!
//! The embedding kernel provides memory, MSR access, and device-node
//! registration through [`pal::Platform`], wires the bus interrupt to
//! [`Vmbus::handle_interrupt`], and then calls [`Vmbus::start`] to
//! negotiate a protocol version and request the channel offers.

mod channels;
mod connect;
mod gpadl;
pub mod hypercall;
mod interrupt;
pub mod pal;
mod synic;
#[cfg(test)]
mod testing;
mod transact;

pub use channels::ChannelCallback;
pub use vmbus_core::protocol::GpadlId;
pub use vmbus_core::protocol::Version;

use channels::ChannelQueues;
use channels::ChannelTable;
use hypercall::HypercallInterface;
use hypercall::HypercallPage;
use interrupt::DpcShared;
use interrupt::EventDispatch;
use pal::DmaBuffer;
use pal::Platform;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use synic::SynicState;
use thiserror::Error;
use transact::TransactionPool;
use vmbus_core::OutgoingMessage;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::MessageType;

/// Status codes surfaced to device drivers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum BusError {
    /// A caller argument was out of range or misaligned.
    #[error("argument out of range or misaligned")]
    BadValue,
    /// The channel id is not occupied, or the gpadl id is not in the
    /// channel's list.
    #[error("no such channel or gpadl")]
    NotFound,
    /// The channel is already open, or the bus is already connected.
    #[error("resource is busy")]
    Busy,
    /// An allocation failed, or the hypervisor kept reporting exhausted
    /// buffers.
    #[error("out of memory")]
    NoMemory,
    /// A non-retryable hypercall status or a failure result in a host
    /// response.
    #[error("host i/o failure")]
    Io,
    /// The host accepted none of the offered protocol versions.
    #[error("no protocol version supported by the host")]
    NotSupported,
    /// A response wait was aborted.
    #[error("wait interrupted")]
    Interrupted,
}

#[derive(Default)]
struct ConnectState {
    version: Option<Version>,
    connection_id: u32,
}

/// Shared state behind the [`Vmbus`] facade; the interrupt path, the DPC
/// worker, the registration worker, and driver threads all land here.
pub struct VmbusCore {
    platform: Arc<dyn Platform>,
    gateway: Arc<dyn HypercallInterface>,
    synic: SynicState,
    transactions: TransactionPool,
    channels: ChannelTable,
    queues: Arc<ChannelQueues>,
    dpc: Arc<DpcShared>,
    event_flags_page: DmaBuffer,
    monitor_page1: DmaBuffer,
    monitor_page2: DmaBuffer,
    event_dispatch: AtomicU8,
    gpadl_counter: AtomicU32,
    state: RwLock<ConnectState>,
}

/// The VmBus root manager.
pub struct Vmbus {
    core: Arc<VmbusCore>,
    dpc_thread: Option<JoinHandle<()>>,
    worker_thread: Option<JoinHandle<()>>,
}

impl Vmbus {
    /// Creates the bus using the real hypercall page gateway.
    pub fn new(platform: Arc<dyn Platform>) -> Result<Self, BusError> {
        let gateway = Arc::new(HypercallPage::new(&platform)?);
        Self::with_gateway(platform, gateway)
    }

    /// Creates the bus with a caller-provided hypercall gateway. Allocates
    /// the shared pages, starts the worker threads, and programs the SynIC
    /// on every processor; does not yet contact the host.
    pub fn with_gateway(
        platform: Arc<dyn Platform>,
        gateway: Arc<dyn HypercallInterface>,
    ) -> Result<Self, BusError> {
        let event_flags_page = DmaBuffer::alloc(&platform, hvdef::HV_PAGE_SIZE_USIZE)?;
        let monitor_page1 = DmaBuffer::alloc(&platform, hvdef::HV_PAGE_SIZE_USIZE)?;
        let monitor_page2 = DmaBuffer::alloc(&platform, hvdef::HV_PAGE_SIZE_USIZE)?;
        let synic = SynicState::new(platform.clone())?;
        let transactions = TransactionPool::new(platform.clone(), gateway.clone());

        let core = Arc::new(VmbusCore {
            platform,
            gateway,
            synic,
            transactions,
            channels: ChannelTable::new(),
            queues: ChannelQueues::new(),
            dpc: DpcShared::new(),
            event_flags_page,
            monitor_page1,
            monitor_page2,
            event_dispatch: AtomicU8::new(EventDispatch::Null as u8),
            gpadl_counter: AtomicU32::new(1),
            state: RwLock::new(ConnectState::default()),
        });

        let dpc_thread = interrupt::start_dpc_thread(core.dpc.clone(), Arc::downgrade(&core));
        let worker_thread =
            channels::start_registration_thread(core.queues.clone(), Arc::downgrade(&core));
        core.synic.enable();

        Ok(Self {
            core,
            dpc_thread: Some(dpc_thread),
            worker_thread: Some(worker_thread),
        })
    }

    /// Connects to the host, negotiating the protocol version and
    /// requesting the channel offers. The bus interrupt must already be
    /// wired to [`Self::handle_interrupt`].
    pub fn start(&self) -> Result<(), BusError> {
        self.core.connect()
    }

    /// The bus interrupt service routine.
    pub fn handle_interrupt(&self) {
        self.core.handle_interrupt();
    }

    /// The negotiated protocol version, if connected.
    pub fn version(&self) -> Option<Version> {
        self.core.version()
    }

    /// Opens a channel: registers the event callback and asks the host to
    /// map the previously created ring-buffer GPADL. `rx_offset` is the
    /// byte offset of the receive ring within the GPADL.
    pub fn open_channel(
        &self,
        channel_id: u32,
        ring_gpadl_id: GpadlId,
        rx_offset: u64,
        callback: ChannelCallback,
    ) -> Result<(), BusError> {
        self.core
            .open_channel(channel_id, ring_gpadl_id, rx_offset, callback)
    }

    /// Closes a channel, best effort; the host sends no response.
    pub fn close_channel(&self, channel_id: u32) -> Result<(), BusError> {
        self.core.close_channel(channel_id)
    }

    /// Allocates a contiguous `len`-byte buffer and negotiates a GPADL
    /// covering it. `len` must be a nonzero multiple of the page size.
    pub fn allocate_gpadl(
        &self,
        channel_id: u32,
        len: usize,
    ) -> Result<(Arc<DmaBuffer>, GpadlId), BusError> {
        self.core.allocate_gpadl(channel_id, len)
    }

    /// Releases a GPADL created by [`Self::allocate_gpadl`].
    pub fn free_gpadl(&self, channel_id: u32, gpadl_id: GpadlId) -> Result<(), BusError> {
        self.core.free_gpadl(channel_id, gpadl_id)
    }

    /// Rings the host doorbell for a channel.
    pub fn signal_channel(&self, channel_id: u32) -> Result<(), BusError> {
        self.core.signal_channel(channel_id)
    }
}

impl Drop for Vmbus {
    fn drop(&mut self) {
        self.core.disconnect();
        self.core.transactions.interrupt_all();
        self.core.dpc.shutdown();
        self.core.queues.shutdown();
        if let Some(thread) = self.dpc_thread.take() {
            thread.join().ok();
        }
        if let Some(thread) = self.worker_thread.take() {
            thread.join().ok();
        }
        self.core.synic.disable();
    }
}

impl VmbusCore {
    fn open_channel(
        &self,
        channel_id: u32,
        ring_gpadl_id: GpadlId,
        rx_offset: u64,
        callback: ChannelCallback,
    ) -> Result<(), BusError> {
        let channel = self.channels.get(channel_id)?;
        let _body = channel.body.lock();

        {
            let mut slot = channel.callback.lock();
            if slot.is_some() {
                return Err(BusError::Busy);
            }
            *slot = Some(callback);
        }

        tracing::debug!(channel_id, gpadl_id = ring_gpadl_id.0, "opening channel");
        let msg = OutgoingMessage::new(&protocol::OpenChannel {
            channel_id: ChannelId(channel_id),
            open_id: channel_id,
            ring_gpadl_id,
            target_cpu: 0,
            rx_page_offset: (rx_offset >> hvdef::HV_PAGE_SHIFT) as u32,
            user_data: Default::default(),
        });

        let result = (|| {
            let tx = self.transactions.get()?;
            self.transactions
                .link(&tx, MessageType::OPEN_CHANNEL_RESPONSE, channel_id);
            let result = self
                .transactions
                .send(&tx, &msg)
                .and_then(|()| self.transactions.wait(&tx));
            let response = match result {
                Ok(response) => response,
                Err(error) => {
                    self.transactions.release(tx);
                    return Err(error);
                }
            };
            self.transactions.release(tx);

            let reply: protocol::OpenChannelResponse = response.body()?;
            if reply.result != 0 || reply.open_id != channel_id {
                tracing::warn!(channel_id, result = reply.result, "open channel failed");
                return Err(BusError::Io);
            }
            tracing::debug!(channel_id, "channel opened");
            Ok(())
        })();

        if result.is_err() {
            *channel.callback.lock() = None;
        }
        result
    }

    fn close_channel(&self, channel_id: u32) -> Result<(), BusError> {
        let channel = self.channels.get(channel_id)?;
        let _body = channel.body.lock();

        *channel.callback.lock() = None;

        tracing::debug!(channel_id, "closing channel");
        self.transactions
            .send_oneshot(&OutgoingMessage::new(&protocol::CloseChannel {
                channel_id: ChannelId(channel_id),
            }))
    }

    fn signal_channel(&self, channel_id: u32) -> Result<(), BusError> {
        let channel = self.channels.get(channel_id)?;

        // Shared-interrupt channels mark which channel has data in the
        // transmit bitmap before ringing the shared doorbell.
        if !channel.dedicated_interrupt {
            self.event_flags_page
                .atomic_u32(interrupt::tx_flag_word(channel_id))
                .fetch_or(1 << (channel_id % 32), Ordering::SeqCst);
        }

        let status = self.gateway.signal_event(channel.connection_id);
        if status.is_err() {
            tracing::warn!(channel_id, status = ?status, "signal event failed");
            return Err(BusError::Io);
        }
        Ok(())
    }
}
