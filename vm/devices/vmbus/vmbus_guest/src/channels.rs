// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The channel table and the registration worker.
//!
//! Channels are owned by a dense table indexed by channel id; drivers refer
//! to them only by id. The DPC publishes offered channels into the table and
//! queues them for a dedicated worker thread, which publishes child device
//! nodes and tears down rescinded channels.

use crate::BusError;
use crate::VmbusCore;
use crate::gpadl::GpadlRecord;
use crate::pal::NodeAttributes;
use crate::pal::NodeHandle;
use crate::pal::Semaphore;
use guid::Guid;
use parking_lot::Mutex;
use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use vmbus_core::OutgoingMessage;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::MessageType;
use vmbus_core::protocol::Version;

/// Event callback registered by a device driver when opening a channel.
/// Invoked from the interrupt path; implementations must be short and
/// nonblocking.
pub type ChannelCallback = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct Channel {
    pub channel_id: ChannelId,
    pub type_id: Guid,
    pub instance_id: Guid,
    /// The host granted a distinct connection id for signalling.
    pub dedicated_interrupt: bool,
    pub connection_id: u32,
    pub callback: Mutex<Option<ChannelCallback>>,
    /// The per-channel lock; serializes open, close, and GPADL operations.
    pub body: Mutex<ChannelBody>,
}

#[derive(Default)]
pub(crate) struct ChannelBody {
    pub gpadls: Vec<GpadlRecord>,
    pub node: Option<NodeHandle>,
}

/// The dense channel table. Slot loads and stores take the table lock; the
/// object bodies have their own per-channel locks.
pub(crate) struct ChannelTable {
    table: RwLock<Vec<Option<Arc<Channel>>>>,
    highest: AtomicU32,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Vec::new()),
            highest: AtomicU32::new(0),
        }
    }

    /// Sizes the table; done once at connect before any offer can arrive.
    pub fn set_capacity(&self, capacity: usize) {
        let mut table = self.table.write();
        table.clear();
        table.resize_with(capacity, || None);
    }

    pub fn capacity(&self) -> usize {
        self.table.read_recursive().len()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<Option<Arc<Channel>>>> {
        self.table.read()
    }

    /// Indexed load. Out-of-range ids are a caller error; an empty slot
    /// means the host never offered (or has rescinded) the channel.
    pub fn get(&self, channel_id: u32) -> Result<Arc<Channel>, BusError> {
        let table = self.table.read_recursive();
        let slot = table.get(channel_id as usize).ok_or(BusError::BadValue)?;
        slot.clone().ok_or(BusError::NotFound)
    }

    /// Publishes a channel into its slot. Fails if the slot is occupied.
    pub fn publish(&self, channel: Arc<Channel>) -> bool {
        let id = channel.channel_id.0;
        let mut table = self.table.write();
        let Some(slot) = table.get_mut(id as usize) else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(channel);
        self.highest.fetch_max(id, Ordering::SeqCst);
        true
    }

    /// Atomically clears a slot, returning the channel that occupied it.
    pub fn clear(&self, channel_id: u32) -> Option<Arc<Channel>> {
        let mut table = self.table.write();
        table.get_mut(channel_id as usize)?.take()
    }

    pub fn highest_channel_id(&self) -> u32 {
        self.highest.load(Ordering::SeqCst)
    }
}

/// Offer and rescind queues drained by the registration worker.
pub(crate) struct ChannelQueues {
    offers: Mutex<VecDeque<Arc<Channel>>>,
    rescinds: Mutex<VecDeque<Arc<Channel>>>,
    pub sem: Semaphore,
    shutdown: Mutex<bool>,
}

impl ChannelQueues {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            offers: Mutex::new(VecDeque::new()),
            rescinds: Mutex::new(VecDeque::new()),
            sem: Semaphore::new(),
            shutdown: Mutex::new(false),
        })
    }

    pub fn shutdown(&self) {
        *self.shutdown.lock() = true;
        self.sem.release();
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.lock()
    }
}

/// Starts the registration worker thread.
pub(crate) fn start_registration_thread(
    queues: Arc<ChannelQueues>,
    bus: Weak<VmbusCore>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("vmbus channelqueue".into())
        .spawn(move || {
            loop {
                queues.sem.acquire();
                if queues.is_shut_down() {
                    break;
                }
                let Some(bus) = bus.upgrade() else { break };
                bus.registration_pass();
            }
        })
        .expect("thread creation cannot fail at init")
}

impl VmbusCore {
    /// DPC handling for a channel offer: allocate and fill the object,
    /// publish it through the table, and hand it to the worker.
    pub(crate) fn handle_offer(&self, offer: protocol::ChannelOffer) {
        let id = offer.channel_id.0;
        if id == 0 || id as usize >= self.channels.capacity() {
            tracing::warn!(channel_id = id, "offer with out-of-range channel id");
            return;
        }

        // The interrupt-policy fields only exist from WS2008R2 on.
        let version = self.version();
        let r2_fields = version.is_some_and(|v| v >= Version::Ws2008R2);
        let (dedicated_interrupt, connection_id) = if r2_fields {
            (offer.interrupt_flags.dedicated(), offer.connection_id)
        } else {
            (false, protocol::EVENT_CONNECTION_ID)
        };

        let channel = Arc::new(Channel {
            channel_id: offer.channel_id,
            type_id: offer.type_id,
            instance_id: offer.instance_id,
            dedicated_interrupt,
            connection_id,
            callback: Mutex::new(None),
            body: Mutex::new(ChannelBody::default()),
        });

        if !self.channels.publish(channel.clone()) {
            tracing::warn!(channel_id = id, "duplicate channel offer");
            return;
        }

        tracing::info!(
            channel_id = id,
            type_id = %channel.type_id,
            instance_id = %channel.instance_id,
            "received offer"
        );

        self.queues.offers.lock().push_back(channel);
        self.queues.sem.release();
    }

    /// DPC handling for a rescind: clear the table slot so no new work can
    /// reach the channel, fail any caller mid-open, and queue the teardown.
    pub(crate) fn handle_rescind(&self, rescind: protocol::RescindChannelOffer) {
        let id = rescind.channel_id.0;
        let Some(channel) = self.channels.clear(id) else {
            tracing::warn!(channel_id = id, "rescind for unknown channel");
            return;
        };

        tracing::info!(channel_id = id, "received rescind");

        // A caller blocked in open_channel would otherwise wait for a
        // response that can never arrive.
        self.transactions
            .abort_matching(MessageType::OPEN_CHANNEL_RESPONSE, id);

        self.queues.rescinds.lock().push_back(channel);
        self.queues.sem.release();
    }

    /// One wake of the registration worker: at most one offer and one
    /// rescind are processed.
    pub(crate) fn registration_pass(&self) {
        let offered = self.queues.offers.lock().pop_front();
        let rescinded = self.queues.rescinds.lock().pop_front();

        if let Some(channel) = offered {
            self.register_channel_node(&channel);
        }
        if let Some(channel) = rescinded {
            self.teardown_channel(&channel);
        }
    }

    fn register_channel_node(&self, channel: &Channel) {
        let attributes = NodeAttributes {
            bus: "hyperv",
            pretty_name: pretty_name(&channel.type_id, channel.channel_id),
            channel_id: channel.channel_id.0,
            type_id: channel.type_id.to_string(),
            instance_id: channel.instance_id.to_string(),
        };

        tracing::info!(
            channel_id = channel.channel_id.0,
            name = %attributes.pretty_name,
            "registering channel device node"
        );

        match self.platform.publish_node(attributes) {
            Ok(node) => channel.body.lock().node = Some(node),
            Err(error) => {
                tracing::warn!(
                    channel_id = channel.channel_id.0,
                    error = &error as &dyn std::error::Error,
                    "failed to publish channel device node"
                );
            }
        }
    }

    /// Withdraws the child node, releases the channel's GPADL buffers, and
    /// tells the host the channel id is free again.
    fn teardown_channel(&self, channel: &Channel) {
        let (node, gpadls) = {
            let mut body = channel.body.lock();
            (body.node.take(), std::mem::take(&mut body.gpadls))
        };

        if let Some(node) = node {
            self.platform.withdraw_node(node);
        }

        for gpadl in gpadls {
            tracing::debug!(
                channel_id = channel.channel_id.0,
                gpadl_id = gpadl.gpadl_id.0,
                "releasing gpadl of rescinded channel"
            );
            drop(gpadl);
        }

        // Fire and forget; the host does not acknowledge this.
        let msg = OutgoingMessage::new(&protocol::FreeChannel {
            channel_id: channel.channel_id,
        });
        if let Err(error) = self.transactions.send_oneshot(&msg) {
            tracing::warn!(
                channel_id = channel.channel_id.0,
                error = &error as &dyn std::error::Error,
                "failed to send channel release"
            );
        }

        tracing::info!(channel_id = channel.channel_id.0, "channel torn down");
    }
}

/// Well-known device type UUIDs, used to give child nodes a readable name.
const WELL_KNOWN_TYPES: &[(Guid, &str)] = &[
    (
        Guid::from_static_str("f8615163-df3e-46c5-913f-f2d2f965ed0e"),
        "Hyper-V network adapter",
    ),
    (
        Guid::from_static_str("ba6163d9-04a1-4d29-b605-72e2ffb1dc7f"),
        "Hyper-V SCSI controller",
    ),
    (
        Guid::from_static_str("32412632-86cb-44a2-9b5c-50d1417354f5"),
        "Hyper-V IDE controller",
    ),
    (
        Guid::from_static_str("0e0b6031-5213-4934-818b-38d90ced39db"),
        "Hyper-V shutdown",
    ),
    (
        Guid::from_static_str("9527e630-d0ae-497b-adce-e80ab0175caf"),
        "Hyper-V time synchronization",
    ),
    (
        Guid::from_static_str("57164f39-9115-4e78-ab55-382f3bd5422d"),
        "Hyper-V heartbeat",
    ),
    (
        Guid::from_static_str("a9a0f4e7-5a45-4d96-b827-8a841e8c03e6"),
        "Hyper-V data exchange",
    ),
    (
        Guid::from_static_str("35fa2e29-ea23-4236-96ae-3a6ebacba440"),
        "Hyper-V backup",
    ),
    (
        Guid::from_static_str("cfa8b69e-5b4a-4cc0-b98b-8ba1a1f3f95a"),
        "Hyper-V mouse",
    ),
    (
        Guid::from_static_str("f912ad6d-2b17-48ea-bd65-f927a61c7684"),
        "Hyper-V keyboard",
    ),
    (
        Guid::from_static_str("da0a7802-e377-4aac-8e77-0558eb1073f8"),
        "Hyper-V synthetic video",
    ),
];

fn pretty_name(type_id: &Guid, channel_id: ChannelId) -> String {
    for (guid, name) in WELL_KNOWN_TYPES {
        if guid == type_id {
            return (*name).to_string();
        }
    }
    format!("Hyper-V device (channel {})", channel_id.0)
}
