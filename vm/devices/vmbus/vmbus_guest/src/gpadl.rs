// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared-memory (GPADL) allocation.
//!
//! A GPADL names a list of guest physical pages backing a ring buffer. The
//! page list is sent as one CREATE message plus as many unacknowledged
//! continuation messages as the hypercall payload cap requires; only the
//! CREATE is acknowledged by the host.

use crate::BusError;
use crate::VmbusCore;
use crate::pal::DmaBuffer;
use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use vmbus_core::OutgoingMessage;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::GpadlRange;
use vmbus_core::protocol::MessageType;
use zerocopy::IntoBytes;

/// A GPADL owned by a channel: the handle and the contiguous buffer backing
/// it. Removed on FREE_GPADL or at channel teardown.
pub(crate) struct GpadlRecord {
    pub gpadl_id: GpadlId,
    pub buffer: Arc<DmaBuffer>,
}

impl VmbusCore {
    /// Draws a fresh nonzero GPADL handle from the bus-wide counter.
    pub(crate) fn next_gpadl_id(&self) -> GpadlId {
        loop {
            let id = self.gpadl_counter.fetch_add(1, Ordering::Relaxed);
            if id != GpadlId::NULL.0 {
                return GpadlId(id);
            }
        }
    }

    pub(crate) fn allocate_gpadl(
        &self,
        channel_id: u32,
        len: usize,
    ) -> Result<(Arc<DmaBuffer>, GpadlId), BusError> {
        if len == 0 || len % hvdef::HV_PAGE_SIZE_USIZE != 0 {
            return Err(BusError::BadValue);
        }
        let total_pages = len / hvdef::HV_PAGE_SIZE_USIZE;
        if total_pages + 1 > protocol::MAX_GPADL_PAGES {
            return Err(BusError::BadValue);
        }

        let channel = self.channels.get(channel_id)?;
        let mut body = channel.body.lock();

        let buffer = Arc::new(DmaBuffer::alloc(&self.platform, len)?);
        let gpadl_id = self.next_gpadl_id();

        tracing::debug!(
            channel_id,
            gpadl_id = gpadl_id.0,
            pages = total_pages,
            "creating gpadl"
        );

        // The first chunk of page numbers rides in the CREATE message after
        // the range descriptor.
        let create_pages = total_pages.min(protocol::MAX_PAGES_PER_CREATE);
        let range = GpadlRange {
            byte_count: len as u32,
            byte_offset: 0,
        };
        let mut pfn = buffer.base_pfn();
        let mut data = Vec::with_capacity(size_of::<GpadlRange>() + create_pages * 8);
        data.extend_from_slice(range.as_bytes());
        for _ in 0..create_pages {
            data.extend_from_slice(&pfn.to_le_bytes());
            pfn += 1;
        }
        let create = OutgoingMessage::with_data(
            &protocol::CreateGpadl {
                channel_id: ChannelId(channel_id),
                gpadl_id,
                range_buflen: (size_of::<GpadlRange>() + total_pages * 8) as u16,
                range_count: 1,
            },
            &data,
        );

        let tx = self.transactions.get()?;
        self.transactions
            .link(&tx, MessageType::CREATE_GPADL_RESPONSE, gpadl_id.0);
        if let Err(error) = self.transactions.send(&tx, &create) {
            self.transactions.release(tx);
            return Err(error);
        }

        // Remaining pages go out in continuation messages, reusing one
        // record for the pinned buffer. These carry no transaction; the
        // CREATE response acknowledges the whole list.
        let mut remaining = total_pages - create_pages;
        if remaining > 0 {
            let addt_tx = match self.transactions.get() {
                Ok(addt_tx) => addt_tx,
                Err(error) => {
                    self.transactions.release(tx);
                    return Err(error);
                }
            };
            let mut msg_number = 1;
            while remaining > 0 {
                let chunk = remaining.min(protocol::MAX_PAGES_PER_ADDT);
                let mut data = Vec::with_capacity(chunk * 8);
                for _ in 0..chunk {
                    data.extend_from_slice(&pfn.to_le_bytes());
                    pfn += 1;
                }
                let addt = OutgoingMessage::with_data(
                    &protocol::CreateGpadlAddt {
                        msg_number,
                        gpadl_id,
                    },
                    &data,
                );
                if let Err(error) = self.transactions.send(&addt_tx, &addt) {
                    self.transactions.release(addt_tx);
                    self.transactions.release(tx);
                    return Err(error);
                }
                msg_number += 1;
                remaining -= chunk;
            }
            self.transactions.release(addt_tx);
        }

        let response = match self.transactions.wait(&tx) {
            Ok(response) => response,
            Err(error) => {
                self.transactions.release(tx);
                return Err(error);
            }
        };
        self.transactions.release(tx);

        let reply: protocol::CreateGpadlResponse = response.body()?;
        if reply.result != 0 {
            tracing::warn!(
                channel_id,
                gpadl_id = gpadl_id.0,
                result = reply.result,
                "gpadl creation refused"
            );
            return Err(BusError::Io);
        }

        tracing::debug!(channel_id, gpadl_id = gpadl_id.0, "created gpadl");
        body.gpadls.push(GpadlRecord {
            gpadl_id,
            buffer: buffer.clone(),
        });
        Ok((buffer, gpadl_id))
    }

    pub(crate) fn free_gpadl(&self, channel_id: u32, gpadl_id: GpadlId) -> Result<(), BusError> {
        let channel = self.channels.get(channel_id)?;
        let mut body = channel.body.lock();
        let index = body
            .gpadls
            .iter()
            .position(|record| record.gpadl_id == gpadl_id)
            .ok_or(BusError::NotFound)?;

        let tx = self.transactions.get()?;
        self.transactions
            .link(&tx, MessageType::FREE_GPADL_RESPONSE, gpadl_id.0);
        let msg = OutgoingMessage::new(&protocol::FreeGpadl {
            channel_id: ChannelId(channel_id),
            gpadl_id,
        });
        let result = self
            .transactions
            .send(&tx, &msg)
            .and_then(|()| self.transactions.wait(&tx).map(|_| ()));
        self.transactions.release(tx);
        result?;

        // The response carries no status; its arrival is the acknowledgment.
        // Dropping the record releases the contiguous buffer.
        body.gpadls.swap_remove(index);
        tracing::debug!(channel_id, gpadl_id = gpadl_id.0, "freed gpadl");
        Ok(())
    }
}
