// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Connection establishment and version negotiation.

use crate::BusError;
use crate::VmbusCore;
use crate::interrupt::EventDispatch;
use vmbus_core::OutgoingMessage;
use vmbus_core::protocol;
use vmbus_core::protocol::MessageType;
use vmbus_core::protocol::Version;

impl VmbusCore {
    pub(crate) fn version(&self) -> Option<Version> {
        self.state.read().version
    }

    pub(crate) fn connection_id(&self) -> u32 {
        self.state.read().connection_id
    }

    /// Negotiates a protocol version with the host, walking the version
    /// list newest first, then requests the channel offers.
    pub(crate) fn connect(&self) -> Result<(), BusError> {
        if self.version().is_some() {
            return Err(BusError::Busy);
        }

        for &version in protocol::NEGOTIATE_ORDER {
            tracing::debug!(%version, "connecting to vmbus");
            let Some(connection_id) = self.connect_version(version)? else {
                tracing::debug!(%version, "vmbus version refused by host");
                continue;
            };

            tracing::info!(%version, connection_id, "connected to vmbus");
            {
                let mut state = self.state.write();
                state.version = Some(version);
                state.connection_id = connection_id;
            }

            // The negotiated version decides how events are dispatched and
            // how many channels the host may offer.
            let (dispatch, capacity) = if version.is_legacy() {
                (EventDispatch::Legacy, protocol::MAX_CHANNELS_LEGACY)
            } else {
                (EventDispatch::Modern, protocol::MAX_CHANNELS)
            };
            self.set_event_dispatch(dispatch);
            self.channels.set_capacity(capacity);

            return self.request_channels();
        }

        Err(BusError::NotSupported)
    }

    /// One CONNECT attempt. `Ok(None)` means the host refused the version.
    fn connect_version(&self, version: Version) -> Result<Option<u32>, BusError> {
        let msg = OutgoingMessage::new(&protocol::Connect {
            version: version as u32,
            target_cpu: 0,
            event_flags_gpa: self.event_flags_page.gpa(),
            monitor1_gpa: self.monitor_page1.gpa(),
            monitor2_gpa: self.monitor_page2.gpa(),
        });

        let tx = self.transactions.get()?;
        self.transactions.link(&tx, MessageType::CONNECT_RESPONSE, 0);
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

        let reply: protocol::ConnectResponse = response.body()?;
        Ok((reply.supported != 0).then_some(reply.connection_id))
    }

    /// Asks the host for the current channel list. The offers arrive
    /// asynchronously as CHANNEL_OFFER messages; no response is expected
    /// here.
    fn request_channels(&self) -> Result<(), BusError> {
        self.transactions
            .send_oneshot(&OutgoingMessage::new(&protocol::RequestChannels {}))
    }

    /// Best-effort teardown notification at shutdown.
    pub(crate) fn disconnect(&self) {
        if self.version().is_none() {
            return;
        }
        let msg = OutgoingMessage::new(&protocol::Disconnect {});
        if let Err(error) = self.transactions.send_oneshot(&msg) {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "failed to send disconnect"
            );
        }
    }
}
