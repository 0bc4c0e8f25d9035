// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The vmbus control message protocol spoken over the synic message
//! connection.

use bitfield_struct::bitfield;
use guid::Guid;
use std::mem::size_of;
use std::ops::Deref;
use std::ops::DerefMut;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[macro_use]
mod macros;

pub const HEADER_SIZE: usize = size_of::<MessageHeader>();
pub const MAX_MESSAGE_SIZE: usize = hvdef::SYNIC_MESSAGE_PAYLOAD_SIZE;

/// The fixed connection id used to post control messages to the host.
pub const MESSAGE_CONNECTION_ID: u32 = 1;
/// The fixed connection id used to signal shared-interrupt channels.
pub const EVENT_CONNECTION_ID: u32 = 2;

/// The SINT the host delivers control messages on.
pub const SINT_MESSAGE: u8 = 2;
/// The SINT the host delivers synthetic timer expirations on.
pub const SINT_TIMER: u8 = 4;

/// The ACPI hardware id of the vmbus device.
pub const ACPI_HID: &str = "VMBUS";

/// Channel table size once a modern protocol version is negotiated. A
/// channel signals with its id as the event flag, so this is limited by the
/// size of the per-processor synic event flags bitmap (2048 bits per SINT);
/// bit 0 addresses the bus itself and never names a channel.
pub const MAX_CHANNELS: usize = hvdef::SYNIC_EVENT_FLAGS_PER_SINT - 1;
/// Channel table size for the WS2008/WS2008R2 protocol versions.
pub const MAX_CHANNELS_LEGACY: usize = 256;

/// Flag bits in each half of the shared event-flags page.
pub const EVENT_FLAG_PAGE_BITS: usize = hvdef::HV_PAGE_SIZE_USIZE * 8 / 2;

/// Cap on `pages + 1` for a single GPADL, imposed by the hypervisor.
pub const MAX_GPADL_PAGES: usize = 8192;

// This macro defines the MessageType constant, the parsed Message enum
// variant, and the VmbusMessage trait implementation for each protocol
// message struct.
//
// The syntax is: number type-constant struct
vmbus_messages! {
    pub enum Message, MessageType {
        1 CHANNEL_OFFER ChannelOffer,
        2 RESCIND_CHANNEL_OFFER RescindChannelOffer,
        3 REQUEST_CHANNELS RequestChannels,
        4 REQUEST_CHANNELS_DONE RequestChannelsDone,
        5 OPEN_CHANNEL OpenChannel,
        6 OPEN_CHANNEL_RESPONSE OpenChannelResponse,
        7 CLOSE_CHANNEL CloseChannel,
        8 CREATE_GPADL CreateGpadl,
        9 CREATE_GPADL_ADDT CreateGpadlAddt,
        10 CREATE_GPADL_RESPONSE CreateGpadlResponse,
        11 FREE_GPADL FreeGpadl,
        12 FREE_GPADL_RESPONSE FreeGpadlResponse,
        13 FREE_CHANNEL FreeChannel,
        14 CONNECT Connect,
        15 CONNECT_RESPONSE ConnectResponse,
        16 DISCONNECT Disconnect,
    }
}

/// The message type value that identifies a vmbus protocol message.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageType(pub u32);

impl MessageType {
    pub const INVALID: Self = Self(0);
}

/// An error that occurred while parsing a vmbus protocol message.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The message was smaller than required for the message type.
    #[error("message too small: {0:?}")]
    MessageTooSmall(Option<MessageType>),
    /// The message type is not a valid vmbus protocol message.
    #[error("unexpected or unsupported message type: {0:?}")]
    InvalidMessageType(MessageType),
}

/// Trait implemented on all protocol message structs by the vmbus_messages!
/// macro.
pub trait VmbusMessage: Sized {
    /// The corresponding message type for the struct.
    const MESSAGE_TYPE: MessageType;

    /// The size of the message, including the vmbus message header.
    const MESSAGE_SIZE: usize = HEADER_SIZE + size_of::<Self>();
}

/// The header of a vmbus message.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageHeader {
    message_type: MessageType,
    padding: u32,
}

impl MessageHeader {
    /// Creates a new `MessageHeader` for the specified message type.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            padding: 0,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }
}

/// A channel id assigned by the host. Id 0 addresses the bus itself and never
/// names a channel.
#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct ChannelId(pub u32);

/// A guest physical address descriptor list handle. Id 0 is reserved as
/// "invalid".
#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct GpadlId(pub u32);

impl GpadlId {
    /// The reserved invalid handle.
    pub const NULL: Self = Self(0);
}

pub const fn make_version(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | (minor as u32)
}

/// A vmbus protocol version, named for the Windows release that introduced
/// it.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    Ws2008 = make_version(0, 13),
    Ws2008R2 = make_version(1, 1),
    Win8 = make_version(2, 4),
    Win8_1 = make_version(3, 0),
    Win10 = make_version(4, 0),
    Win10Rs3 = make_version(4, 1),
    Win10V5 = make_version(5, 0),
    Win10Rs4 = make_version(5, 1),
    Win10Rs5 = make_version(5, 2),
    Ws2022 = make_version(5, 3),
}

impl Version {
    pub fn major(self) -> u16 {
        (self as u32 >> 16) as u16
    }

    pub fn minor(self) -> u16 {
        self as u32 as u16
    }

    /// True for versions using the legacy shared event-flag bitmaps rather
    /// than per-processor synic event flags.
    pub fn is_legacy(self) -> bool {
        self <= Version::Ws2008R2
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// Versions offered during connection, newest first.
pub const NEGOTIATE_ORDER: &[Version] = &[Version::Ws2008R2, Version::Ws2008];

/// User-defined data provided by a device as part of an offer or open
/// request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct UserDefinedData([u8; 120]);

impl Deref for UserDefinedData {
    type Target = [u8; 120];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for UserDefinedData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<[u8; 120]> for UserDefinedData {
    fn from(value: [u8; 120]) -> Self {
        Self(value)
    }
}

impl Default for UserDefinedData {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

#[bitfield(u16)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct OfferFlags {
    pub enumerate_device_interface: bool, // 0x1
    #[bits(3)]
    _reserved1: u16,
    pub named_pipe_mode: bool, // 0x10
    #[bits(11)]
    _reserved2: u16,
}

#[bitfield(u8)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct MonitorFlags {
    pub allocated: bool,
    #[bits(7)]
    _reserved: u8,
}

/// Interrupt policy bits, valid in offers from WS2008R2 on.
#[bitfield(u16)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct OfferInterruptFlags {
    /// The host granted the channel a distinct connection id for
    /// signalling rather than the shared event connection.
    pub dedicated: bool,
    #[bits(15)]
    _reserved: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ChannelOffer {
    pub type_id: Guid,
    pub instance_id: Guid,
    pub rsvd: [u32; 4],
    pub flags: OfferFlags,
    pub mmio_megabytes: u16,
    pub user_defined: UserDefinedData,
    pub subchannel_index: u16,
    pub rsvd2: u16,
    pub channel_id: ChannelId,
    pub monitor_id: u8,
    pub monitor_flags: MonitorFlags,
    /// Valid from WS2008R2 on; zero in WS2008 offers.
    pub interrupt_flags: OfferInterruptFlags,
    /// Valid from WS2008R2 on; zero in WS2008 offers.
    pub connection_id: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RescindChannelOffer {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RequestChannels {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RequestChannelsDone {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenChannel {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub ring_gpadl_id: GpadlId,
    pub target_cpu: u32,
    pub rx_page_offset: u32,
    pub user_data: UserDefinedData,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenChannelResponse {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub result: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CloseChannel {
    pub channel_id: ChannelId,
}

/// The fixed-size portion of CREATE_GPADL. A single [`GpadlRange`] and its
/// first page numbers follow as message data.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CreateGpadl {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    /// Byte length of the range descriptors including their page numbers.
    pub range_buflen: u16,
    pub range_count: u16,
}

/// A descriptor for one contiguous byte range covered by a GPADL.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlRange {
    pub byte_count: u32,
    pub byte_offset: u32,
}

/// The fixed-size portion of CREATE_GPADL_ADDT, an unacknowledged
/// continuation carrying further page numbers as message data.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CreateGpadlAddt {
    pub msg_number: u32,
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CreateGpadlResponse {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    pub result: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct FreeGpadl {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct FreeGpadlResponse {
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct FreeChannel {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct Connect {
    pub version: u32,
    pub target_cpu: u32,
    pub event_flags_gpa: u64,
    pub monitor1_gpa: u64,
    pub monitor2_gpa: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ConnectResponse {
    pub supported: u8,
    pub connection_state: u8,
    pub rsvd: u16,
    pub connection_id: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct Disconnect {}

/// The most page numbers that fit in a CREATE_GPADL message alongside its
/// single range descriptor.
pub const MAX_PAGES_PER_CREATE: usize =
    (MAX_MESSAGE_SIZE - CreateGpadl::MESSAGE_SIZE - size_of::<GpadlRange>()) / size_of::<u64>();

/// The most page numbers that fit in a CREATE_GPADL_ADDT message.
pub const MAX_PAGES_PER_ADDT: usize =
    (MAX_MESSAGE_SIZE - CreateGpadlAddt::MESSAGE_SIZE) / size_of::<u64>();

/// The page shared with the host at connect time carrying one receive and one
/// transmit flag per channel id.
#[repr(C)]
#[derive(Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct EventFlagsPage {
    pub rx_flags: [u32; EVENT_FLAG_PAGE_BITS / 32],
    pub tx_flags: [u32; EVENT_FLAG_PAGE_BITS / 32],
}

static_assertions::const_assert_eq!(
    size_of::<EventFlagsPage>(),
    hvdef::HV_PAGE_SIZE_USIZE
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_sizes() {
        assert_eq!(size_of::<ChannelOffer>(), 188);
        assert_eq!(size_of::<OpenChannel>(), 140);
        assert_eq!(size_of::<Connect>(), 32);
        assert_eq!(size_of::<ConnectResponse>(), 8);
        assert_eq!(CreateGpadl::MESSAGE_SIZE, 20);
        assert_eq!(CreateGpadlAddt::MESSAGE_SIZE, 16);
    }

    #[test]
    fn test_gpadl_chunking_constants() {
        assert_eq!(MAX_PAGES_PER_CREATE, 26);
        assert_eq!(MAX_PAGES_PER_ADDT, 28);
    }

    #[test]
    fn test_channel_caps() {
        // Every publishable channel id must have a representable bit in the
        // per-SINT synic event flags.
        assert_eq!(MAX_CHANNELS, 2047);
        assert_eq!(MAX_CHANNELS, hvdef::SYNIC_EVENT_FLAG_WORDS * 32 - 1);
        assert!(MAX_CHANNELS_LEGACY <= MAX_CHANNELS);
        assert_eq!(EVENT_FLAG_PAGE_BITS, 16384);
    }

    #[test]
    fn test_version_encoding() {
        assert_eq!(Version::Ws2008 as u32, 13);
        assert_eq!(Version::Ws2008R2 as u32, 0x0001_0001);
        assert_eq!(Version::Ws2022 as u32, 0x0005_0003);
        assert_eq!(Version::Ws2008R2.major(), 1);
        assert_eq!(Version::Ws2008R2.minor(), 1);
        assert!(Version::Ws2008.is_legacy());
        assert!(Version::Ws2008R2.is_legacy());
        assert!(!Version::Win8.is_legacy());
    }

    #[test]
    fn test_parse_rescind() {
        let mut data = Vec::new();
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&17u32.to_le_bytes());
        let Message::RescindChannelOffer(msg, rest) = Message::parse(&data).unwrap() else {
            panic!("wrong message variant");
        };
        assert_eq!(msg.channel_id, ChannelId(17));
        assert!(rest.is_empty());
    }

    #[test]
    fn test_parse_too_small() {
        let mut data = Vec::new();
        data.extend_from_slice(&15u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&[1, 0]);
        assert!(matches!(
            Message::parse(&data),
            Err(ParseError::MessageTooSmall(Some(
                MessageType::CONNECT_RESPONSE
            )))
        ));
    }

    #[test]
    fn test_parse_unknown_type() {
        let mut data = Vec::new();
        data.extend_from_slice(&99u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            Message::parse(&data),
            Err(ParseError::InvalidMessageType(MessageType(99)))
        ));
    }
}
