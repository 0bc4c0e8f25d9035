// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Defines the message type constant for each vmbus protocol message.
macro_rules! vmbus_message_type {
    (pub enum $enum_name:ident, $type_name:ident { $( $num:literal $const_name:ident $struct_name:ident, )* }) => {
        #[allow(missing_docs)]
        impl $type_name {
            $( pub const $const_name: Self = Self($num); )*
        }
    };
}

/// Defines an enum with a variant per message type, and a parse method that
/// converts a received message into one of those variants.
macro_rules! vmbus_message_enum {
    (pub enum $enum_name:ident, $type_name:ident { $( $num:literal $const_name:ident $struct_name:ident, )* }) => {
        /// A parsed vmbus protocol message, along with any data trailing the
        /// fixed-size portion.
        #[derive(Debug)]
        pub enum $enum_name<'a> {
            $( $struct_name($struct_name, &'a [u8]), )*
        }

        impl<'a> $enum_name<'a> {
            /// Parses a vmbus message received from the synic. The message
            /// must be at least as large as the fixed-size struct for its
            /// type; any additional bytes are returned alongside it.
            pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
                let (header, rest) = MessageHeader::read_from_prefix(data)
                    .map_err(|_| ParseError::MessageTooSmall(None))?;

                let message = match header.message_type() {
                    $(
                        $type_name::$const_name => {
                            let (message, remaining) = $struct_name::read_from_prefix(rest)
                                .map_err(|_| {
                                    ParseError::MessageTooSmall(Some(header.message_type()))
                                })?;
                            Self::$struct_name(message, remaining)
                        }
                    )*
                    typ => return Err(ParseError::InvalidMessageType(typ)),
                };

                Ok(message)
            }
        }
    };
}

/// Implements the `VmbusMessage` trait for each protocol message struct, and
/// generates a compile-time assert that the message fits in the hypervisor
/// message payload.
macro_rules! vmbus_message_trait_impl {
    (pub enum $enum_name:ident, $type_name:ident { $( $num:literal $const_name:ident $struct_name:ident, )* }) => {
        $(
            impl VmbusMessage for $struct_name {
                const MESSAGE_TYPE: $type_name = $type_name::$const_name;
            }

            static_assertions::const_assert!($struct_name::MESSAGE_SIZE <= MAX_MESSAGE_SIZE);
        )*
    };
}

/// Defines the message type constants, a parsed-message enum, and `VmbusMessage`
/// trait implementations for the vmbus protocol messages. See the usage in
/// protocol.rs.
macro_rules! vmbus_messages {
    ($($contents:tt)*) => {
        vmbus_message_type!($($contents)*);
        vmbus_message_enum!($($contents)*);
        vmbus_message_trait_impl!($($contents)*);
    };
}
