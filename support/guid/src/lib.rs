// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Provides the [`Guid`] type with the same layout as the Windows type `GUID`.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::str::FromStr;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Windows format GUID.
#[repr(C)]
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
#[expect(missing_docs)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Default for Guid {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl Guid {
    /// The all-zero GUID.
    pub const ZERO: Self = Guid {
        data1: 0,
        data2: 0,
        data3: 0,
        data4: [0; 8],
    };

    /// Returns true if this is the all-zero GUID.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Creates a GUID from a string, panicking if the input is invalid.
    /// Accepted formats are `"00000000-0000-0000-0000-000000000000"` and the
    /// same surrounded by braces.
    ///
    /// This is a const function, intended to initialize GUID constants at
    /// compile time. For non-constants, use `from_str` instead.
    pub const fn from_static_str(value: &'static str) -> Guid {
        match Self::parse(value.as_bytes()) {
            Ok(guid) => guid,
            Err(ParseError::Length) => panic!("invalid GUID length"),
            Err(ParseError::Format) => panic!("invalid GUID format"),
            Err(ParseError::Digit) => panic!("invalid GUID digit"),
        }
    }

    /// Shared by `from_static_str`, `from_str`, and `TryFrom<&[u8]>`.
    const fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let offset = match raw.len() {
            36 => 0,
            38 => {
                if raw[0] != b'{' || raw[37] != b'}' {
                    return Err(ParseError::Format);
                }
                1
            }
            _ => return Err(ParseError::Length),
        };

        // Gather the 32 hex digits into 16 bytes in textual order, checking
        // the four separator positions along the way.
        let mut bytes = [0u8; 16];
        let mut src = 0;
        let mut dst = 0;
        while dst < 16 {
            if src == 8 || src == 13 || src == 18 || src == 23 {
                if raw[offset + src] != b'-' {
                    return Err(ParseError::Format);
                }
                src += 1;
                continue;
            }
            let hi = match hex_digit(raw[offset + src]) {
                Some(v) => v,
                None => return Err(ParseError::Digit),
            };
            let lo = match hex_digit(raw[offset + src + 1]) {
                Some(v) => v,
                None => return Err(ParseError::Digit),
            };
            bytes[dst] = hi << 4 | lo;
            src += 2;
            dst += 1;
        }

        Ok(Guid {
            data1: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data2: u16::from_be_bytes([bytes[4], bytes[5]]),
            data3: u16::from_be_bytes([bytes[6], bytes[7]]),
            data4: [
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ],
        })
    }
}

const fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7],
        )
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// An error parsing a GUID.
#[derive(Debug, Error)]
#[expect(missing_docs)]
pub enum ParseError {
    #[error("invalid GUID length")]
    Length,
    #[error("invalid GUID format")]
    Format,
    #[error("invalid GUID digit")]
    Digit,
}

impl FromStr for Guid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Guid::parse(s.as_bytes())
    }
}

impl TryFrom<&[u8]> for Guid {
    type Error = ParseError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Guid::parse(value)
    }
}

impl From<Guid> for [u8; 16] {
    fn from(value: Guid) -> Self {
        value.as_bytes().try_into().unwrap()
    }
}
