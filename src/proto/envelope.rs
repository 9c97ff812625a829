// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Skill Envelope wire format (§6.1, GLOSSARY "Envelope").
//!
//! ```text
//! u64 task_id
//! u16 skill_id
//! u16 flags        bit0 = is_response, bit1 = has_error, rest reserved = 0
//! u8  status        0 = ok, 1 = error; must be 0 for requests
//! u8  reserved      must be 0
//! u16 payload_len_high
//! u32 payload_len_low
//! bytes[payload_len] payload
//! ```
//!
//! `EnvelopeHeader` is the zero-copy wire view, read/written in place;
//! `EnvelopeFlags`/`RawEnvelopeFlags` follow a paired
//! bitflags-plus-zerocopy-wrapper idiom.

use core::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32, U64};

/// Length of the fixed envelope header, in bytes.
pub const ENVELOPE_HEADER_LEN: usize = 20;

/// Current wire protocol version, exchanged in the hello payload.
pub const PROTOCOL_VERSION: u32 = 1;

/// `skill_id` reserved for hello/handshake frames.
pub const HELLO_SKILL_ID: u16 = 0;

bitflags::bitflags! {
    #[derive(Default, PartialEq, Eq, Clone, Copy)]
    pub struct EnvelopeFlags: u16 {
        const IS_RESPONSE = 0b01;
        const HAS_ERROR   = 0b10;
    }
}

impl fmt::Debug for EnvelopeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(EnvelopeFlags::IS_RESPONSE) {
            parts.push("IS_RESPONSE");
        }
        if self.contains(EnvelopeFlags::HAS_ERROR) {
            parts.push("HAS_ERROR");
        }
        write!(f, "EnvelopeFlags({})", parts.join("|"))
    }
}

/// Wire-safe, zero-copy wrapper for the two-byte flags field.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawEnvelopeFlags(U16<LittleEndian>);

impl RawEnvelopeFlags {
    #[inline]
    pub fn flags(self) -> EnvelopeFlags {
        EnvelopeFlags::from_bits_truncate(self.0.get())
    }

    #[inline]
    pub fn set_flags(&mut self, f: EnvelopeFlags) {
        self.0.set(f.bits());
    }

    #[inline]
    pub fn is_response(self) -> bool {
        self.flags().contains(EnvelopeFlags::IS_RESPONSE)
    }

    #[inline]
    pub fn has_error(self) -> bool {
        self.flags().contains(EnvelopeFlags::HAS_ERROR)
    }
}

impl From<EnvelopeFlags> for RawEnvelopeFlags {
    #[inline]
    fn from(f: EnvelopeFlags) -> Self {
        let mut r = RawEnvelopeFlags::default();
        r.set_flags(f);
        r
    }
}

impl fmt::Debug for RawEnvelopeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawEnvelopeFlags({:?})", self.flags())
    }
}

/// Status byte, meaningful only for response envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    #[default]
    Ok = 0,
    Error = 1,
}

impl From<u8> for Status {
    fn from(v: u8) -> Self {
        if v == 0 { Status::Ok } else { Status::Error }
    }
}

/// Zero-copy wire view of the 20-byte envelope header.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct EnvelopeHeader {
    pub task_id: U64<LittleEndian>,
    pub skill_id: U16<LittleEndian>,
    pub flags: RawEnvelopeFlags,
    pub status: u8,
    pub reserved: u8,
    pub payload_len_high: U16<LittleEndian>,
    pub payload_len_low: U32<LittleEndian>,
}

impl EnvelopeHeader {
    /// Reassembles the 48-bit payload length split across the
    /// `payload_len_high`/`payload_len_low` fields.
    #[inline]
    pub fn payload_len(&self) -> u64 {
        (u64::from(self.payload_len_high.get()) << 32) | u64::from(self.payload_len_low.get())
    }

    #[inline]
    pub fn set_payload_len(&mut self, len: u64) {
        self.payload_len_high.set((len >> 32) as u16);
        self.payload_len_low.set(len as u32);
    }

    pub fn request(task_id: u64, skill_id: u16, payload_len: u64) -> Self {
        let mut h = EnvelopeHeader {
            task_id: task_id.into(),
            skill_id: skill_id.into(),
            ..Default::default()
        };
        h.set_payload_len(payload_len);
        h
    }

    pub fn response(task_id: u64, skill_id: u16, status: Status, payload_len: u64) -> Self {
        let mut h = EnvelopeHeader {
            task_id: task_id.into(),
            skill_id: skill_id.into(),
            status: status as u8,
            ..Default::default()
        };
        h.flags.set_flags(EnvelopeFlags::IS_RESPONSE);
        h.set_payload_len(payload_len);
        h
    }

    #[inline]
    pub fn as_header_bytes(&self) -> &[u8; ENVELOPE_HEADER_LEN] {
        let bytes = self.as_bytes();
        bytes
            .try_into()
            .expect("EnvelopeHeader is exactly ENVELOPE_HEADER_LEN bytes")
    }

    pub fn from_header_bytes(buf: &mut [u8]) -> Option<&mut Self> {
        <Self as zerocopy::FromBytes>::mut_from_bytes(buf).ok()
    }
}

/// Hello-frame payload (`skill_id = 0`): `{ protocol_version, max_in_flight }`
/// per §6.1.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct HelloPayload {
    pub protocol_version: U32<LittleEndian>,
    pub max_in_flight: U32<LittleEndian>,
}

impl HelloPayload {
    pub fn new(protocol_version: u32, max_in_flight: u32) -> Self {
        Self {
            protocol_version: protocol_version.into(),
            max_in_flight: max_in_flight.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let h = EnvelopeHeader::response(42, 7, Status::Error, (1u64 << 33) + 5);
        let mut buf = *h.as_header_bytes();
        let parsed = EnvelopeHeader::from_header_bytes(&mut buf).expect("parses");
        assert_eq!(parsed.task_id.get(), 42);
        assert_eq!(parsed.skill_id.get(), 7);
        assert!(parsed.flags.is_response());
        assert_eq!(parsed.status, Status::Error as u8);
        assert_eq!(parsed.payload_len(), (1u64 << 33) + 5);
    }

    #[test]
    fn hello_payload_layout_is_eight_bytes() {
        let p = HelloPayload::new(PROTOCOL_VERSION, 8);
        assert_eq!(p.as_bytes().len(), 8);
    }
}
