// SPDX-License-Identifier: BSD-3-Clause

//! The match-bits layout (spec §6.1). This is the one wire format the core
//! owns; everything else is a narrow interface onto a collaborator.
//!
//! Bit layout (low to high):
//!
//! ```text
//!  0..32  tag          (masked further by the provider's configured tag-mask)
//! 32      tagged
//! 33      cq_data
//! 34      match_comp
//! 35..43  tx_id
//! 43..51  rdzv_id_lo
//! 51..55  rdzv_id_hi
//! 55..59  rdzv_lac
//! 59      rdzv_done
//! 60..62  rdzv_proto
//! 62..64  le_type
//! ```

use bitflags::bitflags;

const TAG_SHIFT: u32 = 0;
const TAG_BITS: u32 = 32;
const TAGGED_BIT: u32 = 32;
const CQ_DATA_BIT: u32 = 33;
const MATCH_COMP_BIT: u32 = 34;
const TX_ID_SHIFT: u32 = 35;
const TX_ID_BITS: u32 = 8;
const RDZV_ID_LO_SHIFT: u32 = 43;
const RDZV_ID_LO_BITS: u32 = 8;
const RDZV_ID_HI_SHIFT: u32 = 51;
const RDZV_ID_HI_BITS: u32 = 4;
const RDZV_LAC_SHIFT: u32 = 55;
const RDZV_LAC_BITS: u32 = 4;
const RDZV_DONE_BIT: u32 = 59;
const RDZV_PROTO_SHIFT: u32 = 60;
const RDZV_PROTO_BITS: u32 = 2;
const LE_TYPE_SHIFT: u32 = 62;
const LE_TYPE_BITS: u32 = 2;

fn field_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn get_field(word: u64, shift: u32, bits: u32) -> u64 {
    (word >> shift) & field_mask(bits)
}

fn set_field(word: &mut u64, shift: u32, bits: u32, value: u64) {
    let mask = field_mask(bits) << shift;
    *word = (*word & !mask) | ((value << shift) & mask);
}

fn get_bit(word: u64, bit: u32) -> bool {
    (word >> bit) & 1 != 0
}

fn set_bit(word: &mut u64, bit: u32, value: bool) {
    if value {
        *word |= 1 << bit;
    } else {
        *word &= !(1 << bit);
    }
}

/// List-entry type (`le_type`, spec §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeType {
    /// Ordinary user receive buffer.
    Rx,
    /// Zero-byte put, used for match-complete notifications and done-notify.
    Zbp,
    /// Control-message PTE (FC_NOTIFY / FC_RESUME).
    Ctrl,
    /// Reserved.
    Reserved,
}

impl LeType {
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => Self::Rx,
            1 => Self::Zbp,
            2 => Self::Ctrl,
            _ => Self::Reserved,
        }
    }

    fn to_bits(self) -> u64 {
        match self {
            Self::Rx => 0,
            Self::Zbp => 1,
            Self::Ctrl => 2,
            Self::Reserved => 3,
        }
    }
}

/// Rendezvous protocol selector carried in match-bits, mirroring
/// [`crate::config::RdzvProto`] without the `done_notify` payload (that's a
/// local decision, not wire state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdzvProtoBits {
    Restricted,
    Write,
}

impl RdzvProtoBits {
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => Self::Restricted,
            _ => Self::Write,
        }
    }

    fn to_bits(self) -> u64 {
        match self {
            Self::Restricted => 0,
            Self::Write => 1,
        }
    }
}

bitflags! {
    /// Flags that ride alongside match-bits but aren't part of the 64-bit
    /// word themselves (request flags from the data model, spec §3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u32 {
        const MSG             = 1 << 0;
        const TAGGED          = 1 << 1;
        const RECV             = 1 << 2;
        const SEND             = 1 << 3;
        const COMPLETION       = 1 << 4;
        const MULTI_RECV       = 1 << 5;
        const PEEK             = 1 << 6;
        const CLAIM            = 1 << 7;
        const INJECT           = 1 << 8;
        const MATCH_COMPLETE   = 1 << 9;
        const REMOTE_CQ_DATA   = 1 << 10;
        const FENCE            = 1 << 11;
        const MORE             = 1 << 12;
    }
}

/// A 64-bit match-bits value, owning both the sent and the receive-side
/// "ignore" forms (spec §6.1): `(send ^ recv) & !ignore == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchBits(pub u64);

impl MatchBits {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(bits: u64) -> Self {
        Self(bits)
    }

    pub fn tag(self) -> u64 {
        get_field(self.0, TAG_SHIFT, TAG_BITS)
    }

    pub fn with_tag(mut self, tag: u64) -> Self {
        set_field(&mut self.0, TAG_SHIFT, TAG_BITS, tag);
        self
    }

    pub fn tagged(self) -> bool {
        get_bit(self.0, TAGGED_BIT)
    }

    pub fn with_tagged(mut self, tagged: bool) -> Self {
        set_bit(&mut self.0, TAGGED_BIT, tagged);
        self
    }

    pub fn cq_data(self) -> bool {
        get_bit(self.0, CQ_DATA_BIT)
    }

    pub fn with_cq_data(mut self, present: bool) -> Self {
        set_bit(&mut self.0, CQ_DATA_BIT, present);
        self
    }

    pub fn match_complete(self) -> bool {
        get_bit(self.0, MATCH_COMP_BIT)
    }

    pub fn with_match_complete(mut self, set: bool) -> Self {
        set_bit(&mut self.0, MATCH_COMP_BIT, set);
        self
    }

    pub fn tx_id(self) -> u32 {
        get_field(self.0, TX_ID_SHIFT, TX_ID_BITS) as u32
    }

    pub fn with_tx_id(mut self, tx_id: u32) -> Self {
        set_field(&mut self.0, TX_ID_SHIFT, TX_ID_BITS, tx_id as u64);
        self
    }

    pub fn rdzv_id(self) -> u32 {
        let lo = get_field(self.0, RDZV_ID_LO_SHIFT, RDZV_ID_LO_BITS);
        let hi = get_field(self.0, RDZV_ID_HI_SHIFT, RDZV_ID_HI_BITS);
        ((hi << RDZV_ID_LO_BITS) | lo) as u32
    }

    pub fn with_rdzv_id(mut self, id: u32) -> Self {
        let id = id as u64;
        let lo = id & field_mask(RDZV_ID_LO_BITS);
        let hi = (id >> RDZV_ID_LO_BITS) & field_mask(RDZV_ID_HI_BITS);
        set_field(&mut self.0, RDZV_ID_LO_SHIFT, RDZV_ID_LO_BITS, lo);
        set_field(&mut self.0, RDZV_ID_HI_SHIFT, RDZV_ID_HI_BITS, hi);
        self
    }

    pub fn rdzv_lac(self) -> u8 {
        get_field(self.0, RDZV_LAC_SHIFT, RDZV_LAC_BITS) as u8
    }

    pub fn with_rdzv_lac(mut self, lac: u8) -> Self {
        set_field(&mut self.0, RDZV_LAC_SHIFT, RDZV_LAC_BITS, lac as u64);
        self
    }

    pub fn rdzv_done(self) -> bool {
        get_bit(self.0, RDZV_DONE_BIT)
    }

    pub fn with_rdzv_done(mut self, done: bool) -> Self {
        set_bit(&mut self.0, RDZV_DONE_BIT, done);
        self
    }

    pub fn rdzv_proto(self) -> RdzvProtoBits {
        RdzvProtoBits::from_bits(get_field(self.0, RDZV_PROTO_SHIFT, RDZV_PROTO_BITS))
    }

    pub fn with_rdzv_proto(mut self, proto: RdzvProtoBits) -> Self {
        set_field(&mut self.0, RDZV_PROTO_SHIFT, RDZV_PROTO_BITS, proto.to_bits());
        self
    }

    pub fn le_type(self) -> LeType {
        LeType::from_bits(get_field(self.0, LE_TYPE_SHIFT, LE_TYPE_BITS))
    }

    pub fn with_le_type(mut self, le_type: LeType) -> Self {
        set_field(&mut self.0, LE_TYPE_SHIFT, LE_TYPE_BITS, le_type.to_bits());
        self
    }

    /// `(self ^ other) & !ignore == 0`, applied to the whole word — spec
    /// §6.1: "ignore-mask mirrors layout".
    pub fn matches(self, other: MatchBits, ignore: MatchBits) -> bool {
        (self.0 ^ other.0) & !ignore.0 == 0
    }

    /// Tag-only comparison, additionally masked by the provider's configured
    /// tag-mask (`Config::tag_mask`). This is what `post()` and `queue()` use
    /// for ordinary tagged/untagged matching (spec §4.3); `matches` above is
    /// for control-message correlation where every field must line up.
    pub fn tag_matches(self, other: MatchBits, ignore: u64, tag_mask: u64) -> bool {
        let ignore = ignore & tag_mask;
        ((self.tag() ^ other.tag()) & tag_mask & !ignore) == 0
    }

    /// For `le_type() == LeType::Ctrl` only: distinguishes the two control
    /// message kinds of spec §6.2 (`FC_NOTIFY` vs `FC_RESUME`). Spec §6.1's
    /// layout reserves no dedicated bit for this, so this reuses the
    /// `rdzv_done` position the same way hardware overlays fields by
    /// `le_type` context elsewhere in the word; it carries no meaning outside
    /// the control-message path.
    pub fn ctrl_is_resume(self) -> bool {
        self.rdzv_done()
    }

    pub fn with_ctrl_is_resume(self, resume: bool) -> Self {
        self.with_rdzv_done(resume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_field() {
        let mb = MatchBits::new()
            .with_tag(0xdead_beef)
            .with_tagged(true)
            .with_cq_data(true)
            .with_match_complete(true)
            .with_tx_id(200)
            .with_rdzv_id(3000)
            .with_rdzv_lac(9)
            .with_rdzv_done(true)
            .with_rdzv_proto(RdzvProtoBits::Restricted)
            .with_le_type(LeType::Zbp);

        assert_eq!(mb.tag(), 0xdead_beef);
        assert!(mb.tagged());
        assert!(mb.cq_data());
        assert!(mb.match_complete());
        assert_eq!(mb.tx_id(), 200);
        assert_eq!(mb.rdzv_id(), 3000);
        assert_eq!(mb.rdzv_lac(), 9);
        assert!(mb.rdzv_done());
        assert_eq!(mb.rdzv_proto(), RdzvProtoBits::Restricted);
        assert_eq!(mb.le_type(), LeType::Zbp);
    }

    #[test]
    fn tag_match_honors_ignore_mask() {
        let send = MatchBits::new().with_tag(0b1010);
        let recv = MatchBits::new().with_tag(0b1000);
        // Bit 1 (value 2) differs; ignoring it makes the tags match.
        assert!(!send.tag_matches(recv, 0, u64::MAX));
        assert!(send.tag_matches(recv, 0b0010, u64::MAX));
    }

    #[test]
    fn all_ones_ignore_matches_anything() {
        let send = MatchBits::new().with_tag(42);
        let recv = MatchBits::new().with_tag(1_000_000);
        assert!(send.tag_matches(recv, u64::MAX, u64::MAX));
    }
}
