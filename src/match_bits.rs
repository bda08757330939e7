//! Match-bits layout shared between sender and receiver.
//!
//! All event-to-event correlation goes through this 64-bit word. Three arms
//! overlay the same bits, discriminated by the list-entry type:
//!
//! ```text
//! Bits    RX arm                 Zero-byte-put arm      Control arm
//! 0..40   tag                    rdzv_id_lo (0..8)      ctrl_msg_type (0..2)
//!                                                       drops (8..24)
//! 40..48  tx_id                  rdzv_id_hi (40..44)
//!                                rdzv_lac   (44..48)
//! 48..50  rdzv_proto
//! 50      cq_data
//! 51      tagged
//! 52      match_comp
//! 53      rdzv_done
//! 54..56  le_type
//! 56..64  reserved
//! ```
//!
//! `tx_id` and the rendezvous id/lac fields deliberately share bits: a
//! receive-list entry ignores the whole region, so either arm matches.

/// Width of the wire tag field.
pub const TAG_WIDTH: u32 = 40;

/// Mask of valid tag bits.
pub const TAG_MASK: u64 = (1 << TAG_WIDTH) - 1;

/// Width of the transaction-id field.
pub const TX_ID_WIDTH: u32 = 8;

/// Bits of the rendezvous id carried in the command itself; the remainder
/// travels in `rdzv_id_hi`.
pub const RDZV_ID_CMD_WIDTH: u32 = 8;

/// Width of the high rendezvous-id field.
pub const RDZV_ID_HI_WIDTH: u32 = 4;

/// Total rendezvous-id width.
pub const RDZV_ID_WIDTH: u32 = RDZV_ID_CMD_WIDTH + RDZV_ID_HI_WIDTH;

const TX_ID_SHIFT: u32 = 40;
const RDZV_ID_HI_SHIFT: u32 = 40;
const RDZV_LAC_SHIFT: u32 = 44;
const RDZV_PROTO_SHIFT: u32 = 48;
const CQ_DATA_BIT: u64 = 1 << 50;
const TAGGED_BIT: u64 = 1 << 51;
const MATCH_COMP_BIT: u64 = 1 << 52;
const RDZV_DONE_BIT: u64 = 1 << 53;
const LE_TYPE_SHIFT: u32 = 54;

const CTRL_MSG_TYPE_MASK: u64 = 0x3;
const CTRL_DROPS_SHIFT: u32 = 8;
const CTRL_DROPS_MASK: u64 = 0xffff;

/// List-entry type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LeType {
    /// Receive list entry (tagged or untagged message).
    Rx = 0,
    /// Zero-byte put (match-complete and rendezvous-done notifies).
    Zbp = 1,
    /// Control message (flow-control notify/resume).
    Ctrl = 2,
}

/// Control message kind, carried in the control arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtrlMsgType {
    /// Sender reports its drop count to a disabled peer.
    FcNotify = 0,
    /// Receiver tells a peer it may replay dropped sends.
    FcResume = 1,
}

/// The 64-bit match word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchBits(pub u64);

impl MatchBits {
    /// Empty match word (RX arm, untagged, no options).
    pub fn new() -> Self {
        Self(0)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn tag(self) -> u64 {
        self.0 & TAG_MASK
    }

    pub fn set_tag(&mut self, tag: u64) {
        debug_assert_eq!(tag & !TAG_MASK, 0);
        self.0 = (self.0 & !TAG_MASK) | (tag & TAG_MASK);
    }

    #[inline]
    pub fn tagged(self) -> bool {
        self.0 & TAGGED_BIT != 0
    }

    pub fn set_tagged(&mut self, tagged: bool) {
        if tagged {
            self.0 |= TAGGED_BIT;
        } else {
            self.0 &= !TAGGED_BIT;
        }
    }

    #[inline]
    pub fn cq_data(self) -> bool {
        self.0 & CQ_DATA_BIT != 0
    }

    pub fn set_cq_data(&mut self, cq_data: bool) {
        if cq_data {
            self.0 |= CQ_DATA_BIT;
        } else {
            self.0 &= !CQ_DATA_BIT;
        }
    }

    #[inline]
    pub fn match_comp(self) -> bool {
        self.0 & MATCH_COMP_BIT != 0
    }

    pub fn set_match_comp(&mut self, mc: bool) {
        if mc {
            self.0 |= MATCH_COMP_BIT;
        } else {
            self.0 &= !MATCH_COMP_BIT;
        }
    }

    #[inline]
    pub fn rdzv_done(self) -> bool {
        self.0 & RDZV_DONE_BIT != 0
    }

    pub fn set_rdzv_done(&mut self, done: bool) {
        if done {
            self.0 |= RDZV_DONE_BIT;
        } else {
            self.0 &= !RDZV_DONE_BIT;
        }
    }

    #[inline]
    pub fn tx_id(self) -> u16 {
        ((self.0 >> TX_ID_SHIFT) & ((1 << TX_ID_WIDTH) - 1)) as u16
    }

    pub fn set_tx_id(&mut self, tx_id: u16) {
        debug_assert!(tx_id < (1 << TX_ID_WIDTH));
        let mask = ((1u64 << TX_ID_WIDTH) - 1) << TX_ID_SHIFT;
        self.0 = (self.0 & !mask) | ((tx_id as u64) << TX_ID_SHIFT);
    }

    #[inline]
    pub fn rdzv_id_hi(self) -> u16 {
        ((self.0 >> RDZV_ID_HI_SHIFT) & ((1 << RDZV_ID_HI_WIDTH) - 1)) as u16
    }

    pub fn set_rdzv_id_hi(&mut self, hi: u16) {
        debug_assert!(hi < (1 << RDZV_ID_HI_WIDTH));
        let mask = ((1u64 << RDZV_ID_HI_WIDTH) - 1) << RDZV_ID_HI_SHIFT;
        self.0 = (self.0 & !mask) | ((hi as u64) << RDZV_ID_HI_SHIFT);
    }

    /// Low rendezvous-id bits on the zero-byte-put arm.
    #[inline]
    pub fn rdzv_id_lo(self) -> u16 {
        (self.0 & ((1 << RDZV_ID_CMD_WIDTH) - 1)) as u16
    }

    pub fn set_rdzv_id_lo(&mut self, lo: u16) {
        debug_assert!(lo < (1 << RDZV_ID_CMD_WIDTH));
        let mask = (1u64 << RDZV_ID_CMD_WIDTH) - 1;
        self.0 = (self.0 & !mask) | lo as u64;
    }

    #[inline]
    pub fn rdzv_lac(self) -> u8 {
        ((self.0 >> RDZV_LAC_SHIFT) & 0xf) as u8
    }

    pub fn set_rdzv_lac(&mut self, lac: u8) {
        debug_assert!(lac < 16);
        self.0 = (self.0 & !(0xfu64 << RDZV_LAC_SHIFT)) | ((lac as u64) << RDZV_LAC_SHIFT);
    }

    #[inline]
    pub fn rdzv_proto(self) -> u8 {
        ((self.0 >> RDZV_PROTO_SHIFT) & 0x3) as u8
    }

    pub fn set_rdzv_proto(&mut self, proto: u8) {
        debug_assert!(proto < 4);
        self.0 = (self.0 & !(0x3u64 << RDZV_PROTO_SHIFT)) | ((proto as u64) << RDZV_PROTO_SHIFT);
    }

    #[inline]
    pub fn le_type(self) -> LeType {
        match (self.0 >> LE_TYPE_SHIFT) & 0x3 {
            0 => LeType::Rx,
            1 => LeType::Zbp,
            _ => LeType::Ctrl,
        }
    }

    pub fn set_le_type(&mut self, le_type: LeType) {
        self.0 =
            (self.0 & !(0x3u64 << LE_TYPE_SHIFT)) | ((le_type as u8 as u64) << LE_TYPE_SHIFT);
    }

    /// Full rendezvous id: high bits from the match word, low bits from the
    /// command's rendezvous-id field.
    #[inline]
    pub fn rdzv_id(self, cmd_rdzv_id: u16) -> u16 {
        (self.rdzv_id_hi() << RDZV_ID_CMD_WIDTH) | (cmd_rdzv_id & ((1 << RDZV_ID_CMD_WIDTH) - 1))
    }

    /// Full rendezvous id on the zero-byte-put arm.
    #[inline]
    pub fn zbp_rdzv_id(self) -> u16 {
        (self.rdzv_id_hi() << RDZV_ID_CMD_WIDTH) | self.rdzv_id_lo()
    }

    /// Control-arm message type.
    pub fn ctrl_msg_type(self) -> Option<CtrlMsgType> {
        match self.0 & CTRL_MSG_TYPE_MASK {
            0 => Some(CtrlMsgType::FcNotify),
            1 => Some(CtrlMsgType::FcResume),
            _ => None,
        }
    }

    pub fn set_ctrl_msg_type(&mut self, ty: CtrlMsgType) {
        self.0 = (self.0 & !CTRL_MSG_TYPE_MASK) | ty as u8 as u64;
    }

    /// Control-arm drop count.
    #[inline]
    pub fn drops(self) -> u16 {
        ((self.0 >> CTRL_DROPS_SHIFT) & CTRL_DROPS_MASK) as u16
    }

    pub fn set_drops(&mut self, drops: u16) {
        self.0 = (self.0 & !(CTRL_DROPS_MASK << CTRL_DROPS_SHIFT))
            | ((drops as u64) << CTRL_DROPS_SHIFT);
    }
}

/// Ignore mask for a posted receive.
///
/// Ignores the caller's tag bits plus every field that is initiator protocol
/// state rather than match criteria: the tx-id/rendezvous region, the
/// protocol selector and the option bits. `tagged` and `le_type` are NOT
/// ignored for tagged receives; untagged receives additionally ignore the
/// tag field entirely.
pub fn recv_ignore(tagged: bool, ignore: u64) -> MatchBits {
    let mut ib = MatchBits::new();
    ib.set_tx_id((1 << TX_ID_WIDTH) - 1);
    ib.set_rdzv_proto(0x3);
    ib.set_cq_data(true);
    ib.set_match_comp(true);
    ib.set_rdzv_done(true);
    if tagged {
        ib.set_tag(ignore & TAG_MASK);
    } else {
        ib.set_tag(TAG_MASK);
    }
    ib
}

/// Ignore mask for an unexpected-list search (peek/claim). Identical to the
/// receive ignore except the le-type field is also ignored so onload-time
/// searches sweep every entry.
pub fn search_ignore(tagged: bool, ignore: u64, sweep: bool) -> MatchBits {
    let mut ib = recv_ignore(tagged, ignore);
    if sweep {
        ib.0 |= 0x3u64 << LE_TYPE_SHIFT;
        ib.set_tagged(true);
        ib.set_tag(TAG_MASK);
    }
    ib
}

/// Compare send and receive match words under an ignore mask.
#[inline]
pub fn tag_match(send_bits: MatchBits, recv_bits: MatchBits, ignore: MatchBits) -> bool {
    (send_bits.0 ^ recv_bits.0) & !ignore.0 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rx_arm_roundtrip() {
        let mut mb = MatchBits::new();
        mb.set_tag(0xAB_CDEF_1234);
        mb.set_tagged(true);
        mb.set_cq_data(true);
        mb.set_match_comp(true);
        mb.set_tx_id(0x7f);
        mb.set_rdzv_proto(1);
        mb.set_le_type(LeType::Rx);

        assert_eq!(mb.tag(), 0xAB_CDEF_1234);
        assert!(mb.tagged());
        assert!(mb.cq_data());
        assert!(mb.match_comp());
        assert!(!mb.rdzv_done());
        assert_eq!(mb.tx_id(), 0x7f);
        assert_eq!(mb.rdzv_proto(), 1);
        assert_eq!(mb.le_type(), LeType::Rx);
    }

    #[test]
    fn test_rdzv_id_split() {
        let mut mb = MatchBits::new();
        let id: u16 = 0xABC;
        mb.set_rdzv_id_hi(id >> RDZV_ID_CMD_WIDTH);
        let cmd_lo = id & ((1 << RDZV_ID_CMD_WIDTH) - 1);
        assert_eq!(mb.rdzv_id(cmd_lo), id);

        let mut zbp = MatchBits::new();
        zbp.set_le_type(LeType::Zbp);
        zbp.set_rdzv_done(true);
        zbp.set_rdzv_id_hi(id >> RDZV_ID_CMD_WIDTH);
        zbp.set_rdzv_id_lo(cmd_lo);
        assert_eq!(zbp.zbp_rdzv_id(), id);
        assert_eq!(zbp.le_type(), LeType::Zbp);
    }

    #[test]
    fn test_ctrl_arm() {
        let mut mb = MatchBits::new();
        mb.set_le_type(LeType::Ctrl);
        mb.set_ctrl_msg_type(CtrlMsgType::FcNotify);
        mb.set_drops(1234);
        assert_eq!(mb.le_type(), LeType::Ctrl);
        assert_eq!(mb.ctrl_msg_type(), Some(CtrlMsgType::FcNotify));
        assert_eq!(mb.drops(), 1234);
    }

    #[test]
    fn test_tag_match_ignores_protocol_bits() {
        // A tagged send with tx_id/proto noise still matches a tagged recv.
        let mut send = MatchBits::new();
        send.set_tagged(true);
        send.set_tag(7);
        send.set_tx_id(42);
        send.set_match_comp(true);
        send.set_rdzv_proto(1);

        let mut recv = MatchBits::new();
        recv.set_tagged(true);
        recv.set_tag(7);

        assert!(tag_match(send, recv, recv_ignore(true, 0)));

        // Different tag does not match.
        recv.set_tag(8);
        assert!(!tag_match(send, recv, recv_ignore(true, 0)));

        // With an all-ones ignore over the differing bit it matches again.
        assert!(tag_match(send, recv, recv_ignore(true, 0xf)));
    }

    #[test]
    fn test_tagged_untagged_do_not_cross_match() {
        let mut send = MatchBits::new();
        send.set_tagged(true);
        send.set_tag(3);

        let recv = MatchBits::new();
        // Untagged receive ignores the tag but not the tagged bit.
        assert!(!tag_match(send, recv, recv_ignore(false, 0)));

        send.set_tagged(false);
        send.set_tag(0);
        assert!(tag_match(send, recv, recv_ignore(false, 0)));
    }
}
