//! The narrow NIC interface the messaging core consumes.
//!
//! Command queues, event queues, list entries and the table of portal
//! entries are device primitives owned outside this crate. The core talks
//! to them through the [`Nic`] trait: it appends and unlinks match entries,
//! issues puts and gets, changes the receive portal state, and drains a
//! single event queue. Everything else about the device is opaque.
//!
//! Command emission returns `Error::Again` when the command queue is full;
//! callers surface that as try-later so the event is re-presented.

use bitflags::bitflags;

use crate::error::Result;
use crate::match_bits::MatchBits;

/// Event type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Link,
    Unlink,
    Put,
    PutOverflow,
    Rendezvous,
    Search,
    Get,
    Send,
    Ack,
    Reply,
    StateChange,
}

/// Device return codes surfaced in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok,
    /// No list-entry space; appends fail with this.
    NoSpace,
    /// Append failed because the portal transitioned to software managed.
    PtlteSwManaged,
    /// Put arrived at a disabled portal and was dropped.
    PtDisabled,
    /// Target event queue had no room; retryable.
    EntryNotFound,
    /// Search or state change found no match.
    NoMatch,
    Canceled,
    Undeliverable,
}

/// Portal-entry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtlteState {
    Enabled,
    Disabled,
    SoftwareManaged,
}

/// NIC-maintained match lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtlList {
    Priority,
    Overflow,
    Request,
    Unexpected,
}

/// Reason attached to a portal disable or software-managed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    /// State change requested by software.
    SoftwareInitiated,
    /// Target event queue filled.
    FcEqFull,
    /// No overflow buffer could absorb an unexpected put.
    FcNoMatch,
    /// Unexpected-header resources exhausted.
    FcUnexpectedFail,
    /// Request-list buffers exhausted (software managed mode).
    FcRequestFull,
    /// NIC could not append in software-managed mode.
    SmAppendFail,
    /// NIC could not allocate an unexpected header in SW-managed mode.
    SmUnexpectedFail,
    /// Uncorrectable list-entry error. Fatal.
    Uncorrectable,
}

/// Target portals addressable by initiator commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPte {
    /// Message receive portal.
    Rx,
    /// Rendezvous source window (pulled by the target's get).
    RdzvSrc,
    /// Zero-byte-put portal (match-complete / rendezvous-done notifies).
    Zbp,
    /// Control-message portal.
    Ctrl,
}

bitflags! {
    /// List-entry append options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LeFlags: u32 {
        /// Unlink after the first match.
        const USE_ONCE            = 1 << 0;
        /// Locally managed offsets (multi-receive consumption).
        const MANAGE_LOCAL        = 1 << 1;
        /// Suppress the link success event.
        const EVENT_LINK_DISABLE  = 1 << 2;
        /// Suppress the automatic-unlink event.
        const EVENT_UNLINK_DISABLE = 1 << 3;
        /// First append after a replay; restarts the matching sequence.
        const RESTART_SEQ         = 1 << 4;
        /// Entry accepts put operations.
        const OP_PUT              = 1 << 5;
    }
}

/// A single NIC event.
///
/// One flattened record covers the target and initiator event formats; each
/// event type populates the fields it defines and leaves the rest default.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub rc: ReturnCode,
    /// Request id of the owning request (`user_ptr`/`buffer_id`).
    pub buffer_id: u32,
    /// Initiator match id; for rendezvous events, the DFA to pull from.
    pub initiator: u32,
    pub match_bits: MatchBits,
    /// Length requested by the initiator.
    pub rlength: usize,
    /// Length actually delivered (after truncation).
    pub mlength: usize,
    /// Address where data landed; overflow-event correlation key and
    /// multi-receive head.
    pub start: u64,
    /// Initiator-provided offset for the rendezvous get.
    pub remote_offset: u64,
    /// Event belongs to a rendezvous transaction.
    pub rendezvous: bool,
    /// Low command bits of the rendezvous id.
    pub rendezvous_id: u16,
    /// The entry auto-unlinked while delivering this event.
    pub auto_unlinked: bool,
    /// Remote completion-queue data.
    pub header_data: u64,
    pub vni: u16,
    /// List an acked put landed on.
    pub ptl_list: PtlList,
    /// NIC already issued the rendezvous get.
    pub get_issued: bool,
    /// Link events: current LE pool allocation.
    pub lpe_stat_1: u32,
    /// Link events: LE pool reservation.
    pub lpe_stat_2: u32,
    /// State-change events: new portal state.
    pub ptlte_state: PtlteState,
    /// State-change events: disable reason.
    pub sc_reason: Option<DisableReason>,
    /// State change was NIC-initiated.
    pub sc_nic_auto: bool,
}

impl Default for Event {
    fn default() -> Self {
        Self {
            event_type: EventType::Put,
            rc: ReturnCode::Ok,
            buffer_id: 0,
            initiator: 0,
            match_bits: MatchBits::new(),
            rlength: 0,
            mlength: 0,
            start: 0,
            remote_offset: 0,
            rendezvous: false,
            rendezvous_id: 0,
            auto_unlinked: false,
            header_data: 0,
            vni: 0,
            ptl_list: PtlList::Priority,
            get_issued: false,
            lpe_stat_1: 0,
            lpe_stat_2: 0,
            ptlte_state: PtlteState::Enabled,
            sc_reason: None,
            sc_nic_auto: false,
        }
    }
}

impl Event {
    /// Full rendezvous id carried by a target event.
    #[inline]
    pub fn rdzv_id(&self) -> u16 {
        self.match_bits.rdzv_id(self.rendezvous_id)
    }
}

/// Registered-memory descriptor handed back by [`Nic::map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemDesc {
    /// IO virtual address of the region start.
    pub iova: u64,
    /// Logical address context of the registration.
    pub lac: u8,
    pub len: usize,
}

/// Append a match entry to a portal list.
#[derive(Debug, Clone)]
pub struct AppendCmd {
    pub list: PtlList,
    pub buffer_id: u32,
    pub addr: u64,
    pub len: usize,
    pub match_bits: MatchBits,
    pub ignore_bits: MatchBits,
    pub match_id: u32,
    /// Auto-unlink when free space drops below this (managed entries).
    pub min_free: usize,
    pub flags: LeFlags,
}

/// Search (optionally deleting) the unexpected list.
#[derive(Debug, Clone)]
pub struct SearchCmd {
    pub buffer_id: u32,
    pub match_bits: MatchBits,
    pub ignore_bits: MatchBits,
    pub match_id: u32,
    /// SEARCH_AND_DELETE instead of SEARCH.
    pub delete: bool,
    /// Stop at the first match.
    pub use_once: bool,
}

/// Put command; covers inline (IDC), DMA and rendezvous emission.
#[derive(Debug, Clone)]
pub struct PutCmd {
    pub nic: u32,
    pub pid: u32,
    pub pte: TargetPte,
    pub buffer_id: u32,
    pub match_bits: MatchBits,
    pub header_data: u64,
    /// Initiator match id stamped into target events.
    pub initiator: u32,
    /// Source address for DMA and rendezvous puts.
    pub addr: u64,
    pub len: usize,
    /// Rendezvous puts: eager bytes carried with the put.
    pub eager_length: usize,
    /// Rendezvous puts: low id bits; also the offset the target gets with.
    pub rendezvous_id: u16,
    pub remote_offset: u64,
}

/// Pull data from a remote rendezvous source window.
#[derive(Debug, Clone)]
pub struct GetCmd {
    pub nic: u32,
    pub pid: u32,
    pub buffer_id: u32,
    pub match_bits: MatchBits,
    pub local_addr: u64,
    pub remote_offset: u64,
    pub len: usize,
    /// Restricted (non-matching) get; targets the per-lac window.
    pub restricted: bool,
}

/// Portal status snapshot.
#[derive(Debug, Clone, Default)]
pub struct PteStatus {
    /// Puts dropped while the portal was disabled.
    pub drop_count: i64,
    /// Unexpected-list entry count.
    pub ule_count: usize,
}

/// Device command and event surface for one endpoint.
///
/// Implementations queue events internally; the demultiplexer pops one at a
/// time and pushes it back if the handler cannot make progress.
pub trait Nic {
    /// Register memory for device access.
    fn map(&mut self, addr: *const u8, len: usize) -> Result<MemDesc>;

    /// Release a registration.
    fn unmap(&mut self, md: MemDesc);

    fn append_le(&mut self, cmd: AppendCmd) -> Result<()>;

    fn unlink_le(&mut self, list: PtlList, buffer_id: u32) -> Result<()>;

    fn search(&mut self, cmd: SearchCmd) -> Result<()>;

    /// Request an asynchronous portal state change. Completion arrives as a
    /// state-change event; enabling with a stale drop count produces a
    /// disable event with `ReturnCode::NoMatch`.
    fn pte_set_state(&mut self, state: PtlteState, drop_count: i64) -> Result<()>;

    /// Synchronous disabled-to-software-managed transition. Returns
    /// `Error::Again` on a drop-count mismatch.
    fn pte_transition_sm(&mut self, drop_count: i64) -> Result<()>;

    fn pte_status(&mut self) -> PteStatus;

    /// Remote offsets of all unexpected-list entries, in list order.
    fn ule_offsets(&mut self) -> Vec<u64>;

    /// Put with the payload captured inline at emission time.
    fn idc_put(&mut self, cmd: PutCmd, payload: &[u8]) -> Result<()>;

    /// Put reading `addr..addr+len` at delivery time.
    fn dma_put(&mut self, cmd: PutCmd) -> Result<()>;

    /// Rendezvous put: eager head delivered with the put, remainder pulled
    /// by the target.
    fn rdzv_put(&mut self, cmd: PutCmd) -> Result<()>;

    fn dma_get(&mut self, cmd: GetCmd) -> Result<()>;

    /// Emit a fence; later commands order after earlier ones.
    fn fence(&mut self) -> Result<()>;

    /// Ring the command-queue doorbell.
    fn ring(&mut self);

    /// Bind a local portal to the request that handles its events.
    fn bind_portal(&mut self, pte: TargetPte, buffer_id: u32);

    fn pop_event(&mut self) -> Option<Event>;

    /// Re-present an event the handler could not consume.
    fn unpop_event(&mut self, ev: Event);

    /// Event-queue saturation; emitting paths back off when set.
    fn eq_saturated(&self) -> bool;
}

/// Copy between registered regions.
///
/// Stand-in for the device copy interface; both addresses come from live
/// registrations the engine tracks.
#[inline]
pub fn copy_mem(dst: u64, src: u64, len: usize) {
    unsafe {
        std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Command-accepting no-op device for unit tests.

    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub struct NullNic {
        pub events: VecDeque<Event>,
        pub appends: Vec<AppendCmd>,
        pub searches: Vec<SearchCmd>,
        pub puts: Vec<PutCmd>,
        pub gets: Vec<GetCmd>,
        pub state_changes: Vec<(PtlteState, i64)>,
        pub status: PteStatus,
        pub refuse_commands: bool,
        pub saturated: bool,
    }

    impl NullNic {
        fn check(&self) -> Result<()> {
            if self.refuse_commands {
                Err(crate::error::Error::Again)
            } else {
                Ok(())
            }
        }
    }

    impl Nic for NullNic {
        fn map(&mut self, addr: *const u8, len: usize) -> Result<MemDesc> {
            Ok(MemDesc { iova: addr as u64, lac: 0, len })
        }

        fn unmap(&mut self, _md: MemDesc) {}

        fn append_le(&mut self, cmd: AppendCmd) -> Result<()> {
            self.check()?;
            self.appends.push(cmd);
            Ok(())
        }

        fn unlink_le(&mut self, _list: PtlList, _buffer_id: u32) -> Result<()> {
            self.check()
        }

        fn search(&mut self, cmd: SearchCmd) -> Result<()> {
            self.check()?;
            self.searches.push(cmd);
            Ok(())
        }

        fn pte_set_state(&mut self, state: PtlteState, drop_count: i64) -> Result<()> {
            self.check()?;
            self.state_changes.push((state, drop_count));
            Ok(())
        }

        fn pte_transition_sm(&mut self, drop_count: i64) -> Result<()> {
            self.check()?;
            self.state_changes.push((PtlteState::SoftwareManaged, drop_count));
            Ok(())
        }

        fn pte_status(&mut self) -> PteStatus {
            self.status.clone()
        }

        fn ule_offsets(&mut self) -> Vec<u64> {
            Vec::new()
        }

        fn idc_put(&mut self, cmd: PutCmd, _payload: &[u8]) -> Result<()> {
            self.check()?;
            self.puts.push(cmd);
            Ok(())
        }

        fn dma_put(&mut self, cmd: PutCmd) -> Result<()> {
            self.check()?;
            self.puts.push(cmd);
            Ok(())
        }

        fn rdzv_put(&mut self, cmd: PutCmd) -> Result<()> {
            self.check()?;
            self.puts.push(cmd);
            Ok(())
        }

        fn dma_get(&mut self, cmd: GetCmd) -> Result<()> {
            self.check()?;
            self.gets.push(cmd);
            Ok(())
        }

        fn fence(&mut self) -> Result<()> {
            self.check()
        }

        fn ring(&mut self) {}

        fn bind_portal(&mut self, _pte: TargetPte, _buffer_id: u32) {}

        fn pop_event(&mut self) -> Option<Event> {
            self.events.pop_front()
        }

        fn unpop_event(&mut self, ev: Event) {
            self.events.push_front(ev);
        }

        fn eq_saturated(&self) -> bool {
            self.saturated
        }
    }
}
