//! Shared test harness: an in-process software model of the matching NIC.
//!
//! Two endpoints attach to one `SimFabric`; puts, gets and control
//! messages route synchronously between their nodes, generating the same
//! event sequences the hardware would: priority-list matching, overflow
//! landing with unexpected-list entries, rendezvous eager delivery with
//! software-issued pulls, drops and auto-disable under overflow
//! exhaustion, and search / search-and-delete over the unexpected list.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use tagmsg::match_bits::{tag_match, MatchBits};
use tagmsg::{
    AppendCmd, DisableReason, Endpoint, Event, EventType, GetCmd, LeFlags, MemDesc, Nic,
    PtlList, PteStatus, PtlteState, PutCmd, ReturnCode, SearchCmd, TargetPte,
};

pub const PID_BITS: u32 = 9;

type NodeKey = (u32, u32);

/// A priority-list match entry.
struct PrioLe {
    buffer_id: u32,
    addr: u64,
    len: usize,
    used: usize,
    mb: MatchBits,
    ib: MatchBits,
    match_id: u32,
    min_free: usize,
    use_once: bool,
}

/// An overflow- or request-list landing buffer.
struct LandLe {
    list: PtlList,
    buffer_id: u32,
    addr: u64,
    len: usize,
    used: usize,
    min_free: usize,
    linked: bool,
}

/// A hardware unexpected-list entry.
#[derive(Clone)]
struct Ule {
    initiator: u32,
    mb: MatchBits,
    rlength: usize,
    header_data: u64,
    oflow_start: u64,
    mlength: usize,
    rendezvous: bool,
    rendezvous_id: u16,
    /// Source-buffer base; the offset snapshot reports this.
    ule_offset: u64,
    /// Where a software get pulls from (past the eager head).
    remote_offset: u64,
    vni: u16,
}

#[derive(Default)]
struct Node {
    pte_state: Option<PtlteState>,
    drop_count: i64,
    events: VecDeque<Event>,
    priority: Vec<PrioLe>,
    landing: Vec<LandLe>,
    ules: Vec<Ule>,
    portals: HashMap<u8, u32>,
}

impl Node {
    fn push(&mut self, ev: Event) {
        self.events.push_back(ev);
    }
}

/// An incoming put, independent of the command form it left as.
struct PutDesc {
    src_key: NodeKey,
    src_buffer_id: u32,
    initiator: u32,
    mb: MatchBits,
    payload: Vec<u8>,
    rlength: usize,
    header_data: u64,
    rendezvous: bool,
    rendezvous_id: u16,
    /// Source-buffer base address (rendezvous only).
    src_base: u64,
}

#[derive(Default)]
struct Fabric {
    nodes: HashMap<NodeKey, Node>,
}

fn pte_idx(pte: TargetPte) -> u8 {
    match pte {
        TargetPte::Rx => 0,
        TargetPte::RdzvSrc => 1,
        TargetPte::Zbp => 2,
        TargetPte::Ctrl => 3,
    }
}

impl Fabric {
    fn node(&mut self, key: NodeKey) -> &mut Node {
        self.nodes.entry(key).or_default()
    }

    fn ack(&mut self, key: NodeKey, buffer_id: u32, rc: ReturnCode, list: PtlList) {
        self.node(key).push(Event {
            event_type: EventType::Ack,
            rc,
            buffer_id,
            ptl_list: list,
            ..Default::default()
        });
    }

    /// Land a put at a receive portal: priority match, overflow landing, or
    /// drop.
    fn deliver_put(&mut self, target: NodeKey, put: PutDesc) {
        let state = self.node(target).pte_state;

        match state {
            Some(PtlteState::Disabled) | None => {
                self.node(target).drop_count += 1;
                self.ack(put.src_key, put.src_buffer_id, ReturnCode::PtDisabled, PtlList::Priority);
            }
            Some(PtlteState::Enabled) => {
                if !self.try_priority_match(target, &put) {
                    self.land_unexpected(target, put, PtlList::Overflow);
                }
            }
            Some(PtlteState::SoftwareManaged) => {
                self.land_unexpected(target, put, PtlList::Request);
            }
        }
    }

    fn try_priority_match(&mut self, target: NodeKey, put: &PutDesc) -> bool {
        let node = self.nodes.get_mut(&target).unwrap();

        let pos = node.priority.iter().position(|le| {
            tag_match(put.mb, le.mb, le.ib)
                && (le.match_id == u32::MAX || le.match_id == put.initiator)
        });
        let Some(pos) = pos else { return false };

        let le = &mut node.priority[pos];
        let offset = le.used;
        let room = le.len - le.used;
        let deliver = put.payload.len().min(room);
        let dst = le.addr + offset as u64;
        unsafe {
            std::ptr::copy_nonoverlapping(put.payload.as_ptr(), dst as *mut u8, deliver);
        }

        let buffer_id = le.buffer_id;
        let mut auto_unlinked = false;
        if le.use_once {
            node.priority.remove(pos);
        } else {
            // Locally managed entry: consume and maybe auto-unlink.
            let consumed = room.min(put.rlength);
            le.used += consumed;
            if le.len - le.used < le.min_free {
                auto_unlinked = true;
                node.priority.remove(pos);
            }
        }

        node.push(Event {
            event_type: EventType::Put,
            rc: ReturnCode::Ok,
            buffer_id,
            initiator: put.initiator,
            match_bits: put.mb,
            rlength: put.rlength,
            mlength: deliver,
            start: dst,
            rendezvous: put.rendezvous,
            rendezvous_id: put.rendezvous_id,
            auto_unlinked,
            header_data: put.header_data,
            remote_offset: put.src_base + put.payload.len() as u64,
            ..Default::default()
        });

        if put.rendezvous {
            // The matching NIC reports the rendezvous transaction and, in
            // this model, always leaves the pull to software.
            let dfa = put.initiator;
            node.push(Event {
                event_type: EventType::Rendezvous,
                rc: ReturnCode::Ok,
                buffer_id,
                initiator: dfa,
                match_bits: put.mb,
                rlength: put.rlength,
                mlength: deliver,
                start: dst + deliver as u64,
                remote_offset: put.src_base + put.payload.len() as u64,
                rendezvous: true,
                rendezvous_id: put.rendezvous_id,
                get_issued: false,
                ..Default::default()
            });
        }

        self.ack(put.src_key, put.src_buffer_id, ReturnCode::Ok, PtlList::Priority);
        true
    }

    fn land_unexpected(&mut self, target: NodeKey, put: PutDesc, list: PtlList) {
        let node = self.nodes.get_mut(&target).unwrap();
        let need = put.payload.len();

        let pos = node
            .landing
            .iter()
            .position(|le| le.list == list && le.linked && le.len - le.used >= need);
        let Some(pos) = pos else {
            // No landing room: the NIC drops the packet and disables.
            node.pte_state = Some(PtlteState::Disabled);
            node.drop_count += 1;
            let reason = if list == PtlList::Overflow {
                DisableReason::FcNoMatch
            } else {
                DisableReason::FcRequestFull
            };
            node.push(Event {
                event_type: EventType::StateChange,
                ptlte_state: PtlteState::Disabled,
                sc_reason: Some(reason),
                sc_nic_auto: true,
                ..Default::default()
            });
            self.ack(put.src_key, put.src_buffer_id, ReturnCode::PtDisabled, list);
            return;
        };

        let le = &mut node.landing[pos];
        let start = le.addr + le.used as u64;
        unsafe {
            std::ptr::copy_nonoverlapping(put.payload.as_ptr(), start as *mut u8, need);
        }
        le.used += need;

        let mut auto_unlinked = false;
        if le.len - le.used < le.min_free {
            le.linked = false;
            auto_unlinked = true;
        }
        let buffer_id = le.buffer_id;

        node.push(Event {
            event_type: EventType::Put,
            rc: ReturnCode::Ok,
            buffer_id,
            initiator: put.initiator,
            match_bits: put.mb,
            rlength: put.rlength,
            mlength: need,
            start,
            rendezvous: put.rendezvous,
            rendezvous_id: put.rendezvous_id,
            auto_unlinked,
            header_data: put.header_data,
            remote_offset: put.src_base + need as u64,
            ..Default::default()
        });

        // Hardware-managed mode records an unexpected-list entry for later
        // priority appends; software-managed matching happens above us.
        if list == PtlList::Overflow {
            node.ules.push(Ule {
                initiator: put.initiator,
                mb: put.mb,
                rlength: put.rlength,
                header_data: put.header_data,
                oflow_start: start,
                mlength: need,
                rendezvous: put.rendezvous,
                rendezvous_id: put.rendezvous_id,
                ule_offset: put.src_base,
                remote_offset: put.src_base + need as u64,
                vni: 0,
            });
        }

        self.ack(put.src_key, put.src_buffer_id, ReturnCode::Ok, list);
    }

    /// A priority append first matches against the unexpected list.
    fn append_priority(&mut self, target: NodeKey, cmd: AppendCmd) {
        let use_once = cmd.flags.contains(LeFlags::USE_ONCE);
        let want_link_ev = !cmd.flags.contains(LeFlags::EVENT_LINK_DISABLE);
        let node = self.nodes.get_mut(&target).unwrap();

        let mut used = 0usize;
        loop {
            let pos = node.ules.iter().position(|ule| {
                tag_match(ule.mb, cmd.match_bits, cmd.ignore_bits)
                    && (cmd.match_id == u32::MAX || cmd.match_id == ule.initiator)
            });
            let Some(pos) = pos else { break };

            let ule = node.ules.remove(pos);
            let room = cmd.len - used;
            let consumed = room.min(ule.rlength);
            let mut auto_unlinked = false;
            if !use_once && (cmd.len - (used + consumed)) < cmd.min_free {
                auto_unlinked = true;
            }

            node.push(Event {
                event_type: EventType::PutOverflow,
                rc: ReturnCode::Ok,
                buffer_id: cmd.buffer_id,
                initiator: ule.initiator,
                match_bits: ule.mb,
                rlength: ule.rlength,
                mlength: ule.mlength,
                start: ule.oflow_start,
                rendezvous: ule.rendezvous,
                rendezvous_id: ule.rendezvous_id,
                auto_unlinked,
                header_data: ule.header_data,
                vni: ule.vni,
                ..Default::default()
            });

            if ule.rendezvous {
                node.push(Event {
                    event_type: EventType::Rendezvous,
                    rc: ReturnCode::Ok,
                    buffer_id: cmd.buffer_id,
                    initiator: ule.initiator,
                    match_bits: ule.mb,
                    rlength: ule.rlength,
                    mlength: ule.mlength,
                    start: cmd.addr + used as u64 + ule.mlength as u64,
                    remote_offset: ule.remote_offset,
                    rendezvous: true,
                    rendezvous_id: ule.rendezvous_id,
                    get_issued: false,
                    ..Default::default()
                });
            }

            used += consumed;
            if use_once || auto_unlinked {
                return;
            }
        }

        node.priority.push(PrioLe {
            buffer_id: cmd.buffer_id,
            addr: cmd.addr,
            len: cmd.len,
            used,
            mb: cmd.match_bits,
            ib: cmd.ignore_bits,
            match_id: cmd.match_id,
            min_free: cmd.min_free,
            use_once,
        });

        if want_link_ev {
            node.push(Event {
                event_type: EventType::Link,
                rc: ReturnCode::Ok,
                buffer_id: cmd.buffer_id,
                lpe_stat_1: 0,
                lpe_stat_2: u32::MAX,
                ..Default::default()
            });
        }
    }

    fn search(&mut self, target: NodeKey, cmd: SearchCmd) {
        let node = self.nodes.get_mut(&target).unwrap();

        let matches = |ule: &Ule| {
            tag_match(ule.mb, cmd.match_bits, cmd.ignore_bits)
                && (cmd.match_id == u32::MAX || cmd.match_id == ule.initiator)
        };

        if cmd.delete {
            // SEARCH_AND_DELETE: one entry or a sweep.
            if cmd.use_once {
                let pos = node.ules.iter().position(matches);
                match pos {
                    Some(pos) => {
                        let ule = node.ules.remove(pos);
                        node.push(ule_event(EventType::PutOverflow, cmd.buffer_id, &ule));
                    }
                    None => {
                        node.push(Event {
                            event_type: EventType::PutOverflow,
                            rc: ReturnCode::NoMatch,
                            buffer_id: cmd.buffer_id,
                            ..Default::default()
                        });
                    }
                }
                return;
            }

            let swept: Vec<Ule> = {
                let mut kept = Vec::new();
                let mut out = Vec::new();
                for ule in node.ules.drain(..) {
                    if matches(&ule) {
                        out.push(ule);
                    } else {
                        kept.push(ule);
                    }
                }
                node.ules = kept;
                out
            };
            for ule in &swept {
                node.push(ule_event(EventType::PutOverflow, cmd.buffer_id, ule));
            }
            node.push(Event {
                event_type: EventType::Search,
                rc: ReturnCode::Ok,
                buffer_id: cmd.buffer_id,
                ..Default::default()
            });
            return;
        }

        // Plain SEARCH.
        if cmd.use_once {
            let ev = match node.ules.iter().find(|u| matches(u)) {
                Some(ule) => ule_event(EventType::Search, cmd.buffer_id, ule),
                None => Event {
                    event_type: EventType::Search,
                    rc: ReturnCode::NoMatch,
                    buffer_id: cmd.buffer_id,
                    ..Default::default()
                },
            };
            node.push(ev);
            return;
        }

        // Sweep: one success event per matching entry, then a no-match
        // terminator.
        let evs: Vec<Event> = node
            .ules
            .iter()
            .filter(|u| matches(u))
            .map(|u| ule_event(EventType::Search, cmd.buffer_id, u))
            .collect();
        for ev in evs {
            node.push(ev);
        }
        node.push(Event {
            event_type: EventType::Search,
            rc: ReturnCode::NoMatch,
            buffer_id: cmd.buffer_id,
            ..Default::default()
        });
    }
}

fn ule_event(ty: EventType, buffer_id: u32, ule: &Ule) -> Event {
    Event {
        event_type: ty,
        rc: ReturnCode::Ok,
        buffer_id,
        initiator: ule.initiator,
        match_bits: ule.mb,
        rlength: ule.rlength,
        mlength: ule.mlength,
        start: ule.oflow_start,
        rendezvous: ule.rendezvous,
        rendezvous_id: ule.rendezvous_id,
        header_data: ule.header_data,
        vni: ule.vni,
        ..Default::default()
    }
}

/// Fabric handle; hands out per-node device endpoints.
#[derive(Clone, Default)]
pub struct SimFabric {
    inner: Rc<RefCell<Fabric>>,
}

impl SimFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nic(&self, nic: u32, pid: u32) -> Box<SimNic> {
        self.inner.borrow_mut().node((nic, pid));
        Box::new(SimNic {
            fab: self.inner.clone(),
            key: (nic, pid),
        })
    }
}

/// Device endpoint bound to one fabric node.
pub struct SimNic {
    fab: Rc<RefCell<Fabric>>,
    key: NodeKey,
}

impl Nic for SimNic {
    fn map(&mut self, addr: *const u8, len: usize) -> tagmsg::Result<MemDesc> {
        Ok(MemDesc { iova: addr as u64, lac: 0, len })
    }

    fn unmap(&mut self, _md: MemDesc) {}

    fn append_le(&mut self, cmd: AppendCmd) -> tagmsg::Result<()> {
        let mut fab = self.fab.borrow_mut();
        match cmd.list {
            PtlList::Priority => fab.append_priority(self.key, cmd),
            PtlList::Overflow | PtlList::Request => {
                fab.node(self.key).landing.push(LandLe {
                    list: cmd.list,
                    buffer_id: cmd.buffer_id,
                    addr: cmd.addr,
                    len: cmd.len,
                    used: 0,
                    min_free: cmd.min_free,
                    linked: true,
                });
            }
            PtlList::Unexpected => unreachable!("appends never target the unexpected list"),
        }
        Ok(())
    }

    fn unlink_le(&mut self, list: PtlList, buffer_id: u32) -> tagmsg::Result<()> {
        let mut fab = self.fab.borrow_mut();
        let node = fab.node(self.key);
        match list {
            PtlList::Priority => {
                node.priority.retain(|le| le.buffer_id != buffer_id);
            }
            _ => {
                node.landing.retain(|le| le.buffer_id != buffer_id);
            }
        }
        node.push(Event {
            event_type: EventType::Unlink,
            rc: ReturnCode::Ok,
            buffer_id,
            auto_unlinked: false,
            ..Default::default()
        });
        Ok(())
    }

    fn search(&mut self, cmd: SearchCmd) -> tagmsg::Result<()> {
        self.fab.borrow_mut().search(self.key, cmd);
        Ok(())
    }

    fn pte_set_state(&mut self, state: PtlteState, drop_count: i64) -> tagmsg::Result<()> {
        let mut fab = self.fab.borrow_mut();
        let node = fab.node(self.key);
        match state {
            PtlteState::Enabled => {
                if node.drop_count != drop_count {
                    node.push(Event {
                        event_type: EventType::StateChange,
                        ptlte_state: PtlteState::Disabled,
                        rc: ReturnCode::NoMatch,
                        sc_nic_auto: false,
                        ..Default::default()
                    });
                    return Ok(());
                }
                node.pte_state = Some(PtlteState::Enabled);
                node.drop_count = 0;
                node.push(Event {
                    event_type: EventType::StateChange,
                    ptlte_state: PtlteState::Enabled,
                    ..Default::default()
                });
            }
            PtlteState::Disabled => {
                node.pte_state = Some(PtlteState::Disabled);
                node.push(Event {
                    event_type: EventType::StateChange,
                    ptlte_state: PtlteState::Disabled,
                    sc_reason: Some(DisableReason::SoftwareInitiated),
                    sc_nic_auto: false,
                    ..Default::default()
                });
            }
            PtlteState::SoftwareManaged => {
                node.pte_state = Some(PtlteState::SoftwareManaged);
                node.push(Event {
                    event_type: EventType::StateChange,
                    ptlte_state: PtlteState::SoftwareManaged,
                    sc_reason: Some(DisableReason::SoftwareInitiated),
                    sc_nic_auto: false,
                    ..Default::default()
                });
            }
        }
        Ok(())
    }

    fn pte_transition_sm(&mut self, drop_count: i64) -> tagmsg::Result<()> {
        let mut fab = self.fab.borrow_mut();
        let node = fab.node(self.key);
        if node.drop_count != drop_count {
            return Err(tagmsg::Error::Again);
        }
        node.pte_state = Some(PtlteState::SoftwareManaged);
        node.drop_count = 0;
        Ok(())
    }

    fn pte_status(&mut self) -> PteStatus {
        let mut fab = self.fab.borrow_mut();
        let node = fab.node(self.key);
        PteStatus {
            drop_count: node.drop_count,
            ule_count: node.ules.len(),
        }
    }

    fn ule_offsets(&mut self) -> Vec<u64> {
        let mut fab = self.fab.borrow_mut();
        fab.node(self.key).ules.iter().map(|u| u.ule_offset).collect()
    }

    fn idc_put(&mut self, cmd: PutCmd, payload: &[u8]) -> tagmsg::Result<()> {
        self.put(cmd, payload.to_vec(), false)
    }

    fn dma_put(&mut self, cmd: PutCmd) -> tagmsg::Result<()> {
        let payload = if cmd.len > 0 {
            unsafe { std::slice::from_raw_parts(cmd.addr as *const u8, cmd.len) }.to_vec()
        } else {
            Vec::new()
        };
        self.put(cmd, payload, false)
    }

    fn rdzv_put(&mut self, cmd: PutCmd) -> tagmsg::Result<()> {
        let eager =
            unsafe { std::slice::from_raw_parts(cmd.addr as *const u8, cmd.eager_length) }
                .to_vec();
        self.put(cmd, eager, true)
    }

    fn dma_get(&mut self, cmd: GetCmd) -> tagmsg::Result<()> {
        let mut fab = self.fab.borrow_mut();

        // Pull from the remote process; the fabric shares this address
        // space, so the remote offset is readable directly.
        if cmd.len > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    cmd.remote_offset as *const u8,
                    cmd.local_addr as *mut u8,
                    cmd.len,
                );
            }
        }

        // Completion on the issuer.
        fab.node(self.key).push(Event {
            event_type: EventType::Reply,
            rc: ReturnCode::Ok,
            buffer_id: cmd.buffer_id,
            rendezvous: false,
            ..Default::default()
        });

        // Matching gets generate a source-side Get event; restricted gets
        // do not, which is what the done-notify covers.
        if !cmd.restricted {
            let src = (cmd.nic, cmd.pid);
            let node = fab.node(src);
            if let Some(&portal) = node.portals.get(&pte_idx(TargetPte::RdzvSrc)) {
                node.push(Event {
                    event_type: EventType::Get,
                    rc: ReturnCode::Ok,
                    buffer_id: portal,
                    match_bits: cmd.match_bits,
                    ..Default::default()
                });
            }
        }
        Ok(())
    }

    fn fence(&mut self) -> tagmsg::Result<()> {
        Ok(())
    }

    fn ring(&mut self) {}

    fn bind_portal(&mut self, pte: TargetPte, buffer_id: u32) {
        self.fab
            .borrow_mut()
            .node(self.key)
            .portals
            .insert(pte_idx(pte), buffer_id);
    }

    fn pop_event(&mut self) -> Option<Event> {
        self.fab.borrow_mut().node(self.key).events.pop_front()
    }

    fn unpop_event(&mut self, ev: Event) {
        self.fab.borrow_mut().node(self.key).events.push_front(ev);
    }

    fn eq_saturated(&self) -> bool {
        false
    }
}

impl SimNic {
    fn put(&mut self, cmd: PutCmd, payload: Vec<u8>, rendezvous: bool) -> tagmsg::Result<()> {
        let target = (cmd.nic, cmd.pid);
        let mut fab = self.fab.borrow_mut();

        match cmd.pte {
            TargetPte::Rx => {
                let desc = PutDesc {
                    src_key: self.key,
                    src_buffer_id: cmd.buffer_id,
                    initiator: cmd.initiator,
                    mb: cmd.match_bits,
                    rlength: if rendezvous { cmd.len } else { payload.len() },
                    payload,
                    header_data: cmd.header_data,
                    rendezvous,
                    rendezvous_id: cmd.rendezvous_id,
                    src_base: cmd.remote_offset,
                };
                fab.deliver_put(target, desc);
            }
            TargetPte::Zbp | TargetPte::Ctrl => {
                let node = fab.node(target);
                if let Some(&portal) = node.portals.get(&pte_idx(cmd.pte)) {
                    node.push(Event {
                        event_type: EventType::Put,
                        rc: ReturnCode::Ok,
                        buffer_id: portal,
                        initiator: cmd.initiator,
                        match_bits: cmd.match_bits,
                        ..Default::default()
                    });
                }
                fab.ack(self.key, cmd.buffer_id, ReturnCode::Ok, PtlList::Priority);
            }
            TargetPte::RdzvSrc => unreachable!("puts never target the source window"),
        }
        Ok(())
    }
}

/// Drive both endpoints until `done` or an iteration cap.
pub fn drive(a: &Endpoint, b: &Endpoint, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..10_000 {
        a.progress();
        b.progress();
        if done() {
            return true;
        }
    }
    false
}

/// Deterministic payload for large-transfer checks.
pub fn patterned(len: usize, seed: u64) -> Vec<u8> {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}
