//! Receive request engine.
//!
//! Posted receives are matched against unexpected sends in software first,
//! then appended to the NIC priority list when matching is offloaded, or
//! queued on the software receive queue when it is not. Unexpected
//! deliveries arrive as Put / Put-Overflow event pairs correlated through
//! the deferred-event table; both halves in hand, the payload is copied out
//! of the overflow buffer and the receive completes. Large sends complete
//! through the rendezvous coordinator.

use std::collections::HashMap;

use log::{debug, warn};

use crate::addr::{self, AddressVector, FabAddr, FI_ADDR_NOTAVAIL, FI_ADDR_UNSPEC, MATCH_ID_ANY};
use crate::config::{MatchMode, MsgConfig};
use crate::cq::{CompErr, CompKind, Completion, CompQueue, Counter};
use crate::defer::DeferredEvents;
use crate::ep::Ep;
use crate::error::{fatal, Error, Result};
use crate::fc::{self, FcStats, RxState};
use crate::match_bits::{self, MatchBits};
use crate::nic::{
    copy_mem, AppendCmd, Event, EventType, LeFlags, Nic, PtlList, ReturnCode, SearchCmd,
};
use crate::oflow::{OflowAttr, OflowPool};
use crate::rdzv;
use crate::req::{MsgFlags, RecvReq, ReqCallback, ReqId, ReqState};

/// An onloaded unexpected send: the Put event plus the buffer request that
/// still owns the payload bytes.
#[derive(Debug)]
pub struct UxSend {
    pub ux_id: u64,
    /// Reserved by a peek-with-claim.
    pub claimed: bool,
    /// Overflow/request-list buffer request owning the payload; None for
    /// zero-byte sends.
    pub req: Option<ReqId>,
    pub put_ev: Event,
}

/// Receive-side context.
pub struct RxCtx {
    pub state: RxState,
    pub prev_state: RxState,
    pub new_state: RxState,
    pub msg_offload: bool,
    pub drop_count: i64,
    pub fc_reason: Option<crate::nic::DisableReason>,
    /// Onloaded unexpected sends, in arrival order.
    pub sw_ux_list: Vec<UxSend>,
    /// Unexpected sends received while transitioning to software managed.
    pub sw_pending_ux_list: Vec<UxSend>,
    /// Software-matched receive queue (FIFO), software managed mode.
    pub sw_recv_queue: Vec<ReqId>,
    /// Receives whose appends were dropped, awaiting replay.
    pub replay_queue: Vec<ReqId>,
    /// Peers that reported drops, awaiting resume.
    pub fc_drops: Vec<crate::fc::FcDrops>,
    pub deferred: DeferredEvents,
    pub oflow_pool: OflowPool,
    /// Request-list buffers for software managed matching.
    pub req_pool: OflowPool,
    /// Snapshot of unexpected-entry remote offsets taken before onload.
    pub ule_offsets: Vec<u64>,
    pub cur_ule_offsets: usize,
    /// Live receive requests.
    pub orx_reqs: usize,
    /// Outstanding hardware unexpected-list entries.
    pub orx_hw_ule_cnt: i64,
    /// Software-issued rendezvous gets in flight (TX credits).
    pub orx_tx_reqs: usize,
    pub max_tx: usize,
    pub min_multi_recv: usize,
    pub hw_claim_in_progress: bool,
    /// Appends since the last LE-usage check.
    pub recv_appends: u32,
    ux_seq: u64,
    /// Claimed unexpected sends keyed by peek context.
    pub claimed_ux: HashMap<u64, u64>,
    pub stats: FcStats,
    pub cq: CompQueue,
    pub cntr: Counter,
}

impl RxCtx {
    pub fn new(cfg: &MsgConfig) -> Self {
        let offload = cfg.msg_offload && cfg.rx_match_mode != MatchMode::Software;
        Self {
            state: RxState::Disabled,
            prev_state: RxState::Disabled,
            new_state: RxState::Disabled,
            msg_offload: offload,
            drop_count: cfg.initial_drop_count() as i64,
            fc_reason: None,
            sw_ux_list: Vec::new(),
            sw_pending_ux_list: Vec::new(),
            sw_recv_queue: Vec::new(),
            replay_queue: Vec::new(),
            fc_drops: Vec::new(),
            deferred: DeferredEvents::new(),
            oflow_pool: OflowPool::new(OflowAttr {
                list: PtlList::Overflow,
                buf_size: cfg.oflow_buf_size,
                min_posted: cfg.oflow_buf_min_posted,
                max_cached: cfg.oflow_buf_max_cached,
                min_free: cfg.rdzv_eager_size.max(cfg.rdzv_threshold),
            }),
            req_pool: OflowPool::new(OflowAttr {
                list: PtlList::Request,
                buf_size: cfg.req_buf_size,
                min_posted: cfg.oflow_buf_min_posted,
                max_cached: cfg.oflow_buf_max_cached,
                min_free: cfg.rdzv_eager_size.max(cfg.rdzv_threshold),
            }),
            ule_offsets: Vec::new(),
            cur_ule_offsets: 0,
            orx_reqs: 0,
            orx_hw_ule_cnt: 0,
            orx_tx_reqs: 0,
            max_tx: cfg.max_rx_tx_credits,
            min_multi_recv: cfg.min_multi_recv,
            hw_claim_in_progress: false,
            recv_appends: 0,
            ux_seq: 0,
            claimed_ux: HashMap::new(),
            stats: FcStats::default(),
            cq: CompQueue::new(),
            cntr: Counter::new(),
        }
    }

    pub fn next_ux_id(&mut self) -> u64 {
        self.ux_seq += 1;
        self.ux_seq
    }
}

/// Allocate a receive request, mapping the buffer when present.
pub(crate) fn recv_req_alloc(ep: &mut Ep, buf: u64, len: usize) -> Result<ReqId> {
    let md = if len > 0 {
        Some(ep.nic.map(buf as *const u8, len)?)
    } else {
        None
    };

    let id = ep.reqs.alloc(ReqCallback::Recv, ReqState::Recv(RecvReq::new(buf, len, md)));
    ep.rx.orx_reqs += 1;
    Ok(id)
}

/// Free a receive request and its registration.
pub(crate) fn recv_req_free(ep: &mut Ep, id: ReqId) {
    let req = ep.reqs.free(id);
    let recv = match req.state {
        ReqState::Recv(r) => r,
        _ => fatal!("request {} is not a receive", id),
    };
    debug_assert!(recv.children.is_empty());

    ep.rx.orx_reqs -= 1;
    if let Some(md) = recv.recv_md {
        ep.nic.unmap(md);
    }
}

/// Free a multi-receive child; the parent is freed here when its unlink
/// condition already fired and this was the last outstanding child.
pub(crate) fn free_child(ep: &mut Ep, child_id: ReqId) {
    let req = ep.reqs.free(child_id);
    let parent_id = match &req.state {
        ReqState::Recv(r) => r.parent,
        _ => fatal!("request {} is not a receive", child_id),
    };

    let Some(parent_id) = parent_id else { return };
    let parent = ep.reqs.get_mut(parent_id).expect("live parent").recv_mut();
    parent.children.retain(|&id| id != child_id);
    if parent.children.is_empty() && parent.parent_free_pending {
        debug!("rx: freeing parent {} after last child", parent_id);
        recv_req_free(ep, parent_id);
    }
}

/// Duplicate a multi-receive parent into a child covering one match.
pub(crate) fn mrecv_dup(ep: &mut Ep, parent_id: ReqId) -> ReqId {
    let (cb, context, flags, parent_recv) = {
        let parent = ep.reqs.get(parent_id).expect("live parent");
        let r = parent.recv();
        let mut dup = RecvReq::new(r.recv_buf, r.ulen, None);
        dup.tag = r.tag;
        dup.ignore = r.ignore;
        dup.match_id = r.match_id;
        dup.tagged = r.tagged;
        dup.multi_recv = r.multi_recv;
        dup.parent = Some(parent_id);
        (parent.cb, parent.context, parent.flags, dup)
    };

    let child_id = ep.reqs.alloc(cb, ReqState::Recv(parent_recv));
    {
        let child = ep.reqs.get_mut(child_id).unwrap();
        child.context = context;
        child.flags = flags;
    }
    ep.reqs.get_mut(parent_id).unwrap().recv_mut().children.push(child_id);
    child_id
}

/// Consume bytes of a multi-receive buffer, clamped to the space left.
///
/// Put-Overflow events on the priority list arrive in append order; this is
/// the only ordering the offset computation relies on.
pub(crate) fn mrecv_put_bytes(ep: &mut Ep, req_id: ReqId, rlen: usize) -> usize {
    let recv = ep.reqs.get_mut(req_id).unwrap().recv_mut();
    let remaining = recv.ulen - recv.start_offset;
    let len = remaining.min(rlen);
    recv.start_offset += len;
    len
}

/// Translate the recorded initiator into the (nic, pid) a software
/// rendezvous get must target.
pub(crate) fn set_rget_info(ep: &mut Ep, req_id: ReqId) {
    let initiator = ep.reqs.get(req_id).unwrap().recv().initiator;
    let pid_bits = ep.pid_bits;

    let nic = if ep.av.symmetric() {
        let fi_addr = addr::match_id_ep(pid_bits, initiator) as u64;
        match ep.av.lookup_addr(fi_addr) {
            Some(caddr) => caddr.nic,
            None => fatal!("rx: failed to look up fabric address {:#x}", fi_addr),
        }
    } else {
        addr::match_id_ep(pid_bits, initiator)
    };

    let recv = ep.reqs.get_mut(req_id).unwrap().recv_mut();
    recv.rget_nic = nic;
    recv.rget_pid = addr::match_id_pid(pid_bits, initiator);
}

/// Populate receive-request fields common to all target event types.
pub(crate) fn recv_req_tgt_event(ep: &mut Ep, req_id: ReqId, ev: &Event) {
    debug_assert!(matches!(
        ev.event_type,
        EventType::Put | EventType::PutOverflow | EventType::Rendezvous | EventType::Search
    ));
    let pid_bits = ep.pid_bits;
    let req = ep.reqs.get_mut(req_id).unwrap();
    let mb = ev.match_bits;

    // Rendezvous events carry protocol match bits and a DFA initiator.
    if ev.event_type != EventType::Rendezvous {
        req.tag = mb.tag();
        req.recv_mut().initiator = ev.initiator;
        if mb.cq_data() {
            req.flags |= MsgFlags::REMOTE_CQ_DATA;
        }
    }

    // Overflow events do not provide the remote offset.
    if ev.event_type != EventType::PutOverflow {
        req.recv_mut().src_offset = ev.remote_offset;
    }

    if ev.event_type == EventType::Rendezvous {
        let init = addr::dfa_to_init(ev.initiator, pid_bits);
        let recv = req.recv_mut();
        recv.rget_nic = addr::match_id_ep(pid_bits, init);
        recv.rget_pid = addr::match_id_pid(pid_bits, init);
    }

    // One event suffices for the remaining fields.
    if req.recv().tgt_event {
        return;
    }

    req.data = ev.header_data;
    let recv = req.recv_mut();
    recv.tgt_event = true;
    recv.vni = ev.vni;
    recv.rlen = ev.rlength;
    recv.rc = ev.rc;
    if ev.rendezvous {
        recv.rdzv_id = ev.rdzv_id();
    } else {
        recv.oflow_start = ev.start;
    }
    recv.rdzv_lac = mb.rdzv_lac();
    recv.rdzv_proto = mb.rdzv_proto();
    recv.rdzv_mlen = ev.mlength;
}

/// Source fabric address for a completion, when reporting is enabled.
fn recv_req_src_addr(ep: &Ep, req_id: ReqId) -> u64 {
    if !ep.cfg.source {
        return FI_ADDR_NOTAVAIL;
    }

    let recv = ep.reqs.get(req_id).unwrap().recv();
    if ep.av.symmetric() {
        return addr::match_id_ep(ep.pid_bits, recv.initiator) as u64;
    }

    let caddr = FabAddr {
        nic: addr::match_id_ep(ep.pid_bits, recv.initiator),
        pid: addr::match_id_pid(ep.pid_bits, recv.initiator),
        vni: recv.vni,
    };
    ep.av.lookup_fi_addr(caddr).unwrap_or(FI_ADDR_NOTAVAIL)
}

/// Report completion of a receive operation.
pub(crate) fn report_recv(ep: &mut Ep, req_id: ReqId) {
    let (parent_id, data_len, rlen, rc, unlinked, multi_recv, peek, canceled) = {
        let req = ep.reqs.get(req_id).unwrap();
        let r = req.recv();
        (
            r.parent,
            req.data_len,
            r.rlen,
            r.rc,
            r.unlinked,
            r.multi_recv,
            req.flags.contains(MsgFlags::PEEK),
            r.canceled,
        )
    };

    // data_len (delivered) never exceeds rlen (requested).
    debug_assert!(rlen >= data_len || peek);
    let truncated = rlen.saturating_sub(data_len);

    let mut comp_flags = ep.reqs.get(req_id).unwrap().flags
        & (MsgFlags::MSG | MsgFlags::TAGGED | MsgFlags::RECV | MsgFlags::REMOTE_CQ_DATA);
    let success_event = ep.reqs.get(req_id).unwrap().flags.contains(MsgFlags::COMPLETION);

    // Multi-receive accounting and the parent unlink decision.
    if let Some(parent_id) = parent_id {
        let min_multi_recv = ep.rx.min_multi_recv;
        let parent = ep.reqs.get_mut(parent_id).unwrap().recv_mut();
        parent.mrecv_bytes += data_len;

        let exhausted = if parent.hw_offloaded {
            parent.auto_unlinked && parent.mrecv_bytes == parent.mrecv_unlink_bytes
        } else {
            (parent.ulen - parent.mrecv_bytes) < min_multi_recv
        };

        if exhausted && !parent.parent_free_pending {
            // The parent frees when its last child completes.
            parent.parent_free_pending = true;
            comp_flags |= MsgFlags::MULTI_RECV;
            debug!("rx: parent {} exhausted ({} bytes consumed)", parent_id, parent.mrecv_bytes);
        }
    }

    let req = ep.reqs.get(req_id).unwrap();
    let base = Completion {
        context: req.context,
        flags: comp_flags,
        len: req.data_len,
        buf: req.buf,
        data: req.data,
        tag: req.tag,
        src_addr: FI_ADDR_NOTAVAIL,
        err: None,
    };

    if rc == ReturnCode::Ok && truncated == 0 {
        if success_event {
            let src_addr = recv_req_src_addr(ep, req_id);
            let mut comp = base;
            if ep.cfg.source && src_addr == FI_ADDR_NOTAVAIL && ep.cfg.source_err {
                let recv = ep.reqs.get(req_id).unwrap().recv();
                comp.err = Some(CompErr {
                    kind: CompKind::AddrNotAvail,
                    olen: 0,
                    rc,
                    addr: Some(FabAddr {
                        nic: addr::match_id_ep(ep.pid_bits, recv.initiator),
                        pid: addr::match_id_pid(ep.pid_bits, recv.initiator),
                        vni: recv.vni,
                    }),
                });
            } else {
                comp.src_addr = src_addr;
            }
            ep.rx.cq.push(comp);
        }
        ep.rx.cntr.add(false);
        return;
    }

    let kind = if unlinked || canceled {
        if multi_recv {
            // A canceled multi-receive reports the buffer released.
        }
        CompKind::Canceled
    } else if truncated > 0 {
        CompKind::Truncated
    } else if peek {
        CompKind::NoMsg
    } else {
        warn!("rx: request {} error rc={:?}", req_id, rc);
        CompKind::Provider(rc)
    };

    let mut comp = base;
    if kind == CompKind::Canceled && multi_recv {
        comp.flags |= MsgFlags::MULTI_RECV;
    }
    if kind == CompKind::NoMsg {
        comp.len = 0;
    }
    comp.err = Some(CompErr { kind, olen: truncated, rc, addr: None });
    ep.rx.cq.push(comp);
    ep.rx.cntr.add(true);
}

/// Finish the request after a completion report: multi-receive children go
/// back to the table only, singletons release their registration.
pub(crate) fn report_and_free(ep: &mut Ep, req_id: ReqId) {
    report_recv(ep, req_id);
    let is_child = ep.reqs.get(req_id).unwrap().recv().parent.is_some();
    if is_child {
        free_child(ep, req_id);
    } else {
        recv_req_free(ep, req_id);
    }
}

/// Free a parent whose entry came off the list, deferring while children
/// are still outstanding.
fn finalize_parent(ep: &mut Ep, req_id: ReqId) {
    let recv = ep.reqs.get_mut(req_id).unwrap().recv_mut();
    if recv.children.is_empty() {
        recv_req_free(ep, req_id);
    } else {
        recv.parent_free_pending = true;
    }
}

/// Notify the initiator of a send that the match is complete.
///
/// The transaction id from the send's match bits goes back in a zero-byte
/// put; the receive completion is deferred until that put is acknowledged.
pub(crate) fn notify_match(ep: &mut Ep, req_id: ReqId, ev: &Event) -> Result<()> {
    let initiator = ev.initiator;
    let nic = addr::match_id_ep(ep.pid_bits, initiator);
    let pid = addr::match_id_pid(ep.pid_bits, initiator);

    let mut mb = MatchBits::new();
    mb.set_le_type(match_bits::LeType::Zbp);
    mb.set_tx_id(ev.match_bits.tx_id());

    let cmd = crate::nic::PutCmd {
        nic,
        pid,
        pte: crate::nic::TargetPte::Zbp,
        buffer_id: req_id,
        match_bits: mb,
        header_data: 0,
        initiator: ep.msg_match_id(),
        addr: 0,
        len: 0,
        eager_length: 0,
        rendezvous_id: 0,
        remote_offset: 0,
    };

    ep.nic.idc_put(cmd, &[])?;
    ep.nic.ring();

    ep.reqs.get_mut(req_id).unwrap().cb = ReqCallback::NotifyMatch;
    debug!("rx: queued match-complete notify for {}", req_id);
    Ok(())
}

/// Acknowledgement of a match-complete notify: report the receive.
pub(crate) fn notify_match_cb(ep: &mut Ep, req_id: ReqId, ev: &Event) -> Result<()> {
    if ev.event_type != EventType::Ack {
        fatal!("rx: unexpected {:?} event on notify request {}", ev.event_type, req_id);
    }
    debug!("rx: match complete for {}", req_id);
    report_and_free(ep, req_id);
    Ok(())
}

/// Progress an unexpected send once both the Put and Put-Overflow halves
/// are in hand.
///
/// `ux_req` is the overflow/request-list buffer request holding the payload
/// bytes; `remove_recv_entry` dequeues the parent from the software receive
/// queue on success.
pub(crate) fn ux_send(
    ep: &mut Ep,
    match_req_id: ReqId,
    ux_req: Option<ReqId>,
    put_ev: &Event,
    mrecv_start: usize,
    mrecv_len: usize,
    remove_recv_entry: bool,
) -> Result<()> {
    let parent_id = match_req_id;
    let multi_recv = ep.reqs.get(match_req_id).unwrap().recv().multi_recv;

    let req_id = if multi_recv {
        let child = if put_ev.rendezvous {
            rdzv::mrecv_req_event(ep, match_req_id, put_ev).ok_or(Error::Again)?
        } else {
            mrecv_dup(ep, match_req_id)
        };

        let parent_buf = ep.reqs.get(parent_id).unwrap().recv().recv_buf;
        let req = ep.reqs.get_mut(child).unwrap();
        let recv = req.recv_mut();
        recv.recv_buf = parent_buf + mrecv_start as u64;
        let buf = recv.recv_buf;
        req.buf = buf;
        req.data_len = put_ev.rlength.min(mrecv_len);
        child
    } else {
        let req = ep.reqs.get_mut(match_req_id).unwrap();
        req.data_len = put_ev.rlength.min(req.recv().ulen);
        match_req_id
    };

    recv_req_tgt_event(ep, req_id, put_ev);

    // Copy the eager bytes out of the landing buffer.
    let (dst, data_len) = {
        let req = ep.reqs.get(req_id).unwrap();
        (req.recv().recv_buf, req.data_len)
    };
    let oflow_bytes = put_ev.mlength.min(data_len);
    if oflow_bytes > 0 {
        copy_mem(dst, put_ev.start, oflow_bytes);
    }

    if let Some(oflow_req) = ux_req {
        let (buf_index, list) = {
            let o = ep.reqs.get(oflow_req).unwrap().oflow();
            (o.buf_index, o.list)
        };
        let (nic, reqs) = (&mut ep.nic, &mut ep.reqs);
        let pool = if list == PtlList::Overflow {
            &mut ep.rx.oflow_pool
        } else {
            &mut ep.rx.req_pool
        };
        pool.put_bytes(buf_index, put_ev.mlength, nic.as_mut(), reqs);
    }

    // Unexpected rendezvous continues through the coordinator once the
    // pull completes.
    if put_ev.rendezvous {
        if remove_recv_entry {
            dequeue_sw_recv(ep, parent_id);
        }
        rdzv::recv_req_event(ep, req_id, put_ev.event_type);
        return Ok(());
    }

    if put_ev.match_bits.match_comp() {
        if let Err(e) = notify_match(ep, req_id, put_ev) {
            if multi_recv {
                free_child(ep, req_id);
            }
            return Err(e);
        }
        if remove_recv_entry {
            dequeue_sw_recv(ep, parent_id);
        }
        return Ok(());
    }

    if remove_recv_entry {
        dequeue_sw_recv(ep, parent_id);
    }

    report_and_free(ep, req_id);
    Ok(())
}

/// Zero-byte variant: only the overflow-side event exists and no bytes move.
pub(crate) fn ux_send_zb(
    ep: &mut Ep,
    match_req_id: ReqId,
    oflow_ev: &Event,
    mrecv_start: usize,
    remove_recv_entry: bool,
) -> Result<()> {
    debug_assert_eq!(oflow_ev.rlength, 0);
    let parent_id = match_req_id;
    let multi_recv = ep.reqs.get(match_req_id).unwrap().recv().multi_recv;

    let req_id = if multi_recv {
        let child = mrecv_dup(ep, match_req_id);
        let parent_buf = ep.reqs.get(parent_id).unwrap().recv().recv_buf;
        let req = ep.reqs.get_mut(child).unwrap();
        req.buf = parent_buf + mrecv_start as u64;
        child
    } else {
        match_req_id
    };

    recv_req_tgt_event(ep, req_id, oflow_ev);
    ep.reqs.get_mut(req_id).unwrap().data_len = 0;

    if oflow_ev.match_bits.match_comp() {
        if let Err(e) = notify_match(ep, req_id, oflow_ev) {
            if multi_recv {
                free_child(ep, req_id);
            }
            return Err(e);
        }
        if remove_recv_entry {
            dequeue_sw_recv(ep, parent_id);
        }
        return Ok(());
    }

    if remove_recv_entry {
        dequeue_sw_recv(ep, parent_id);
    }
    report_and_free(ep, req_id);
    Ok(())
}

fn dequeue_sw_recv(ep: &mut Ep, req_id: ReqId) {
    ep.rx.sw_recv_queue.retain(|&id| id != req_id);
    ep.reqs.get_mut(req_id).unwrap().recv_mut().software_list = false;
}

/// Peek completed; report and release the request.
pub(crate) fn recv_req_peek_complete(ep: &mut Ep, req_id: ReqId, ux_id: Option<u64>) {
    let req = ep.reqs.get_mut(req_id).unwrap();
    if req.recv().rc != ReturnCode::Ok {
        // No match: hand the original tag back in the completion.
        req.tag = req.recv().tag;
    } else if req.flags.contains(MsgFlags::CLAIM) {
        let context = req.context;
        if let Some(ux_id) = ux_id {
            ep.rx.claimed_ux.insert(context, ux_id);
        }
    }

    // Peeks deliver no data; suppress truncation processing.
    let req = ep.reqs.get_mut(req_id).unwrap();
    req.data_len = req.recv().rlen;

    report_recv(ep, req_id);
    recv_req_free(ep, req_id);
}

/// Handle a Put event on an overflow buffer.
///
/// Pair it with the Put-Overflow side through the deferred table; a record
/// carrying an onloaded unexpected send instead completes that record.
fn oflow_process_put_event(ep: &mut Ep, req_id: ReqId, ev: &Event) -> Result<()> {
    let (matched, handle) = ep.rx.deferred.match_put_event(req_id, ev);
    if !matched {
        return Ok(());
    }

    debug!("rx: overflow event paired for req {}", ev.buffer_id);
    let def_req = ep.rx.deferred.get_mut(handle).req;
    let ux_id = ep.rx.deferred.get_mut(handle).ux_id;

    if let Some(ux_id) = ux_id {
        // The overflow side was onloaded before this Put arrived.
        ep.rx.deferred.remove(handle);
        let claimed = {
            let ux = find_ux_mut(ep, ux_id).expect("live onloaded ux");
            // Keep the remote offset absorbed from the pre-onload snapshot;
            // the raw event's offset no longer drives software gets.
            let fixed_offset = ux.put_ev.remote_offset;
            ux.req = Some(req_id);
            ux.put_ev = ev.clone();
            ux.put_ev.remote_offset = fixed_offset;
            ux.claimed
        };

        if claimed {
            let save_req = def_req;
            recv_req_tgt_event(ep, save_req, ev);
            recv_req_peek_complete(ep, save_req, Some(ux_id));
            debug!("rx: claim put complete for req {}", save_req);
            return Ok(());
        }

        let search = ep.reqs.get_mut(def_req).unwrap().search_mut();
        search.puts_pending -= 1;
        let complete = search.puts_pending == 0 && search.complete;
        if complete {
            fc::ux_onload_complete(ep, def_req);
        }
        return Ok(());
    }

    let def_ev = ep.rx.deferred.get_mut(handle);
    let (mrecv_start, mrecv_len) = (def_ev.mrecv_start, def_ev.mrecv_len);
    match ux_send(ep, def_req, Some(req_id), ev, mrecv_start, mrecv_len, false) {
        Ok(()) => {
            ep.rx.deferred.remove(handle);
            Ok(())
        }
        Err(_) => Err(Error::Again),
    }
}

pub(crate) fn find_ux_mut(ep: &mut Ep, ux_id: u64) -> Option<&mut UxSend> {
    ep.rx
        .sw_ux_list
        .iter_mut()
        .chain(ep.rx.sw_pending_ux_list.iter_mut())
        .find(|ux| ux.ux_id == ux_id)
}

/// Overflow-list buffer event callback.
pub(crate) fn oflow_cb(ep: &mut Ep, req_id: ReqId, ev: &Event) -> Result<()> {
    let buf_index = ep.reqs.get(req_id).unwrap().oflow().buf_index;

    match ev.event_type {
        EventType::Link => {
            if ev.rc == ReturnCode::Ok {
                if !ep.cfg.hybrid_preemptive {
                    return Ok(());
                }
                if fc::check_le_usage_hybrid_preempt(ep, ev) {
                    warn!("rx: forced preemptive switch to software matching");
                }
                return Ok(());
            }

            if ev.rc != ReturnCode::NoSpace {
                fatal!("rx: unexpected overflow link status {:?}", ev.rc);
            }
            debug!("rx: overflow append failed, no space");
            let ret = fc::pending_ptlte_disable(ep, true);
            if ret.is_err() {
                warn!("rx: forced disable failed");
            }
            let (nic, reqs) = (&mut ep.nic, &mut ep.reqs);
            ep.rx.oflow_pool.link_err(buf_index, nic.as_mut(), reqs);
            Ok(())
        }
        EventType::Unlink => {
            debug_assert!(!ev.auto_unlinked);
            let (nic, reqs) = (&mut ep.nic, &mut ep.reqs);
            ep.rx.oflow_pool.manual_unlinked(buf_index, nic.as_mut(), reqs);
            Ok(())
        }
        EventType::Put => {
            ep.rx.orx_hw_ule_cnt += 1;

            if ev.auto_unlinked {
                let unlink_length =
                    (ev.start - ep.rx.oflow_pool.buf(buf_index).addr()) as usize + ev.mlength;
                let (nic, reqs) = (&mut ep.nic, &mut ep.reqs);
                ep.rx.oflow_pool.auto_unlinked(buf_index, unlink_length, nic.as_mut(), reqs);

                let (nic, reqs) = (&mut ep.nic, &mut ep.reqs);
                if let Err(e) = ep.rx.oflow_pool.replenish(nic.as_mut(), reqs) {
                    debug!("rx: overflow replenish deferred: {}", e);
                }
            }

            if let Err(e) = fc::check_ule_hybrid_preempt(ep) {
                ep.rx.orx_hw_ule_cnt -= 1;
                return Err(e);
            }

            // Unexpected zero-byte puts carry nothing to copy.
            if ev.rlength == 0 {
                return Ok(());
            }

            match oflow_process_put_event(ep, req_id, ev) {
                Ok(()) => Ok(()),
                Err(e) => {
                    ep.rx.orx_hw_ule_cnt -= 1;
                    Err(e)
                }
            }
        }
        _ => fatal!("rx: unexpected overflow event {:?} rc {:?}", ev.event_type, ev.rc),
    }
}

/// Request-list buffer event callback (software managed matching).
///
/// Each put into a request buffer becomes an unexpected-send record matched
/// against the software receive queue.
pub(crate) fn req_buf_cb(ep: &mut Ep, req_id: ReqId, ev: &Event) -> Result<()> {
    let buf_index = ep.reqs.get(req_id).unwrap().oflow().buf_index;

    match ev.event_type {
        EventType::Link => {
            if ev.rc == ReturnCode::Ok {
                return Ok(());
            }
            if ev.rc != ReturnCode::NoSpace {
                fatal!("rx: unexpected request-list link status {:?}", ev.rc);
            }
            let ret = fc::pending_ptlte_disable(ep, true);
            if ret.is_err() {
                warn!("rx: forced disable failed");
            }
            let (nic, reqs) = (&mut ep.nic, &mut ep.reqs);
            ep.rx.req_pool.link_err(buf_index, nic.as_mut(), reqs);
            Ok(())
        }
        EventType::Unlink => {
            let (nic, reqs) = (&mut ep.nic, &mut ep.reqs);
            ep.rx.req_pool.manual_unlinked(buf_index, nic.as_mut(), reqs);
            Ok(())
        }
        EventType::Put => {
            if ev.auto_unlinked {
                let unlink_length =
                    (ev.start - ep.rx.req_pool.buf(buf_index).addr()) as usize + ev.mlength;
                let (nic, reqs) = (&mut ep.nic, &mut ep.reqs);
                ep.rx.req_pool.auto_unlinked(buf_index, unlink_length, nic.as_mut(), reqs);
                let (nic, reqs) = (&mut ep.nic, &mut ep.reqs);
                if let Err(e) = ep.rx.req_pool.replenish(nic.as_mut(), reqs) {
                    debug!("rx: request-list replenish deferred: {}", e);
                }
            }

            let ux_id = ep.rx.next_ux_id();
            let ux = UxSend {
                ux_id,
                claimed: false,
                req: if ev.rlength > 0 { Some(req_id) } else { None },
                put_ev: ev.clone(),
            };

            // During a transition to software managed, hold new arrivals on
            // the pending list until onload completes.
            if ep.rx.state == RxState::PendingPtlteSoftwareManaged {
                ep.rx.sw_pending_ux_list.push(ux);
                return Ok(());
            }

            ep.rx.sw_ux_list.push(ux);
            match recv_ux_sw_matcher(ep, ux_id) {
                Ok(()) | Err(Error::NoMsg) => Ok(()),
                Err(e) => Err(e),
            }
        }
        _ => fatal!("rx: unexpected request-list event {:?}", ev.event_type),
    }
}

/// Receive-request event callback.
pub(crate) fn recv_cb(ep: &mut Ep, req_id: ReqId, ev: &Event) -> Result<()> {
    // Common processing for rendezvous and non-rendezvous events.
    match ev.event_type {
        EventType::Link => {
            if ev.rc == ReturnCode::Ok {
                if !ep.cfg.hybrid_recv_preemptive {
                    return Ok(());
                }
                if fc::check_le_usage_hybrid_preempt(ep, ev) {
                    warn!("rx: forced preemptive switch to software matching");
                }
                return Ok(());
            }

            // Appends that fail after a disable complete without an event.
            if ep.rx.state == RxState::Disabled {
                recv_req_free(ep, req_id);
                return Ok(());
            }

            if ev.rc == ReturnCode::PtlteSwManaged {
                warn!("rx: append failed, transitioning to software matching");
                recv_req_dropped(ep, req_id);
                return Ok(());
            }

            if ev.rc != ReturnCode::NoSpace {
                fatal!("rx: unexpected link status {:?}", ev.rc);
            }

            warn!("rx: append failed, priority list exhausted");
            if fc::pending_ptlte_disable(ep, true).is_err() {
                warn!("rx: forced disable failed");
            }
            recv_req_dropped(ep, req_id);
            return Ok(());
        }
        EventType::Unlink => {
            debug_assert!(!ev.auto_unlinked);
            ep.reqs.get_mut(req_id).unwrap().recv_mut().unlinked = true;
            report_recv(ep, req_id);
            finalize_parent(ep, req_id);
            return Ok(());
        }
        EventType::PutOverflow => {
            // An unexpected-list entry was consumed; during onload this
            // means resources were freed and re-enable should be attempted.
            if ep.rx.state == RxState::OnloadFlowControl {
                ep.rx.state = RxState::OnloadFlowControlReenable;
            }
        }
        _ => {}
    }

    // Rendezvous traffic routes to the coordinator. A Reply from a
    // software-issued get and the ACK of a done-notify carry no rendezvous
    // flag but belong to a request that already counted rendezvous events.
    let rdzv = match ev.event_type {
        EventType::Reply | EventType::Ack => {
            ev.rendezvous || ep.reqs.get(req_id).unwrap().recv().rdzv_events > 0
        }
        _ => ev.rendezvous,
    };
    if rdzv {
        return rdzv::recv_rdzv_cb(ep, req_id, ev);
    }

    match ev.event_type {
        EventType::Send => Ok(()),
        EventType::PutOverflow => {
            // Unexpected zero-byte sends have no Put half.
            if ev.rlength == 0 {
                let start = ep.reqs.get(req_id).unwrap().recv().start_offset;
                let ret = ux_send_zb(ep, req_id, ev, start, false);
                if ret.is_ok() {
                    ep.rx.orx_hw_ule_cnt -= 1;
                }
                return ret;
            }

            let (matched, handle) = ep.rx.deferred.match_put_event(req_id, ev);

            // Only Put-Overflow events arrive in priority-list order, so
            // the multi-receive offset advances here.
            let mrecv_start = ep.reqs.get(req_id).unwrap().recv().start_offset;
            let mrecv_len = mrecv_put_bytes(ep, req_id, ev.rlength);
            {
                let def_ev = ep.rx.deferred.get_mut(handle);
                def_ev.mrecv_start = mrecv_start;
                def_ev.mrecv_len = mrecv_len;
            }

            let multi_recv = ep.reqs.get(req_id).unwrap().recv().multi_recv;
            if multi_recv && ev.auto_unlinked {
                // Bytes consumed before this event plus this event's bytes
                // is the final consumption of the buffer.
                let recv = ep.reqs.get_mut(req_id).unwrap().recv_mut();
                recv.auto_unlinked = true;
                recv.mrecv_unlink_bytes = mrecv_start + mrecv_len;
            }

            ep.rx.orx_hw_ule_cnt -= 1;

            if !matched {
                return Ok(());
            }

            let def_req = ep.rx.deferred.get_mut(handle).req;
            let put_ev = ep.rx.deferred.get_mut(handle).ev.clone();
            match ux_send(ep, req_id, Some(def_req), &put_ev, mrecv_start, mrecv_len, false) {
                Ok(()) => {
                    ep.rx.deferred.remove(handle);
                    Ok(())
                }
                Err(e) => {
                    // Undo the offset advance and the entry consumption.
                    ep.reqs.get_mut(req_id).unwrap().recv_mut().start_offset -= mrecv_len;
                    ep.rx.orx_hw_ule_cnt += 1;
                    Err(e)
                }
            }
        }
        EventType::Put => {
            // Expected delivery straight into the user buffer.
            let multi_recv = ep.reqs.get(req_id).unwrap().recv().multi_recv;
            if multi_recv {
                if ev.auto_unlinked {
                    let recv = ep.reqs.get_mut(req_id).unwrap().recv_mut();
                    recv.auto_unlinked = true;
                    recv.mrecv_unlink_bytes =
                        (ev.start - recv.recv_buf) as usize + ev.mlength;
                }

                let child = mrecv_dup(ep, req_id);
                recv_req_tgt_event(ep, child, ev);
                let req = ep.reqs.get_mut(child).unwrap();
                req.buf = ev.start;
                req.data_len = ev.mlength;
                report_recv(ep, child);
                free_child(ep, child);
            } else {
                let req = ep.reqs.get_mut(req_id).unwrap();
                req.data_len = ev.mlength;
                recv_req_tgt_event(ep, req_id, ev);
                report_recv(ep, req_id);
                recv_req_free(ep, req_id);
            }
            Ok(())
        }
        EventType::Reply => {
            // Long-send pull completed.
            ep.reqs.get_mut(req_id).unwrap().recv_mut().rc = ev.rc;
            report_and_free(ep, req_id);
            Ok(())
        }
        _ => fatal!("rx: unexpected receive event {:?} rc {:?}", ev.event_type, ev.rc),
    }
}

/// Cancel an outstanding receive.
pub(crate) fn recv_cancel(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    let software = ep.reqs.get(req_id).unwrap().recv().software_list;
    if software {
        dequeue_sw_recv(ep, req_id);
        let recv = ep.reqs.get_mut(req_id).unwrap().recv_mut();
        recv.canceled = true;
        recv.unlinked = true;
        report_recv(ep, req_id);
        finalize_parent(ep, req_id);
        Ok(())
    } else {
        ep.nic.unlink_le(PtlList::Priority, req_id)?;
        ep.nic.ring();
        ep.reqs.get_mut(req_id).unwrap().recv_mut().canceled = true;
        Ok(())
    }
}

/// Park a receive whose append was dropped for replay after recovery.
pub(crate) fn recv_req_dropped(ep: &mut Ep, req_id: ReqId) {
    debug_assert!(!ep.rx.replay_queue.contains(&req_id));
    ep.rx.replay_queue.push(req_id);
    debug!("rx: receive {} queued for replay", req_id);
}

/// Compare unexpected-send and receive initiators.
fn init_match(ep: &Ep, init: u32, match_id: u32) -> bool {
    if match_id == MATCH_ID_ANY {
        return true;
    }
    if ep.av.symmetric() {
        return addr::match_id_ep(ep.pid_bits, init) == addr::match_id_ep(ep.pid_bits, match_id);
    }
    init == match_id
}

/// Full software match predicate.
fn match_recv_sw(ep: &Ep, req_id: ReqId, ux: &UxSend, claimed: bool) -> bool {
    if claimed != ux.claimed {
        return false;
    }

    let recv = ep.reqs.get(req_id).unwrap().recv();
    let ux_mb = ux.put_ev.match_bits;

    if recv.tagged != ux_mb.tagged() {
        return false;
    }
    if ux_mb.tagged() {
        let mut recv_mb = MatchBits::new();
        recv_mb.set_tagged(true);
        recv_mb.set_tag(recv.tag);
        if !match_bits::tag_match(ux_mb, recv_mb, match_bits::recv_ignore(true, recv.ignore)) {
            return false;
        }
    }
    init_match(ep, ux.put_ev.initiator, recv.match_id)
}

/// Progress a receive that matched an unexpected send in software.
fn recv_sw_matched(ep: &mut Ep, req_id: ReqId, ux_id: u64) -> Result<()> {
    let (put_ev, ux_req) = {
        let ux = find_ux_mut(ep, ux_id).expect("live ux");
        (ux.put_ev.clone(), ux.req)
    };

    let mrecv_start = ep.reqs.get(req_id).unwrap().recv().start_offset;
    let mrecv_len = mrecv_put_bytes(ep, req_id, put_ev.rlength);

    let (multi_recv, ulen, start_offset) = {
        let r = ep.reqs.get(req_id).unwrap().recv();
        (r.multi_recv, r.ulen, r.start_offset)
    };
    let req_done = !(multi_recv && (ulen - start_offset) >= ep.rx.min_multi_recv);

    if put_ev.rendezvous {
        // The pull needs a TX credit; stall until event progress frees one.
        if ep.rx.orx_tx_reqs + 1 > ep.rx.max_tx {
            ep.reqs.get_mut(req_id).unwrap().recv_mut().start_offset -= mrecv_len;
            return Err(Error::Again);
        }
        ep.rx.orx_tx_reqs += 1;

        if let Err(e) = ux_send(ep, req_id, ux_req, &put_ev, mrecv_start, mrecv_len, req_done) {
            ep.reqs.get_mut(req_id).unwrap().recv_mut().start_offset -= mrecv_len;
            ep.rx.orx_tx_reqs -= 1;
            return Err(e);
        }

        // The hardware rendezvous event will never come: account for it
        // here and issue the pull from software.
        let rdzv_req = if multi_recv {
            rdzv::mrecv_child_lookup(ep, req_id, &put_ev)
                .expect("child created by ux_send")
        } else {
            req_id
        };

        rdzv::recv_req_event(ep, rdzv_req, EventType::Rendezvous);
        set_rget_info(ep, rdzv_req);

        // The credit is held and the receive may already be off the
        // ordered queue; the get must go out, so spin on queue pressure.
        loop {
            match rdzv::issue_rdzv_get(ep, rdzv_req) {
                Ok(()) => break,
                Err(Error::Again) => continue,
                Err(e) => return Err(e),
            }
        }
    } else {
        let ret = if put_ev.rlength > 0 {
            ux_send(ep, req_id, ux_req, &put_ev, mrecv_start, mrecv_len, req_done)
        } else {
            ux_send_zb(ep, req_id, &put_ev, mrecv_start, req_done)
        };
        if let Err(e) = ret {
            ep.reqs.get_mut(req_id).unwrap().recv_mut().start_offset -= mrecv_len;
            return Err(e);
        }
    }

    if !req_done {
        return Err(Error::InProgress);
    }
    Ok(())
}

/// Match one receive against one unexpected send and progress on success.
fn recv_sw_matcher(ep: &mut Ep, req_id: ReqId, ux_id: u64, claimed: bool) -> Result<()> {
    {
        let ux = ep
            .rx
            .sw_ux_list
            .iter()
            .find(|u| u.ux_id == ux_id)
            .expect("live ux");
        if !match_recv_sw(ep, req_id, ux, claimed) {
            return Err(Error::NoMsg);
        }
    }

    let ret = recv_sw_matched(ep, req_id, ux_id);
    if ret == Err(Error::Again) {
        return ret;
    }
    debug_assert!(matches!(ret, Ok(()) | Err(Error::InProgress)));

    // The unexpected send is consumed.
    ep.rx.sw_ux_list.retain(|u| u.ux_id != ux_id);
    debug!(
        "rx: software match req {} ux {} ({} entries left)",
        req_id,
        ux_id,
        ep.rx.sw_ux_list.len()
    );
    ret
}

/// A new unexpected send arrived; try it against the software receive queue.
pub(crate) fn recv_ux_sw_matcher(ep: &mut Ep, ux_id: u64) -> Result<()> {
    if ep.rx.sw_recv_queue.is_empty() {
        return Err(Error::NoMsg);
    }

    let queue: Vec<ReqId> = ep.rx.sw_recv_queue.clone();
    for req_id in queue {
        match recv_sw_matcher(ep, req_id, ux_id, false) {
            Err(Error::Again) => return Err(Error::Again),
            Ok(()) | Err(Error::InProgress) => return Ok(()),
            Err(Error::NoMsg) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::NoMsg)
}

/// A new receive: try it against every onloaded unexpected send.
pub(crate) fn recv_req_sw_matcher(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    if ep.rx.sw_ux_list.is_empty() {
        return Err(Error::NoMsg);
    }

    let ux_ids: Vec<u64> = ep.rx.sw_ux_list.iter().map(|u| u.ux_id).collect();
    for ux_id in ux_ids {
        match recv_sw_matcher(ep, req_id, ux_id, false) {
            // A multi-receive keeps matching; a miss moves on.
            Err(Error::InProgress) | Err(Error::NoMsg) => continue,
            ret => return ret,
        }
    }
    Err(Error::NoMsg)
}

/// Queue a receive: software match first, then hardware append or the
/// software receive queue.
pub(crate) fn recv_req_queue(ep: &mut Ep, req_id: ReqId, restart_seq: bool) -> Result<()> {
    match recv_req_sw_matcher(ep, req_id) {
        Ok(()) => return Err(Error::Already),
        Err(Error::Again) => return Err(Error::Again),
        Err(Error::NoMsg) => {}
        Err(e) => fatal!("rx: software matching failed: {}", e),
    }

    if ep.rx.msg_offload {
        // Appends cannot interleave with an unexpected-entry claim.
        if ep.rx.hw_claim_in_progress {
            return Err(Error::Again);
        }
        append_recv(ep, req_id, restart_seq)?;
    } else {
        ep.reqs.get_mut(req_id).unwrap().recv_mut().software_list = true;
        ep.rx.sw_recv_queue.push(req_id);
    }
    Ok(())
}

/// Submit a receive to the hardware priority list.
fn append_recv(ep: &mut Ep, req_id: ReqId, restart_seq: bool) -> Result<()> {
    fc::check_recv_count_hybrid_preempt(ep)?;

    let (tagged, tag, ignore, match_id, multi_recv, buf, ulen, start_offset, md) = {
        let r = ep.reqs.get(req_id).unwrap().recv();
        (
            r.tagged, r.tag, r.ignore, r.match_id, r.multi_recv, r.recv_buf, r.ulen,
            r.start_offset, r.recv_md,
        )
    };

    let mut mb = MatchBits::new();
    if tagged {
        mb.set_tagged(true);
        mb.set_tag(tag);
    }
    let ib = match_bits::recv_ignore(tagged, ignore);

    // Periodic LE-usage checks require a link event now and then; suppress
    // it otherwise.
    ep.rx.recv_appends = ep.rx.recv_appends.wrapping_add(1);
    let mut flags = LeFlags::MANAGE_LOCAL | LeFlags::OP_PUT | LeFlags::EVENT_UNLINK_DISABLE;
    if ep.cfg.rx_match_mode != MatchMode::Hybrid
        || ep.rx.recv_appends & (ep.cfg.hybrid_recv_check_interval - 1) != 0
    {
        flags |= LeFlags::EVENT_LINK_DISABLE;
    }
    if !multi_recv {
        flags |= LeFlags::USE_ONCE;
    }
    if restart_seq {
        flags |= LeFlags::RESTART_SEQ;
    }

    let iova = md.map(|m| m.iova).unwrap_or(buf) + start_offset as u64;

    ep.reqs.get_mut(req_id).unwrap().recv_mut().hw_offloaded = true;

    ep.nic.append_le(AppendCmd {
        list: PtlList::Priority,
        buffer_id: req_id,
        addr: iova,
        len: ulen - start_offset,
        match_bits: mb,
        ignore_bits: ib,
        match_id,
        min_free: if multi_recv { ep.rx.min_multi_recv } else { 0 },
        flags,
    })?;

    let more = ep.reqs.get(req_id).unwrap().flags.contains(MsgFlags::MORE);
    if !more {
        ep.nic.ring();
    }
    Ok(())
}

/// Peek the unexpected message stream without consuming.
pub(crate) fn recv_req_peek(ep: &mut Ep, req_id: ReqId, check_rx_state: bool) -> Result<()> {
    if check_rx_state
        && ep.rx.state != RxState::Enabled
        && ep.rx.state != RxState::EnabledSoftware
    {
        return Err(Error::Again);
    }

    // Software list first.
    let hit = ep
        .rx
        .sw_ux_list
        .iter()
        .find(|ux| match_recv_sw(ep, req_id, ux, false))
        .map(|ux| ux.ux_id);

    if let Some(ux_id) = hit {
        let claim = ep.reqs.get(req_id).unwrap().flags.contains(MsgFlags::CLAIM);
        let put_ev = {
            let ux = find_ux_mut(ep, ux_id).unwrap();
            if claim {
                ux.claimed = true;
            }
            ux.put_ev.clone()
        };
        recv_req_tgt_event(ep, req_id, &put_ev);
        recv_req_peek_complete(ep, req_id, Some(ux_id));
        return Ok(());
    }

    if ep.rx.msg_offload {
        // Claims serialize on the remote-offset snapshot.
        if ep.rx.hw_claim_in_progress {
            return Err(Error::Again);
        }
        ux_peek(ep, req_id)
    } else {
        ep.reqs.get_mut(req_id).unwrap().recv_mut().rc = ReturnCode::NoMatch;
        recv_req_peek_complete(ep, req_id, None);
        Ok(())
    }
}

/// Search the hardware unexpected list for a peek.
fn ux_peek(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    if ep.nic.eq_saturated() {
        debug!("rx: target event queue saturated");
        return Err(Error::Again);
    }

    let (tagged, tag, ignore, match_id, claim) = {
        let req = ep.reqs.get(req_id).unwrap();
        let r = req.recv();
        (r.tagged, r.tag, r.ignore, r.match_id, req.flags.contains(MsgFlags::CLAIM))
    };

    let mut mb = MatchBits::new();
    mb.set_tagged(tagged);
    mb.set_tag(tag);

    ep.reqs.get_mut(req_id).unwrap().cb = ReqCallback::Peek;
    ep.nic.search(SearchCmd {
        buffer_id: req_id,
        match_bits: mb,
        ignore_bits: match_bits::recv_ignore(tagged, ignore),
        match_id,
        delete: false,
        use_once: true,
    })?;
    ep.nic.ring();

    // A claim's search doubles as a flush of outstanding appends.
    if claim {
        ep.rx.hw_claim_in_progress = true;
    }
    Ok(())
}

/// Peek search completion.
pub(crate) fn ux_peek_cb(ep: &mut Ep, req_id: ReqId, ev: &Event) -> Result<()> {
    if ev.event_type != EventType::Search {
        fatal!("rx: unexpected peek event {:?}", ev.event_type);
    }

    if ev.rc == ReturnCode::Ok {
        debug!("rx: peek search matched for {}", req_id);
        if ep.reqs.get(req_id).unwrap().flags.contains(MsgFlags::CLAIM) {
            return initiate_hw_claim(ep, req_id);
        }
        recv_req_tgt_event(ep, req_id, ev);
    } else {
        debug!("rx: peek search found nothing for {}", req_id);
        ep.reqs.get_mut(req_id).unwrap().recv_mut().rc = ReturnCode::NoMatch;
    }

    recv_req_peek_complete(ep, req_id, None);
    Ok(())
}

/// Start claiming a hardware unexpected entry: snapshot remote offsets,
/// then walk the list to find the matching entry's offset.
fn initiate_hw_claim(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    if ep.rx.state != RxState::Enabled {
        debug!("rx: flow control in progress, claim {} fails", req_id);
        ep.rx.hw_claim_in_progress = false;
        ep.reqs.get_mut(req_id).unwrap().recv_mut().rc = ReturnCode::NoMatch;
        recv_req_peek_complete(ep, req_id, None);
        return Ok(());
    }

    let offsets = ep.nic.ule_offsets();
    {
        let recv = ep.reqs.get_mut(req_id).unwrap().recv_mut();
        recv.cur_ule_offsets = 0;
        recv.num_ule_offsets = offsets.len();
        recv.ule_offsets = offsets;
    }

    ep.reqs.get_mut(req_id).unwrap().cb = ReqCallback::ClaimOffset;
    let ret = ep.nic.search(SearchCmd {
        buffer_id: req_id,
        match_bits: MatchBits::new(),
        ignore_bits: match_bits::search_ignore(false, 0, true),
        match_id: MATCH_ID_ANY,
        delete: false,
        use_once: false,
    });

    if ret.is_err() {
        ep.reqs.get_mut(req_id).unwrap().recv_mut().ule_offsets = Vec::new();
        ep.rx.hw_claim_in_progress = false;
        ep.reqs.get_mut(req_id).unwrap().recv_mut().rc = ReturnCode::NoMatch;
        recv_req_peek_complete(ep, req_id, None);
        return Ok(());
    }
    ep.nic.ring();

    debug!("rx: claim offset search initiated for {}", req_id);
    Ok(())
}

/// Offset-discovery search events: every unexpected entry generates one
/// success event in list order, then a no-match terminator.
pub(crate) fn hw_claim_offset_cb(ep: &mut Ep, req_id: ReqId, ev: &Event) -> Result<()> {
    if ev.event_type != EventType::Search {
        fatal!("rx: unexpected claim event {:?}", ev.event_type);
    }

    if ev.rc == ReturnCode::Ok {
        {
            let recv = ep.reqs.get_mut(req_id).unwrap().recv_mut();
            if recv.offset_found {
                return Ok(());
            }
            recv.cur_ule_offsets += 1;
            if recv.cur_ule_offsets > recv.num_ule_offsets {
                debug!("rx: claim offsets exceeded for {}", req_id);
                return Ok(());
            }
        }

        // Check this entry against the peek criteria.
        let matches = {
            let recv = ep.reqs.get(req_id).unwrap().recv();
            let ux_mb = ev.match_bits;
            let mut ok = recv.tagged == ux_mb.tagged();
            if ok && ux_mb.tagged() {
                let mut recv_mb = MatchBits::new();
                recv_mb.set_tagged(true);
                recv_mb.set_tag(recv.tag);
                ok = match_bits::tag_match(
                    ux_mb,
                    recv_mb,
                    match_bits::recv_ignore(true, recv.ignore),
                );
            }
            ok
        } && init_match(ep, ev.initiator, ep.reqs.get(req_id).unwrap().recv().match_id);

        if matches {
            let recv = ep.reqs.get_mut(req_id).unwrap().recv_mut();
            recv.offset_found = true;
            recv.ule_offset = recv.ule_offsets[recv.cur_ule_offsets - 1];
            debug!("rx: claim offset found for {}: {:#x}", req_id, recv.ule_offset);
        }
        return Ok(());
    }

    debug_assert_eq!(ev.rc, ReturnCode::NoMatch);

    if !ep.reqs.get(req_id).unwrap().recv().offset_found {
        debug!("rx: claim target not found for {}", req_id);
        return claim_not_found(ep, req_id);
    }

    match claim_ux_onload(ep, req_id) {
        Ok(()) => Ok(()),
        Err(Error::Again) => Err(Error::Again),
        Err(_) => claim_not_found(ep, req_id),
    }
}

fn claim_not_found(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    ep.rx.hw_claim_in_progress = false;
    {
        let recv = ep.reqs.get_mut(req_id).unwrap().recv_mut();
        recv.ule_offsets = Vec::new();
        recv.rc = ReturnCode::NoMatch;
    }
    recv_req_peek_complete(ep, req_id, None);
    Ok(())
}

/// Delete the claimed entry from hardware so it onloads to software.
fn claim_ux_onload(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    if ep.rx.state != RxState::Enabled {
        debug!("rx: flow control in progress, claim {} fails", req_id);
        return claim_not_found(ep, req_id);
    }

    let (tagged, tag, ignore, match_id) = {
        let r = ep.reqs.get(req_id).unwrap().recv();
        (r.tagged, r.tag, r.ignore, r.match_id)
    };

    let mut mb = MatchBits::new();
    mb.set_tagged(tagged);
    mb.set_tag(tag);

    ep.reqs.get_mut(req_id).unwrap().cb = ReqCallback::ClaimOnload;
    ep.nic.search(SearchCmd {
        buffer_id: req_id,
        match_bits: mb,
        ignore_bits: match_bits::recv_ignore(tagged, ignore),
        match_id,
        delete: true,
        use_once: true,
    })?;
    ep.nic.ring();

    // Hardware orders later priority appends after the delete; appends may
    // resume.
    ep.rx.hw_claim_in_progress = false;
    debug!("rx: claim search-and-delete initiated for {}", req_id);
    Ok(())
}

/// Claimed-entry onload completion: build the claimed unexpected record.
pub(crate) fn claim_onload_cb(ep: &mut Ep, req_id: ReqId, ev: &Event) -> Result<()> {
    if ev.event_type != EventType::PutOverflow {
        fatal!("rx: unexpected claim onload event {:?}", ev.event_type);
    }

    if ev.rc != ReturnCode::Ok {
        warn!("rx: claim onload failed: {:?}", ev.rc);
        ep.reqs.get_mut(req_id).unwrap().recv_mut().rc = ReturnCode::NoMatch;
        recv_req_peek_complete(ep, req_id, None);
        return Ok(());
    }

    ep.rx.orx_hw_ule_cnt -= 1;

    let ux_id = ep.rx.next_ux_id();
    let ule_offset = ep.reqs.get(req_id).unwrap().recv().ule_offset;

    let mut matched = false;
    let mut put_ev = ev.clone();
    let mut ux_req = None;

    if ev.rlength > 0 {
        let (found, handle) = ep.rx.deferred.match_put_event(req_id, ev);
        if found {
            let def_ev = ep.rx.deferred.remove(handle);
            put_ev = def_ev.ev;
            // The claimed bytes still charge against their landing buffer.
            ux_req = Some(def_ev.req);
            matched = true;
        } else {
            // The Put to the overflow list is still outstanding; the claim
            // completes when it arrives.
            ep.rx.deferred.get_mut(handle).ux_id = Some(ux_id);
        }
        // The software get pulls from the snapshotted remote offset.
        put_ev.remote_offset = ule_offset + ev.mlength as u64;
    } else {
        matched = true;
    }

    ep.rx.sw_ux_list.push(UxSend {
        ux_id,
        claimed: true,
        req: ux_req,
        put_ev: put_ev.clone(),
    });

    recv_req_tgt_event(ep, req_id, &put_ev);

    if matched {
        recv_req_peek_complete(ep, req_id, Some(ux_id));
        debug!("rx: claim onload complete for {}", req_id);
    }
    Ok(())
}

/// Common receive entry point for tagged and untagged posts of all sizes.
#[allow(clippy::too_many_arguments)]
pub(crate) fn recv_common(
    ep: &mut Ep,
    buf: u64,
    len: usize,
    src_addr: u64,
    tag: u64,
    ignore: u64,
    context: u64,
    mut flags: MsgFlags,
    tagged: bool,
) -> Result<()> {
    if len > 0 && buf == 0 {
        return Err(Error::InvalidArg("non-zero length with null buffer"));
    }
    if ep.rx.state == RxState::Disabled {
        return Err(Error::BadState);
    }
    // While transitioning, keep making progress and ask the caller back.
    if ep.rx.state != RxState::Enabled && ep.rx.state != RxState::EnabledSoftware {
        crate::ep::progress_locked(ep);
        return Err(Error::Again);
    }

    if tagged {
        if tag & !ep.cfg.tag_mask != 0 || ignore & !ep.cfg.tag_mask != 0 {
            return Err(Error::InvalidTag { tag, mask: ep.cfg.tag_mask });
        }
        flags.remove(MsgFlags::MULTI_RECV);
    }

    // Directed receives encode the source in the entry's match id.
    let match_id = if src_addr != FI_ADDR_UNSPEC {
        if ep.av.symmetric() {
            addr::match_id(ep.pid_bits, addr::PID_ANY, src_addr as u32)
        } else {
            let caddr = ep
                .av
                .lookup_addr(src_addr)
                .ok_or(Error::InvalidArg("unknown source address"))?;
            addr::match_id(ep.pid_bits, caddr.pid, caddr.nic)
        }
    } else {
        MATCH_ID_ANY
    };

    let req_id = recv_req_alloc(ep, buf, len)?;
    {
        let req = ep.reqs.get_mut(req_id).unwrap();
        req.context = context;
        req.flags = MsgFlags::RECV | (flags & MsgFlags::COMPLETION);
        req.flags |= if tagged { MsgFlags::TAGGED } else { MsgFlags::MSG };
        req.flags |= flags & (MsgFlags::PEEK | MsgFlags::CLAIM | MsgFlags::MORE);
        req.buf = buf;
        let recv = req.recv_mut();
        recv.match_id = match_id;
        recv.tag = tag;
        recv.ignore = ignore;
        recv.tagged = tagged;
        recv.multi_recv = flags.contains(MsgFlags::MULTI_RECV);
    }

    if !flags.intersects(MsgFlags::PEEK | MsgFlags::CLAIM) {
        return match recv_req_queue(ep, req_id, false) {
            // Matched in software: the operation already completed.
            Err(Error::Already) | Ok(()) => Ok(()),
            Err(e) => {
                recv_req_free(ep, req_id);
                Err(e)
            }
        };
    }

    // Peek, with or without claim.
    if flags.contains(MsgFlags::PEEK) {
        if flags.contains(MsgFlags::CLAIM) && context == 0 {
            warn!("rx: claim requires a stable context");
            recv_req_free(ep, req_id);
            return Err(Error::InvalidArg("claim requires a context"));
        }
        return match recv_req_peek(ep, req_id, true) {
            Ok(()) => Ok(()),
            Err(e) => {
                recv_req_free(ep, req_id);
                Err(e)
            }
        };
    }

    // Claim without peek: retrieve the previously claimed record.
    let Some(&ux_id) = ep.rx.claimed_ux.get(&context) else {
        warn!("rx: claim with unknown context {:#x}", context);
        recv_req_free(ep, req_id);
        return Err(Error::InvalidArg("claim context has no claimed message"));
    };

    match recv_sw_matcher(ep, req_id, ux_id, true) {
        Ok(()) | Err(Error::InProgress) => {
            ep.rx.claimed_ux.remove(&context);
            Ok(())
        }
        Err(e) => {
            recv_req_free(ep, req_id);
            Err(e)
        }
    }
}

/// Replay receives whose appends were dropped during a transition.
pub(crate) fn recv_replay(ep: &mut Ep) -> Result<()> {
    let queue = std::mem::take(&mut ep.rx.replay_queue);
    let mut restart_seq = true;

    for req_id in queue {
        // The portal is quiesced; no new posts race these appends.
        match recv_req_queue(ep, req_id, restart_seq) {
            Err(Error::Already) => continue,
            Ok(()) => {}
            Err(e) => fatal!("rx: replay of receive {} failed: {}", req_id, e),
        }
        restart_seq = false;
    }
    Ok(())
}
