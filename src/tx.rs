//! Send engine.
//!
//! Every send is queued on the per-context message queue before emission
//! and dequeued when its acknowledgement arrives; the queue is what makes
//! ordered replay possible when a target disables its portal. Payloads go
//! out as inline-data commands (small or injected), DMA puts (eager) or
//! rendezvous puts (large), chosen per the configured thresholds.

use log::{debug, warn};

use crate::addr::{self, AddressVector, FabAddr};
use crate::config::{MsgConfig, RdzvProto};
use crate::cq::{CompErr, CompKind, Completion, CompQueue, Counter};
use crate::ep::Ep;
use crate::error::{fatal, Error, Result};
use crate::match_bits::{CtrlMsgType, LeType, MatchBits, RDZV_ID_CMD_WIDTH};
use crate::nic::{Event, EventType, Nic, PtlList, PutCmd, ReturnCode, TargetPte};
use crate::rdzv::IdPool;
use crate::req::{CtrlReq, MsgFlags, RdzvSrcReq, ReqCallback, ReqId, ReqState, SendReq};

/// Bounce buffers backing inject sends; the payload must survive user
/// buffer reuse and flow-control replay.
#[derive(Debug)]
pub struct BouncePool {
    bufs: Vec<Box<[u8]>>,
    free: Vec<usize>,
    buf_size: usize,
}

impl BouncePool {
    pub fn new(count: usize, buf_size: usize) -> Self {
        Self {
            bufs: (0..count).map(|_| vec![0u8; buf_size].into_boxed_slice()).collect(),
            free: (0..count).collect(),
            buf_size,
        }
    }

    pub fn alloc(&mut self) -> Option<usize> {
        self.free.pop()
    }

    pub fn free(&mut self, idx: usize) {
        debug_assert!(!self.free.contains(&idx));
        self.free.push(idx);
    }

    pub fn buf(&self, idx: usize) -> &[u8] {
        &self.bufs[idx]
    }

    pub fn buf_mut(&mut self, idx: usize) -> &mut [u8] {
        &mut self.bufs[idx]
    }

    #[inline]
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }
}

/// A peer whose portal dropped sends; exists from first drop until replay
/// completes and every notify is acknowledged.
#[derive(Debug)]
pub struct FcPeer {
    pub caddr: FabAddr,
    /// Parked sends, in original order.
    pub msg_queue: Vec<ReqId>,
    /// In-flight (pre-drop) sends not yet accounted.
    pub pending: u32,
    /// Sends the target dropped.
    pub dropped: u16,
    /// Notify messages awaiting acknowledgement.
    pub pending_acks: u32,
    pub replayed: bool,
    /// Embedded notify control request.
    pub ctrl_req: ReqId,
}

/// Transmit-side context.
pub struct TxCtx {
    /// In-flight sends, in emission order.
    pub msg_queue: Vec<ReqId>,
    pub fc_peers: Vec<Option<FcPeer>>,
    pub ibuf_pool: BouncePool,
    pub tx_ids: IdPool,
    pub rdzv_ids: IdPool,
    /// Outstanding send requests, bounded by the queue size.
    pub otx_reqs: usize,
    pub max_otx: usize,
    pub rdzv_proto: RdzvProto,
    pub rdzv_eager_size: usize,
    /// Rendezvous source window request, bound lazily.
    pub rdzv_src_req: Option<ReqId>,
    pub cq: CompQueue,
    pub cntr: Counter,
}

impl TxCtx {
    pub fn new(cfg: &MsgConfig) -> Self {
        Self {
            msg_queue: Vec::new(),
            fc_peers: Vec::new(),
            ibuf_pool: BouncePool::new(cfg.tx_size, cfg.inject_size.max(1)),
            tx_ids: IdPool::new(1 << crate::match_bits::TX_ID_WIDTH),
            rdzv_ids: IdPool::new(1 << crate::match_bits::RDZV_ID_WIDTH),
            otx_reqs: 0,
            max_otx: cfg.tx_size,
            rdzv_proto: cfg.rdzv_proto,
            rdzv_eager_size: cfg.rdzv_eager_size,
            rdzv_src_req: None,
            cq: CompQueue::new(),
            cntr: Counter::new(),
        }
    }
}

/// Report completion of a send operation.
///
/// With match-complete semantics the engine owns counter updates; plain
/// sends let the device-side counter bump instead.
pub(crate) fn report_send_completion(ep: &mut Ep, req_id: ReqId, sw_cntr: bool) {
    let req = ep.reqs.get(req_id).unwrap();
    let rc = req.send().rc;
    let success_event = req.flags.contains(MsgFlags::COMPLETION);
    let comp_flags = req.flags & (MsgFlags::MSG | MsgFlags::TAGGED | MsgFlags::SEND);

    let comp = Completion {
        context: req.context,
        flags: comp_flags,
        len: 0,
        buf: 0,
        data: 0,
        tag: req.send().tag,
        src_addr: addr::FI_ADDR_NOTAVAIL,
        err: None,
    };

    if rc == ReturnCode::Ok {
        debug!("tx: request {} success", req_id);
        if success_event {
            ep.tx.cq.push(comp);
        }
        if sw_cntr {
            ep.tx.cntr.add(false);
        }
    } else {
        let send = req.send();
        warn!(
            "tx: request {} to {:#x}:{} failed rc {:?}",
            req_id, send.caddr.nic, send.caddr.pid, rc
        );
        let mut comp = comp;
        comp.err = Some(CompErr {
            kind: CompKind::Provider(rc),
            olen: 0,
            rc,
            addr: None,
        });
        ep.tx.cq.push(comp);
        if sw_cntr {
            ep.tx.cntr.add(true);
        }
    }
}

/// Release the payload resources of a send.
pub(crate) fn send_buf_fini(ep: &mut Ep, req_id: ReqId) {
    let (md, ibuf) = {
        let send = ep.reqs.get_mut(req_id).unwrap().send_mut();
        (send.send_md.take(), send.ibuf.take())
    };
    if let Some(md) = md {
        ep.nic.unmap(md);
    }
    if let Some(idx) = ibuf {
        ep.tx.ibuf_pool.free(idx);
    }
}

/// Prepare payload resources: bounce buffer for inject, nothing extra for
/// small inline sends, a registration for everything else.
fn send_buf_init(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    let (len, buf, flags, triggered) = {
        let req = ep.reqs.get(req_id).unwrap();
        let s = req.send();
        (s.len, s.buf, req.flags, s.triggered)
    };

    if len == 0 {
        return Ok(());
    }

    // Triggered operations always register the user buffer.
    if triggered {
        let md = ep.nic.map(buf as *const u8, len)?;
        ep.reqs.get_mut(req_id).unwrap().send_mut().send_md = Some(md);
        return Ok(());
    }

    // Inject payloads are copied so replay after a drop never touches the
    // user buffer.
    if flags.contains(MsgFlags::INJECT) {
        let idx = ep.tx.ibuf_pool.alloc().ok_or(Error::Again)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf as *const u8,
                ep.tx.ibuf_pool.buf_mut(idx).as_mut_ptr(),
                len,
            );
        }
        ep.reqs.get_mut(req_id).unwrap().send_mut().ibuf = Some(idx);
        return Ok(());
    }

    // Inline-data commands capture the payload at emission time.
    if send_eager_idc(ep, len) {
        return Ok(());
    }

    let md = ep.nic.map(buf as *const u8, len)?;
    ep.reqs.get_mut(req_id).unwrap().send_mut().send_md = Some(md);
    Ok(())
}

#[inline]
fn send_eager_idc(ep: &Ep, len: usize) -> bool {
    len <= ep.cfg.inject_size && !ep.cfg.disable_non_inject_msg_idc
}

/// Build the eager match bits, allocating a transaction id when the sender
/// asked for match-complete notification.
fn set_eager_mb(ep: &mut Ep, req_id: ReqId) -> Result<MatchBits> {
    let (tagged, tag, flags) = {
        let req = ep.reqs.get(req_id).unwrap();
        (req.send().tagged, req.send().tag, req.flags)
    };

    let mut mb = MatchBits::new();
    mb.set_le_type(LeType::Rx);
    mb.set_tagged(tagged);
    if tagged {
        mb.set_tag(tag);
    }
    mb.set_cq_data(flags.contains(MsgFlags::REMOTE_CQ_DATA));

    if flags.contains(MsgFlags::MATCH_COMPLETE) {
        let tx_id = ep.tx.tx_ids.alloc(req_id).ok_or_else(|| {
            debug!("tx: transaction ids exhausted");
            Error::Again
        })?;
        ep.reqs.get_mut(req_id).unwrap().send_mut().tx_id = tx_id;
        mb.set_match_comp(true);
        mb.set_tx_id(tx_id);
    }

    Ok(mb)
}

fn emit_fence(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    if ep.reqs.get(req_id).unwrap().flags.contains(MsgFlags::FENCE) {
        ep.nic.fence()?;
    }
    Ok(())
}

/// Emit an eager send as an inline-data command.
fn send_eager_idc_cmd(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    let (caddr, len, buf, ibuf, data) = {
        let s = ep.reqs.get(req_id).unwrap().send();
        (s.caddr, s.len, s.buf, s.ibuf, s.data)
    };
    debug_assert!(len > 0);

    let mb = set_eager_mb(ep, req_id)?;
    ep.reqs.get_mut(req_id).unwrap().cb = ReqCallback::SendEager;

    let cmd = PutCmd {
        nic: caddr.nic,
        pid: caddr.pid,
        pte: TargetPte::Rx,
        buffer_id: req_id,
        match_bits: mb,
        header_data: data,
        initiator: ep.msg_match_id(),
        addr: 0,
        len,
        eager_length: 0,
        rendezvous_id: 0,
        remote_offset: 0,
    };

    let mut ret = emit_fence(ep, req_id);
    if ret.is_ok() {
        // Favor the bounce buffer when one was taken.
        ret = if let Some(idx) = ibuf {
            let payload = ep.tx.ibuf_pool.buf(idx)[..len].to_vec();
            ep.nic.idc_put(cmd, &payload)
        } else {
            let payload = unsafe { std::slice::from_raw_parts(buf as *const u8, len) };
            ep.nic.idc_put(cmd, payload)
        };
    }

    if ret.is_err() {
        if mb.match_comp() {
            let tx_id = ep.reqs.get(req_id).unwrap().send().tx_id;
            ep.tx.tx_ids.free(tx_id);
        }
        return ret;
    }

    let more = ep.reqs.get(req_id).unwrap().flags.contains(MsgFlags::MORE);
    if !more {
        ep.nic.ring();
    }
    Ok(())
}

/// Emit an eager send as a DMA put.
fn send_eager_cmd(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    let (caddr, len, buf, md, data) = {
        let s = ep.reqs.get(req_id).unwrap().send();
        (s.caddr, s.len, s.buf, s.send_md, s.data)
    };

    let mb = set_eager_mb(ep, req_id)?;
    ep.reqs.get_mut(req_id).unwrap().cb = ReqCallback::SendEager;

    let cmd = PutCmd {
        nic: caddr.nic,
        pid: caddr.pid,
        pte: TargetPte::Rx,
        buffer_id: req_id,
        match_bits: mb,
        header_data: data,
        initiator: ep.msg_match_id(),
        addr: md.map(|m| m.iova).unwrap_or(buf),
        len,
        eager_length: 0,
        rendezvous_id: 0,
        remote_offset: 0,
    };

    let mut ret = emit_fence(ep, req_id);
    if ret.is_ok() {
        ret = ep.nic.dma_put(cmd);
    }
    if ret.is_err() {
        if mb.match_comp() {
            let tx_id = ep.reqs.get(req_id).unwrap().send().tx_id;
            ep.tx.tx_ids.free(tx_id);
        }
        return ret;
    }

    let more = ep.reqs.get(req_id).unwrap().flags.contains(MsgFlags::MORE);
    if !more {
        ep.nic.ring();
    }
    Ok(())
}

/// Make the rendezvous source window available for target pulls.
fn ensure_rdzv_src(ep: &mut Ep, lac: u8) -> Result<()> {
    if ep.tx.rdzv_src_req.is_some() {
        return Ok(());
    }
    let req_id = ep
        .reqs
        .alloc(ReqCallback::RdzvSrc, ReqState::RdzvSrc(RdzvSrcReq { lac }));
    ep.nic.bind_portal(TargetPte::RdzvSrc, req_id);
    ep.tx.rdzv_src_req = Some(req_id);
    Ok(())
}

/// Emit a rendezvous put: the eager head travels with the put, the target
/// pulls the remainder.
fn send_rdzv_put_cmd(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    let (caddr, len, buf, md, data, tagged, tag, flags) = {
        let req = ep.reqs.get(req_id).unwrap();
        let s = req.send();
        (s.caddr, s.len, s.buf, s.send_md, s.data, s.tagged, s.tag, req.flags)
    };
    // Zero-length rendezvous is never selected.
    debug_assert!(len > 0);
    let md = md.expect("rendezvous sends are registered");

    let rdzv_id = ep.tx.rdzv_ids.alloc(req_id).ok_or(Error::Again)?;
    ensure_rdzv_src(ep, md.lac)?;

    let mut mb = MatchBits::new();
    mb.set_le_type(LeType::Rx);
    if tagged {
        mb.set_tagged(true);
        mb.set_tag(tag);
    }
    mb.set_cq_data(flags.contains(MsgFlags::REMOTE_CQ_DATA));
    mb.set_rdzv_proto(ep.tx.rdzv_proto as u8);
    mb.set_rdzv_id_hi(rdzv_id >> RDZV_ID_CMD_WIDTH);
    mb.set_rdzv_lac(md.lac);

    {
        let send = ep.reqs.get_mut(req_id).unwrap().send_mut();
        send.rdzv_id = rdzv_id;
        send.rdzv_send_events = 0;
    }
    ep.reqs.get_mut(req_id).unwrap().cb = ReqCallback::SendRdzv;

    let cmd = PutCmd {
        nic: caddr.nic,
        pid: caddr.pid,
        pte: TargetPte::Rx,
        buffer_id: req_id,
        match_bits: mb,
        header_data: data,
        initiator: ep.msg_match_id(),
        addr: md.iova,
        len,
        eager_length: ep.tx.rdzv_eager_size.min(len),
        rendezvous_id: rdzv_id & ((1 << RDZV_ID_CMD_WIDTH) - 1),
        // The target pulls relative to the source buffer address.
        remote_offset: md.iova,
    };

    let mut ret = emit_fence(ep, req_id);
    if ret.is_ok() {
        ret = ep.nic.rdzv_put(cmd);
    }
    if ret.is_err() {
        ep.tx.rdzv_ids.free(rdzv_id);
        debug!("tx: rendezvous put enqueue failed for {}", req_id);
        return Err(Error::Again);
    }

    let more = flags.contains(MsgFlags::MORE);
    if !more {
        ep.nic.ring();
    }
    Ok(())
}

/// Choose and emit the transmit path for a send.
pub(crate) fn send_req(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    let (len, flags, triggered) = {
        let req = ep.reqs.get(req_id).unwrap();
        (req.send().len, req.flags, req.send().triggered)
    };

    // Zero-byte operations ride the smaller eager command.
    if len == 0 {
        return send_eager_cmd(ep, req_id);
    }

    // Inline-data commands are unavailable to triggered operations.
    if !triggered && (flags.contains(MsgFlags::INJECT) || send_eager_idc(ep, len)) {
        return send_eager_idc_cmd(ep, req_id);
    }

    if len <= ep.cfg.rdzv_threshold {
        return send_eager_cmd(ep, req_id);
    }

    send_rdzv_put_cmd(ep, req_id)
}

/// Look up a disabled peer.
pub(crate) fn fc_peer_lookup(ep: &Ep, caddr: FabAddr) -> Option<usize> {
    ep.tx
        .fc_peers
        .iter()
        .position(|p| matches!(p, Some(peer) if peer.caddr.same_peer(&caddr)))
}

/// Mark a peer disabled: park every in-flight send to it, in order.
fn fc_peer_init(ep: &mut Ep, caddr: FabAddr) -> usize {
    let ctrl_req = ep.reqs.alloc(
        ReqCallback::Ctrl,
        ReqState::Ctrl(CtrlReq {
            kind: CtrlMsgType::FcNotify,
            nic: caddr.nic,
            pid: caddr.pid,
            drops: 0,
            retry_count: 0,
            peer_idx: None,
        }),
    );

    let idx = ep
        .tx
        .fc_peers
        .iter()
        .position(|p| p.is_none())
        .unwrap_or_else(|| {
            ep.tx.fc_peers.push(None);
            ep.tx.fc_peers.len() - 1
        });

    if let ReqState::Ctrl(c) = &mut ep.reqs.get_mut(ctrl_req).unwrap().state {
        c.peer_idx = Some(idx);
    }

    // Transfer in-flight sends to the peer queue, preserving order.
    let mut parked = Vec::new();
    ep.tx.msg_queue.retain(|&id| {
        let matches = ep
            .reqs
            .get(id)
            .map(|r| r.send().caddr.same_peer(&caddr))
            .unwrap_or(false);
        if matches {
            parked.push(id);
        }
        !matches
    });

    let pending = parked.len() as u32;
    for &id in &parked {
        ep.reqs.get_mut(id).unwrap().send_mut().fc_peer = Some(idx);
    }

    ep.tx.fc_peers[idx] = Some(FcPeer {
        caddr,
        msg_queue: parked,
        pending,
        dropped: 0,
        pending_acks: 0,
        replayed: false,
        ctrl_req,
    });

    debug!(
        "tx: disabled peer {:#x}:{} detected, {} pending",
        caddr.nic, caddr.pid, pending
    );
    idx
}

/// Account for completion of an in-flight send to a disabled peer. The
/// last one triggers the notify carrying the total drop count.
fn fc_peer_put(ep: &mut Ep, idx: usize) -> Result<()> {
    let (pending, dropped, ctrl_req, caddr) = {
        let peer = ep.tx.fc_peers[idx].as_ref().expect("live peer");
        (peer.pending, peer.dropped, peer.ctrl_req, peer.caddr)
    };
    debug_assert!(pending > 0);

    if pending == 1 {
        if let ReqState::Ctrl(c) = &mut ep.reqs.get_mut(ctrl_req).unwrap().state {
            c.drops = dropped;
        }
        crate::ctrl::ctrl_msg_send(ep, ctrl_req)?;
        let peer = ep.tx.fc_peers[idx].as_mut().unwrap();
        peer.pending = 0;
        peer.pending_acks += 1;
        debug!(
            "tx: notified disabled peer {:#x}:{} dropped {}",
            caddr.nic, caddr.pid, dropped
        );
    } else {
        ep.tx.fc_peers[idx].as_mut().unwrap().pending = pending - 1;
    }
    Ok(())
}

/// Remove disabled-peer state once replay is done and acks are in.
pub(crate) fn fc_peer_fini(ep: &mut Ep, idx: usize) {
    let peer = ep.tx.fc_peers[idx].take().expect("live peer");
    debug_assert!(peer.msg_queue.is_empty());
    ep.reqs.free(peer.ctrl_req);
}

/// Notify acknowledgement; the peer frees when replay already completed.
pub(crate) fn fc_notify_ack(ep: &mut Ep, idx: usize, rc: ReturnCode) -> Result<()> {
    match rc {
        ReturnCode::Ok => {
            let (acks, replayed) = {
                let peer = ep.tx.fc_peers[idx].as_mut().expect("live peer");
                peer.pending_acks -= 1;
                (peer.pending_acks, peer.replayed)
            };
            if acks == 0 && replayed {
                fc_peer_fini(ep, idx);
            }
            Ok(())
        }
        // The target's control event queue was full; replay after a delay.
        ReturnCode::EntryNotFound => {
            let ctrl_req = {
                let peer = ep.tx.fc_peers[idx].as_mut().expect("live peer");
                peer.ctrl_req
            };
            if let ReqState::Ctrl(c) = &mut ep.reqs.get_mut(ctrl_req).unwrap().state {
                c.retry_count += 1;
                warn!(
                    "tx: peer dropped notify, retry {} after {}us",
                    c.retry_count, ep.cfg.fc_retry_usec_delay
                );
            }
            std::thread::sleep(std::time::Duration::from_micros(ep.cfg.fc_retry_usec_delay));
            crate::ctrl::ctrl_msg_send(ep, ctrl_req)
        }
        _ => fatal!("tx: unexpected notify ack status {:?}", rc),
    }
}

/// First (or another) drop to a peer.
pub(crate) fn send_req_dropped(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    let caddr = ep.reqs.get(req_id).unwrap().send().caddr;

    let idx = match fc_peer_lookup(ep, caddr) {
        Some(idx) => idx,
        None => fc_peer_init(ep, caddr),
    };

    ep.tx.fc_peers[idx].as_mut().unwrap().dropped += 1;
    match fc_peer_put(ep, idx) {
        Ok(()) => {
            debug!("tx: send {} dropped by {:#x}:{}", req_id, caddr.nic, caddr.pid);
            Ok(())
        }
        Err(e) => {
            ep.tx.fc_peers[idx].as_mut().unwrap().dropped -= 1;
            Err(e)
        }
    }
}

/// Queue a send; refused while its target is disabled.
pub(crate) fn send_req_queue(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    let caddr = ep.reqs.get(req_id).unwrap().send().caddr;
    if fc_peer_lookup(ep, caddr).is_some() {
        // Progress control events so a future attempt may succeed.
        crate::ep::progress_locked(ep);
        return Err(Error::Again);
    }
    ep.tx.msg_queue.push(req_id);
    Ok(())
}

/// Dequeue a send on acknowledgement, updating disabled-peer accounting
/// for in-flight sends that landed after the drop started.
pub(crate) fn send_req_dequeue(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    let fc_peer = ep.reqs.get(req_id).unwrap().send().fc_peer;
    if let Some(idx) = fc_peer {
        debug!("tx: send {} landed at disabled peer", req_id);
        fc_peer_put(ep, idx)?;
        ep.reqs.get_mut(req_id).unwrap().send_mut().fc_peer = None;
        if let Some(peer) = ep.tx.fc_peers[idx].as_mut() {
            peer.msg_queue.retain(|&id| id != req_id);
        }
    }
    ep.tx.msg_queue.retain(|&id| id != req_id);
    Ok(())
}

/// Replay every parked send to a re-enabled peer, in order.
pub(crate) fn fc_resume(ep: &mut Ep, nic: u32, pid: u32) {
    let caddr = FabAddr::new(nic, pid);
    let Some(idx) = fc_peer_lookup(ep, caddr) else {
        fatal!("tx: resume from unknown peer {:#x}:{}", nic, pid);
    };

    debug!("tx: replaying dropped sends to {:#x}:{}", nic, pid);

    let parked = std::mem::take(&mut ep.tx.fc_peers[idx].as_mut().unwrap().msg_queue);
    for req_id in parked {
        // Replays must go out; spin on command-queue pressure.
        loop {
            match send_req(ep, req_id) {
                Ok(()) => break,
                Err(Error::Again) => continue,
                Err(e) => fatal!("tx: replay of {} failed: {}", req_id, e),
            }
        }

        ep.reqs.get_mut(req_id).unwrap().send_mut().fc_peer = None;
        ep.tx.msg_queue.push(req_id);
        debug!("tx: replayed {}", req_id);
    }

    let acks = ep.tx.fc_peers[idx].as_ref().unwrap().pending_acks;
    if acks == 0 {
        fc_peer_fini(ep, idx);
    } else {
        ep.tx.fc_peers[idx].as_mut().unwrap().replayed = true;
    }
}

/// Eager send acknowledgement.
pub(crate) fn send_eager_cb(ep: &mut Ep, req_id: ReqId, ev: &Event) -> Result<()> {
    // On errors Send events can precede the acknowledgement; drop them.
    if ev.event_type == EventType::Send {
        warn!("tx: unexpected Send event rc {:?}", ev.rc);
        return Ok(());
    }
    debug_assert_eq!(ev.event_type, EventType::Ack);

    let match_complete = ep.reqs.get(req_id).unwrap().flags.contains(MsgFlags::MATCH_COMPLETE);
    ep.reqs.get_mut(req_id).unwrap().send_mut().rc = ev.rc;

    // Dropped: park for replay, keep the request alive, no completion.
    if ev.rc == ReturnCode::PtDisabled {
        send_req_dropped(ep, req_id)?;
        park_on_peer(ep, req_id);
        if match_complete {
            let tx_id = ep.reqs.get(req_id).unwrap().send().tx_id;
            ep.tx.tx_ids.free(tx_id);
        }
        return Ok(());
    }

    send_req_dequeue(ep, req_id)?;
    send_buf_fini(ep, req_id);

    // A put that did not match a posted buffer completes only when the
    // target's zero-byte notify arrives.
    if match_complete {
        if ev.rc == ReturnCode::Ok && ev.ptl_list != PtlList::Priority {
            debug!("tx: waiting for match complete on {}", req_id);
            return Ok(());
        }
        debug!("tx: match complete with ack on {}", req_id);
        let tx_id = ep.reqs.get(req_id).unwrap().send().tx_id;
        ep.tx.tx_ids.free(tx_id);
    }

    report_send_completion(ep, req_id, match_complete);
    ep.tx.otx_reqs -= 1;
    ep.reqs.free(req_id);
    Ok(())
}

/// A send acked `PtDisabled` stays queued on its peer; sends already moved
/// at peer-init are in place, later drops land here.
fn park_on_peer(ep: &mut Ep, req_id: ReqId) {
    let caddr = ep.reqs.get(req_id).unwrap().send().caddr;
    let idx = fc_peer_lookup(ep, caddr).expect("peer exists after drop");
    let peer = ep.tx.fc_peers[idx].as_mut().unwrap();
    if !peer.msg_queue.contains(&req_id) {
        peer.msg_queue.push(req_id);
        ep.reqs.get_mut(req_id).unwrap().send_mut().fc_peer = Some(idx);
    }
    ep.tx.msg_queue.retain(|&id| id != req_id);
}

/// Rendezvous put acknowledgement.
pub(crate) fn send_rdzv_put_cb(ep: &mut Ep, req_id: ReqId, ev: &Event) -> Result<()> {
    match ev.event_type {
        EventType::Ack => {
            let rc = ev.rc;
            debug!("tx: rendezvous ack for {} rc {:?}", req_id, rc);

            if rc == ReturnCode::PtDisabled {
                send_req_dropped(ep, req_id)?;
                park_on_peer(ep, req_id);
                let rdzv_id = ep.reqs.get(req_id).unwrap().send().rdzv_id;
                ep.tx.rdzv_ids.free(rdzv_id);
                return Ok(());
            }

            // Accepted: match order is preserved, so recovery need not wait
            // for the pull to finish.
            send_req_dequeue(ep, req_id)?;

            if rc != ReturnCode::Ok {
                ep.reqs.get_mut(req_id).unwrap().send_mut().rc = rc;
                rdzv_send_req_complete(ep, req_id);
            } else {
                rdzv_send_req_event(ep, req_id);
            }
            Ok(())
        }
        EventType::Send => {
            warn!("tx: unexpected Send event rc {:?}", ev.rc);
            Ok(())
        }
        _ => fatal!("tx: unexpected rendezvous send event {:?}", ev.event_type),
    }
}

/// Count an initiator-side rendezvous event; ACK plus source Get complete
/// the send.
pub(crate) fn rdzv_send_req_event(ep: &mut Ep, req_id: ReqId) {
    let done = {
        let send = ep.reqs.get_mut(req_id).unwrap().send_mut();
        send.rdzv_send_events += 1;
        send.rdzv_send_events == 2
    };
    if done {
        rdzv_send_req_complete(ep, req_id);
    }
}

fn rdzv_send_req_complete(ep: &mut Ep, req_id: ReqId) {
    let rdzv_id = ep.reqs.get(req_id).unwrap().send().rdzv_id;
    ep.tx.rdzv_ids.free(rdzv_id);
    send_buf_fini(ep, req_id);
    report_send_completion(ep, req_id, true);
    ep.tx.otx_reqs -= 1;
    ep.reqs.free(req_id);
}

/// Zero-byte-put portal events on the sender: rendezvous-done notifies and
/// match-complete notifies route back to their sends by id.
pub(crate) fn zbp_cb(ep: &mut Ep, _req_id: ReqId, ev: &Event) -> Result<()> {
    match ev.event_type {
        EventType::Link => Ok(()),
        EventType::Put => {
            let mb = ev.match_bits;

            if mb.rdzv_done() {
                let rdzv_id = mb.zbp_rdzv_id();
                let Some(put_req) = ep.tx.rdzv_ids.lookup(rdzv_id) else {
                    warn!("tx: no rendezvous id {} for done notify", rdzv_id);
                    return Ok(());
                };
                if ev.rc != ReturnCode::Ok {
                    warn!("tx: rendezvous done error on {} rc {:?}", put_req, ev.rc);
                }
                ep.reqs.get_mut(put_req).unwrap().send_mut().rc = ev.rc;
                rdzv_send_req_event(ep, put_req);
                return Ok(());
            }

            // Match complete.
            let tx_id = mb.tx_id();
            let Some(put_req) = ep.tx.tx_ids.lookup(tx_id) else {
                warn!("tx: no transaction id {} for match complete", tx_id);
                return Ok(());
            };
            if ev.rc != ReturnCode::Ok {
                warn!("tx: match-complete notify error on {} rc {:?}", put_req, ev.rc);
            }

            send_req_dequeue(ep, put_req)?;
            ep.tx.tx_ids.free(tx_id);

            // The notify is ordered after the eager ack, so the transfer is
            // done; the engine owns counters on this path.
            report_send_completion(ep, put_req, true);
            ep.tx.otx_reqs -= 1;
            ep.reqs.free(put_req);
            Ok(())
        }
        _ => fatal!("tx: unexpected zero-byte-put event {:?}", ev.event_type),
    }
}

/// Rendezvous source-window events: the target's Get completes the send
/// together with the ACK.
pub(crate) fn rdzv_src_cb(ep: &mut Ep, _req_id: ReqId, ev: &Event) -> Result<()> {
    match ev.event_type {
        EventType::Link => Ok(()),
        EventType::Get => {
            let rdzv_id = ev.match_bits.zbp_rdzv_id();
            let Some(get_req) = ep.tx.rdzv_ids.lookup(rdzv_id) else {
                warn!("tx: no rendezvous id {} for source get", rdzv_id);
                return Ok(());
            };
            if ev.rc != ReturnCode::Ok {
                warn!("tx: source get error on {} rc {:?}", get_req, ev.rc);
            }
            ep.reqs.get_mut(get_req).unwrap().send_mut().rc = ev.rc;
            rdzv_send_req_event(ep, get_req);
            Ok(())
        }
        _ => fatal!("tx: unexpected source-window event {:?}", ev.event_type),
    }
}

/// Common send entry point for tagged and untagged payloads of all sizes.
#[allow(clippy::too_many_arguments)]
pub(crate) fn send_common(
    ep: &mut Ep,
    buf: u64,
    len: usize,
    dest_addr: u64,
    tag: u64,
    data: u64,
    context: u64,
    flags: MsgFlags,
    tagged: bool,
    triggered: bool,
    trig_thresh: u64,
) -> Result<()> {
    if len > 0 && buf == 0 {
        return Err(Error::InvalidArg("non-zero length with null buffer"));
    }
    if len > ep.cfg.max_msg_size {
        return Err(Error::MsgSize { len, max: ep.cfg.max_msg_size });
    }
    if tagged && tag & !ep.cfg.tag_mask != 0 {
        return Err(Error::InvalidTag { tag, mask: ep.cfg.tag_mask });
    }
    if flags.contains(MsgFlags::INJECT) && len > ep.cfg.inject_size {
        return Err(Error::MsgSize { len, max: ep.cfg.inject_size });
    }

    // Outstanding requests are bounded by the queue size.
    if ep.tx.otx_reqs + 1 > ep.tx.max_otx {
        return Err(Error::Again);
    }

    let caddr = ep.av.lookup_addr(dest_addr).ok_or(Error::AddrNotAvail)?;

    let req_id = ep.reqs.alloc(
        ReqCallback::SendEager,
        ReqState::Send(SendReq::new(caddr, dest_addr, buf, len)),
    );
    ep.tx.otx_reqs += 1;

    {
        let req = ep.reqs.get_mut(req_id).unwrap();
        req.context = context;
        req.flags = MsgFlags::SEND
            | (flags & (MsgFlags::COMPLETION | MsgFlags::MATCH_COMPLETE))
            | (flags & (MsgFlags::INJECT | MsgFlags::REMOTE_CQ_DATA | MsgFlags::FENCE | MsgFlags::MORE));
        req.flags |= if tagged { MsgFlags::TAGGED } else { MsgFlags::MSG };
        let send = req.send_mut();
        send.tag = tag;
        send.tagged = tagged;
        send.data = data;
        send.triggered = triggered;
        send.trig_thresh = trig_thresh;
    }

    fn cleanup(ep: &mut Ep, req_id: ReqId, e: Error) -> Result<()> {
        send_buf_fini(ep, req_id);
        ep.tx.otx_reqs -= 1;
        ep.reqs.free(req_id);
        Err(e)
    }

    if let Err(e) = send_buf_init(ep, req_id) {
        return cleanup(ep, req_id, e);
    }

    if ep.nic.eq_saturated() {
        debug!("tx: event queue saturated");
        return cleanup(ep, req_id, Error::Again);
    }

    if let Err(e) = send_req_queue(ep, req_id) {
        debug!("tx: target peer disabled");
        return cleanup(ep, req_id, e);
    }

    if let Err(e) = send_req(ep, req_id) {
        let _ = send_req_dequeue(ep, req_id);
        return cleanup(ep, req_id, e);
    }

    debug!(
        "tx: send {} len {} to {:#x}:{} tag({}) {:#x}",
        req_id,
        len,
        caddr.nic,
        caddr.pid,
        if tagged { '*' } else { '-' },
        tag
    );
    Ok(())
}
