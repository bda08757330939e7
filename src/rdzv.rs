//! Rendezvous coordinator.
//!
//! A rendezvous receive completes after three target events in any order:
//! (Put or Put-Overflow), Rendezvous, Reply. The restricted-read protocol
//! adds a fourth, the ACK of the done-notify. Multi-receive buffers track
//! each rendezvous transaction in a child request keyed by (initiator,
//! rendezvous id); the coordinator creates children on first sight and
//! counts events until the set completes.

use log::{debug, warn};

use crate::addr::{self, AddressVector};
use crate::config::RdzvProto;
use crate::ep::Ep;
use crate::error::{fatal, Error, Result};
use crate::match_bits::{LeType, MatchBits, RDZV_ID_CMD_WIDTH};
use crate::nic::{Event, EventType, GetCmd, Nic, PutCmd, ReturnCode, TargetPte};
use crate::req::ReqId;
use crate::rx;

/// Dense allocator for small protocol ids (rendezvous and transaction ids).
///
/// Each live id maps back to the request that owns it.
#[derive(Debug)]
pub struct IdPool {
    free: Vec<u16>,
    next: u16,
    max: u16,
    owners: std::collections::HashMap<u16, ReqId>,
}

impl IdPool {
    pub fn new(max: u16) -> Self {
        Self {
            free: Vec::new(),
            next: 0,
            max,
            owners: std::collections::HashMap::new(),
        }
    }

    pub fn alloc(&mut self, owner: ReqId) -> Option<u16> {
        let id = match self.free.pop() {
            Some(id) => id,
            None if self.next < self.max => {
                let id = self.next;
                self.next += 1;
                id
            }
            None => return None,
        };
        self.owners.insert(id, owner);
        Some(id)
    }

    pub fn lookup(&self, id: u16) -> Option<ReqId> {
        self.owners.get(&id).copied()
    }

    pub fn free(&mut self, id: u16) {
        if self.owners.remove(&id).is_some() {
            self.free.push(id);
        }
    }

    #[inline]
    pub fn live(&self) -> usize {
        self.owners.len()
    }
}

/// Extract (initiator, rendezvous id) from an event for child matching.
fn event_rdzv_key(ep: &Ep, ev: &Event) -> (u32, u16) {
    let (mut init, id) = match ev.event_type {
        // Rendezvous events encode the initiator as the DFA to pull from.
        EventType::Rendezvous => (
            addr::dfa_to_init(ev.initiator, ep.pid_bits),
            ev.rdzv_id(),
        ),
        EventType::Reply => (ev.initiator, ev.rendezvous_id),
        _ => (ev.initiator, ev.rdzv_id()),
    };

    // Put events carry a logical initiator under symmetric vectors; child
    // keys store the physical form the Rendezvous event uses.
    if matches!(ev.event_type, EventType::Put | EventType::PutOverflow) && ep.av.symmetric() {
        let fi_addr = addr::match_id_ep(ep.pid_bits, init) as u64;
        let caddr = match ep.av.lookup_addr(fi_addr) {
            Some(c) => c,
            None => fatal!("rdzv: lookup of fabric address {:#x} failed", fi_addr),
        };
        init = addr::match_id(ep.pid_bits, addr::match_id_pid(ep.pid_bits, init), caddr.nic);
    }

    (init, id)
}

/// Find the multi-receive child matching an event.
///
/// `check_events` detects rendezvous-id reuse: when the same event type
/// appears twice on one child, the initiator queue must drain first and the
/// event is re-presented.
pub(crate) fn mrecv_req_lookup(
    ep: &Ep,
    parent_id: ReqId,
    ev: &Event,
    check_events: bool,
) -> Result<(ReqId, u32, u16)> {
    // A Reply for a software-issued get already references the child.
    if ev.event_type == EventType::Reply && !ev.rendezvous {
        return Ok((parent_id, 0, 0));
    }

    let (init, rdzv_id) = event_rdzv_key(ep, ev);

    let parent = ep.reqs.get(parent_id).unwrap().recv();
    for &child_id in &parent.children {
        let child = ep.reqs.get(child_id).unwrap().recv();
        if child.rdzv_id == rdzv_id && child.rdzv_initiator == init {
            if check_events {
                // The source reused a rendezvous id before the Reply was
                // processed; drain the transmit queue first.
                for i in 0..child.rdzv_events as usize {
                    if child.rdzv_event_types[i] == Some(ev.event_type) {
                        debug_assert!(ev.event_type != EventType::Reply);
                        return Err(Error::Again);
                    }
                }
            }
            return Ok((child_id, init, rdzv_id));
        }
    }

    Err(Error::NoMsg)
}

/// Look up or create the child request for a rendezvous event on a
/// multi-receive buffer. Returns None when the event must be re-presented.
pub(crate) fn mrecv_req_event(ep: &mut Ep, parent_id: ReqId, ev: &Event) -> Option<ReqId> {
    debug_assert!(matches!(
        ev.event_type,
        EventType::Reply | EventType::Put | EventType::PutOverflow | EventType::Rendezvous
    ));

    match mrecv_req_lookup(ep, parent_id, ev, true) {
        Err(Error::Again) => None,
        Err(Error::NoMsg) => {
            let (init, rdzv_id) = event_rdzv_key(ep, ev);
            let child_id = rx::mrecv_dup(ep, parent_id);
            let recv = ep.reqs.get_mut(child_id).unwrap().recv_mut();
            recv.rdzv_id = rdzv_id;
            recv.rdzv_initiator = init;
            debug!("rdzv: new child {} of parent {}", child_id, parent_id);
            Some(child_id)
        }
        Ok((child_id, _, _)) => {
            debug!("rdzv: found child {} of parent {}", child_id, parent_id);
            Some(child_id)
        }
        Err(e) => fatal!("rdzv: unhandled child lookup result {}", e),
    }
}

/// Child lookup without event checks, for software matches where the same
/// stored event drives both the copy and the synthesized rendezvous count.
pub(crate) fn mrecv_child_lookup(ep: &Ep, parent_id: ReqId, ev: &Event) -> Option<ReqId> {
    mrecv_req_lookup(ep, parent_id, ev, false).ok().map(|(id, _, _)| id)
}

/// Count a rendezvous event; complete the receive when the set is full.
pub(crate) fn recv_req_event(ep: &mut Ep, req_id: ReqId, ev_type: EventType) {
    let complete = {
        let recv = ep.reqs.get_mut(req_id).unwrap().recv_mut();
        let total = if recv.done_notify { 4 } else { 3 };
        recv.rdzv_event_types[recv.rdzv_events as usize] = Some(ev_type);
        recv.rdzv_events += 1;
        recv.rdzv_events == total
    };

    if complete {
        rx::report_and_free(ep, req_id);
    }
}

/// Pull the non-eager payload from the initiator.
///
/// The eager head is already in place, so the local address starts past it;
/// both sides of the transfer shift down for cache-line alignment.
pub(crate) fn issue_rdzv_get(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    let (proto, lac, rdzv_id, rget_nic, rget_pid, src_offset, data_len, mut mlen, recv_buf, md) = {
        let req = ep.reqs.get(req_id).unwrap();
        let r = req.recv();
        (
            r.rdzv_proto,
            r.rdzv_lac,
            r.rdzv_id,
            r.rget_nic,
            r.rget_pid,
            r.src_offset,
            req.data_len,
            r.rdzv_mlen,
            r.recv_buf,
            r.recv_md.or_else(|| {
                // Children borrow the parent's registration.
                r.parent
                    .and_then(|p| ep.reqs.get(p).map(|pr| pr.recv().recv_md))
                    .flatten()
            }),
        )
    };

    let mut mb = MatchBits::new();
    let restricted = proto == RdzvProto::AltRead as u8;
    if restricted {
        ep.reqs.get_mut(req_id).unwrap().recv_mut().done_notify = true;
    } else {
        mb.set_rdzv_lac(lac);
        mb.set_rdzv_id_lo(rdzv_id & ((1 << RDZV_ID_CMD_WIDTH) - 1));
        mb.set_rdzv_id_hi(rdzv_id >> RDZV_ID_CMD_WIDTH);
    }

    let mut local_addr = md.map(|m| m.iova).unwrap_or(recv_buf);
    if md.is_some() {
        // The registration covers the parent buffer; offset to this match.
        let base = ep
            .reqs
            .get(req_id)
            .unwrap()
            .recv()
            .parent
            .map(|p| ep.reqs.get(p).unwrap().recv().recv_buf)
            .unwrap_or(recv_buf);
        local_addr += recv_buf - base;
    }
    local_addr += mlen as u64;
    let mut rem_offset = src_offset;

    debug!(
        "rdzv: get addr {:#x} len {} rem {:#x} restricted {}",
        local_addr,
        data_len.saturating_sub(mlen),
        rem_offset,
        restricted
    );

    // Align the local address down to a cache line, shifting the remote
    // offset and eager length by the same amount.
    if mlen as u64 >= ep.cfg.rget_align_mask {
        let align_bytes = local_addr & ep.cfg.rget_align_mask;
        local_addr -= align_bytes;
        rem_offset -= align_bytes;
        mlen -= align_bytes as usize;
    }

    let request_len = data_len.saturating_sub(mlen);

    ep.nic.dma_get(GetCmd {
        nic: rget_nic,
        pid: rget_pid,
        buffer_id: req_id,
        match_bits: mb,
        local_addr,
        remote_offset: rem_offset,
        len: request_len,
        restricted,
    })?;
    ep.nic.ring();

    Ok(())
}

/// Send the rendezvous-done notify back to the initiator.
///
/// Restricted gets generate no matching event at the source, so the target
/// tells the initiator explicitly that the transfer finished.
pub(crate) fn rdzv_done_notify(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    let (rdzv_id, nic, pid) = {
        let r = ep.reqs.get(req_id).unwrap().recv();
        (r.rdzv_id, r.rget_nic, r.rget_pid)
    };

    let mut mb = MatchBits::new();
    mb.set_rdzv_id_lo(rdzv_id & ((1 << RDZV_ID_CMD_WIDTH) - 1));
    mb.set_rdzv_id_hi(rdzv_id >> RDZV_ID_CMD_WIDTH);
    mb.set_rdzv_done(true);
    mb.set_le_type(LeType::Zbp);

    let initiator = ep.msg_match_id();
    ep.nic.dma_put(PutCmd {
        nic,
        pid,
        pte: TargetPte::Zbp,
        buffer_id: req_id,
        match_bits: mb,
        header_data: 0,
        initiator,
        addr: 0,
        len: 0,
        eager_length: 0,
        rendezvous_id: 0,
        remote_offset: 0,
    })?;
    ep.nic.ring();

    debug!("rdzv: done notify sent for id {}", rdzv_id);
    Ok(())
}

/// Rendezvous receive event callback.
pub(crate) fn recv_rdzv_cb(ep: &mut Ep, req_id: ReqId, ev: &Event) -> Result<()> {
    match ev.event_type {
        // On errors, Send events can precede the put/get event; drop them.
        EventType::Send => {
            warn!("rdzv: unexpected Send event rc {:?}", ev.rc);
            Ok(())
        }
        EventType::PutOverflow => {
            // Unexpected header matched; pair with the Put or defer.
            let (matched, handle) = ep.rx.deferred.match_put_event(req_id, ev);

            let mrecv_start = ep.reqs.get(req_id).unwrap().recv().start_offset;
            let mrecv_len = rx::mrecv_put_bytes(ep, req_id, ev.rlength);
            {
                let def_ev = ep.rx.deferred.get_mut(handle);
                def_ev.mrecv_start = mrecv_start;
                def_ev.mrecv_len = mrecv_len;
            }

            let multi_recv = ep.reqs.get(req_id).unwrap().recv().multi_recv;
            if multi_recv && ev.auto_unlinked {
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
            match rx::ux_send(ep, req_id, Some(def_req), &put_ev, mrecv_start, mrecv_len, false) {
                Ok(()) => {
                    ep.rx.deferred.remove(handle);
                    Ok(())
                }
                Err(e) => {
                    ep.reqs.get_mut(req_id).unwrap().recv_mut().start_offset -= mrecv_len;
                    ep.rx.orx_hw_ule_cnt += 1;
                    Err(e)
                }
            }
        }
        EventType::Put => {
            // Eager bytes delivered straight into the user buffer.
            let mut target = req_id;
            let multi_recv = ep.reqs.get(req_id).unwrap().recv().multi_recv
                && ep.reqs.get(req_id).unwrap().recv().parent.is_none();
            if multi_recv {
                if ev.auto_unlinked {
                    let (recv_buf, ulen) = {
                        let r = ep.reqs.get(req_id).unwrap().recv();
                        (r.recv_buf, r.ulen)
                    };
                    let head = ev.start;
                    let remaining = (recv_buf + ulen as u64 - head) as usize;
                    let rlen = remaining.min(ev.rlength);
                    let recv = ep.reqs.get_mut(req_id).unwrap().recv_mut();
                    recv.auto_unlinked = true;
                    recv.mrecv_unlink_bytes = (head - recv.recv_buf) as usize + rlen;
                }

                target = mrecv_req_event(ep, req_id, ev).ok_or(Error::Again)?;
            }

            rx::recv_req_tgt_event(ep, target, ev);
            recv_req_event(ep, target, EventType::Put);
            Ok(())
        }
        EventType::Rendezvous => {
            let mut target = req_id;
            let multi_recv = ep.reqs.get(req_id).unwrap().recv().multi_recv
                && ep.reqs.get(req_id).unwrap().recv().parent.is_none();
            if multi_recv {
                target = mrecv_req_event(ep, req_id, ev).ok_or(Error::Again)?;

                // The Rendezvous event locates the matched piece of the
                // parent buffer: start points past the eager head.
                let (parent_buf, parent_ulen) = {
                    let r = ep.reqs.get(req_id).unwrap().recv();
                    (r.recv_buf, r.ulen)
                };
                let buf = ev.start - ev.mlength as u64;
                let remaining = (parent_buf + parent_ulen as u64 - buf) as usize;
                let req = ep.reqs.get_mut(target).unwrap();
                req.buf = buf;
                req.data_len = remaining.min(ev.rlength);
                req.recv_mut().recv_buf = buf;
            } else {
                let req = ep.reqs.get_mut(target).unwrap();
                req.data_len = req.recv().ulen.min(ev.rlength);
            }

            rx::recv_req_tgt_event(ep, target, ev);

            if !ev.get_issued {
                // The NIC did not start the pull; do it from software under
                // a TX credit.
                if ep.rx.orx_tx_reqs + 1 > ep.rx.max_tx {
                    undo_mrecv_child(ep, target, multi_recv);
                    return Err(Error::Again);
                }
                ep.rx.orx_tx_reqs += 1;

                if issue_rdzv_get(ep, target).is_err() {
                    ep.rx.orx_tx_reqs -= 1;
                    undo_mrecv_child(ep, target, multi_recv);
                    return Err(Error::Again);
                }
                debug!("rdzv: software get issued for {}", target);
            }

            recv_req_event(ep, target, EventType::Rendezvous);
            Ok(())
        }
        EventType::Reply => {
            let mut target = req_id;
            let multi_recv = ep.reqs.get(req_id).unwrap().recv().multi_recv
                && ep.reqs.get(req_id).unwrap().recv().parent.is_none();
            if multi_recv {
                target = mrecv_req_event(ep, req_id, ev).ok_or(Error::Again)?;
            }

            // Restricted protocol: the initiator learns of completion from
            // an explicit notify, acknowledged before the receive reports.
            if ep.reqs.get(target).unwrap().recv().done_notify {
                if ep.rx.orx_tx_reqs + 1 > ep.rx.max_tx {
                    return Err(Error::Again);
                }
                ep.rx.orx_tx_reqs += 1;
                if rdzv_done_notify(ep, target).is_err() {
                    ep.rx.orx_tx_reqs -= 1;
                    return Err(Error::Again);
                }
            }

            ep.reqs.get_mut(target).unwrap().recv_mut().rc = ev.rc;
            recv_req_event(ep, target, EventType::Reply);

            // A software-issued get returns its TX credit here.
            if !ev.rendezvous {
                debug_assert!(ep.rx.orx_tx_reqs > 0);
                ep.rx.orx_tx_reqs -= 1;
            }
            Ok(())
        }
        EventType::Ack => {
            // Done-notify acknowledgement.
            if ev.rc == ReturnCode::EntryNotFound {
                // Target event queue was full; retry after a short delay,
                // reusing the credit already held.
                std::thread::sleep(std::time::Duration::from_micros(ep.cfg.fc_retry_usec_delay));
                if rdzv_done_notify(ep, req_id).is_err() {
                    return Err(Error::Again);
                }
                return Ok(());
            }

            if ev.rc != ReturnCode::Ok {
                warn!("rdzv: bad done-notify ack status {:?}", ev.rc);
            }

            // The ACK status folds into the target-side completion so a
            // failure does not go undetected.
            ep.reqs.get_mut(req_id).unwrap().recv_mut().rc = ev.rc;
            debug_assert!(ep.rx.orx_tx_reqs > 0);
            ep.rx.orx_tx_reqs -= 1;
            recv_req_event(ep, req_id, EventType::Ack);
            Ok(())
        }
        _ => fatal!("rdzv: unexpected event {:?} rc {:?}", ev.event_type, ev.rc),
    }
}

/// Roll back a child created for an event that could not progress.
fn undo_mrecv_child(ep: &mut Ep, child_id: ReqId, multi_recv: bool) {
    if !multi_recv {
        return;
    }
    let fresh = ep.reqs.get(child_id).unwrap().recv().rdzv_events == 0;
    if fresh {
        rx::free_child(ep, child_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_pool_exhaustion_and_reuse() {
        let mut pool = IdPool::new(2);
        let a = pool.alloc(10).unwrap();
        let b = pool.alloc(20).unwrap();
        assert_ne!(a, b);
        assert!(pool.alloc(30).is_none());

        assert_eq!(pool.lookup(a), Some(10));
        pool.free(a);
        assert_eq!(pool.lookup(a), None);

        let c = pool.alloc(30).unwrap();
        assert_eq!(c, a);
        assert_eq!(pool.lookup(c), Some(30));
    }

    #[test]
    fn test_event_count_completes_at_three() {
        let mut ep = crate::ep::test_support::test_ep();
        let req_id = rx::recv_req_alloc(&mut ep, 0, 0).unwrap();
        {
            let req = ep.reqs.get_mut(req_id).unwrap();
            req.data_len = 0;
            req.flags = crate::req::MsgFlags::RECV | crate::req::MsgFlags::COMPLETION;
            let recv = req.recv_mut();
            recv.rlen = 0;
            recv.rc = ReturnCode::Ok;
        }

        recv_req_event(&mut ep, req_id, EventType::Put);
        recv_req_event(&mut ep, req_id, EventType::Rendezvous);
        assert!(ep.reqs.get(req_id).is_some());

        recv_req_event(&mut ep, req_id, EventType::Reply);
        assert!(ep.reqs.get(req_id).is_none(), "request frees on the third event");
        assert_eq!(ep.rx.cq.len(), 1);
    }
}
