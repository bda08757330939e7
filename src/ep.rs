//! Endpoint aggregate and event demultiplexer.
//!
//! One endpoint owns one receive context, one transmit context, the
//! request table and the device handle. A single lock serializes posts,
//! sends and event processing; no handler suspends, and a handler that
//! cannot progress has its event re-presented on the next progress call.

use std::sync::Mutex;

use log::warn;

use crate::addr::{self, AddressVector, FabAddr};
use crate::config::MsgConfig;
use crate::cq::Completion;
use crate::ctrl;
use crate::error::{fatal, Error, Result};
use crate::fc::{self, RxState};
use crate::nic::{Event, EventType, Nic, PtlteState, TargetPte};
use crate::req::{MsgFlags, ReqCallback, ReqId, ReqState, ReqTable};
use crate::rx::{self, RxCtx};
use crate::tx::{self, TxCtx};

/// Events drained per progress call.
const EVENT_BATCH: usize = 32;

/// Endpoint state; every field is reached under the endpoint lock.
pub(crate) struct Ep {
    pub cfg: MsgConfig,
    pub pid_bits: u32,
    pub src_addr: FabAddr,
    fi_addr: Option<u64>,
    pub av: Box<dyn AddressVector>,
    pub nic: Box<dyn Nic>,
    pub reqs: ReqTable,
    pub rx: RxCtx,
    pub tx: TxCtx,
}

impl Ep {
    /// Initiator match id stamped into outgoing messages.
    ///
    /// With symmetric vectors the logical address rides in the NIC part so
    /// the target skips reverse translation.
    pub(crate) fn msg_match_id(&mut self) -> u32 {
        if self.av.symmetric() {
            let fi_addr = match self.fi_addr {
                Some(a) => a,
                None => {
                    let a = self
                        .av
                        .lookup_fi_addr(self.src_addr)
                        .unwrap_or(addr::FI_ADDR_NOTAVAIL);
                    self.fi_addr = Some(a);
                    a
                }
            };
            return addr::match_id(self.pid_bits, self.src_addr.pid, fi_addr as u32);
        }
        addr::match_id(self.pid_bits, self.src_addr.pid, self.src_addr.nic)
    }

}

/// Dispatch one event to the handler its request is bound to.
fn process_event(ep: &mut Ep, ev: &Event) -> Result<()> {
    // State changes carry no request.
    if ev.event_type == EventType::StateChange {
        fc::pte_state_change(ep, ev);
        return Ok(());
    }

    let cb = match ep.reqs.get(ev.buffer_id) {
        Some(req) => req.cb,
        None => fatal!(
            "ep: event {:?} for unknown request {}",
            ev.event_type,
            ev.buffer_id
        ),
    };

    match cb {
        ReqCallback::Recv => rx::recv_cb(ep, ev.buffer_id, ev),
        ReqCallback::NotifyMatch => rx::notify_match_cb(ep, ev.buffer_id, ev),
        ReqCallback::Oflow => rx::oflow_cb(ep, ev.buffer_id, ev),
        ReqCallback::ReqBuf => rx::req_buf_cb(ep, ev.buffer_id, ev),
        ReqCallback::UxOnload => fc::ux_onload_cb(ep, ev.buffer_id, ev),
        ReqCallback::FlushAppends => fc::flush_appends_cb(ep, ev.buffer_id, ev),
        ReqCallback::Peek => rx::ux_peek_cb(ep, ev.buffer_id, ev),
        ReqCallback::ClaimOffset => rx::hw_claim_offset_cb(ep, ev.buffer_id, ev),
        ReqCallback::ClaimOnload => rx::claim_onload_cb(ep, ev.buffer_id, ev),
        ReqCallback::SendEager => tx::send_eager_cb(ep, ev.buffer_id, ev),
        ReqCallback::SendRdzv => tx::send_rdzv_put_cb(ep, ev.buffer_id, ev),
        ReqCallback::RdzvSrc => tx::rdzv_src_cb(ep, ev.buffer_id, ev),
        ReqCallback::Zbp => tx::zbp_cb(ep, ev.buffer_id, ev),
        ReqCallback::Ctrl => ctrl::ctrl_ack_cb(ep, ev.buffer_id, ev),
        ReqCallback::CtrlPte => ctrl::ctrl_msg_cb(ep, ev.buffer_id, ev),
    }
}

/// Drain a bounded batch of events. An event whose handler returns
/// try-later is re-presented and the batch ends.
pub(crate) fn progress_locked(ep: &mut Ep) -> usize {
    let mut handled = 0;
    for _ in 0..EVENT_BATCH {
        let Some(ev) = ep.nic.pop_event() else { break };
        match process_event(ep, &ev) {
            Ok(()) => handled += 1,
            Err(Error::Again) => {
                ep.nic.unpop_event(ev);
                break;
            }
            Err(e) => fatal!("ep: event handler failed: {}", e),
        }
    }
    handled
}

/// A two-sided messaging endpoint.
///
/// Thin wrapper serializing all operations through one lock; parallelism
/// comes from multiple endpoints.
pub struct Endpoint {
    inner: Mutex<Ep>,
}

impl Endpoint {
    /// Build and enable an endpoint.
    pub fn new(
        nic: Box<dyn Nic>,
        av: Box<dyn AddressVector>,
        src_addr: FabAddr,
        pid_bits: u32,
        cfg: MsgConfig,
    ) -> Result<Self> {
        cfg.validate()?;

        let mut ep = Ep {
            rx: RxCtx::new(&cfg),
            tx: TxCtx::new(&cfg),
            cfg,
            pid_bits,
            src_addr,
            fi_addr: None,
            av,
            nic,
            reqs: ReqTable::new(),
        };

        // Bind the sender-side portals the protocol notifies through.
        let zbp_req = ep.reqs.alloc(ReqCallback::Zbp, ReqState::ZeroByte);
        ep.nic.bind_portal(TargetPte::Zbp, zbp_req);
        let ctrl_req = ep.reqs.alloc(ReqCallback::CtrlPte, ReqState::ZeroByte);
        ep.nic.bind_portal(TargetPte::Ctrl, ctrl_req);

        // Enable the receive portal in the configured mode.
        if ep.rx.msg_offload {
            let (nic, reqs) = (&mut ep.nic, &mut ep.reqs);
            ep.rx.oflow_pool.replenish(nic.as_mut(), reqs)?;
            ep.nic.pte_set_state(PtlteState::Enabled, 0)?;
        } else {
            let (nic, reqs) = (&mut ep.nic, &mut ep.reqs);
            ep.rx.req_pool.replenish(nic.as_mut(), reqs)?;
            ep.nic.pte_set_state(PtlteState::SoftwareManaged, 0)?;
        }

        // The state change is an event; drain until it lands.
        let mut spins = 0;
        while !matches!(ep.rx.state, RxState::Enabled | RxState::EnabledSoftware) {
            progress_locked(&mut ep);
            spins += 1;
            if spins > 1000 {
                return Err(Error::BadState);
            }
        }

        Ok(Self { inner: Mutex::new(ep) })
    }

    /// Post a receive.
    ///
    /// # Safety contract
    /// `buf` must stay valid and unaliased until the matching completion is
    /// drained from the receive completion queue.
    #[allow(clippy::too_many_arguments)]
    pub fn recv(
        &self,
        buf: *mut u8,
        len: usize,
        src_addr: u64,
        tag: u64,
        ignore: u64,
        context: u64,
        flags: MsgFlags,
        tagged: bool,
    ) -> Result<()> {
        let ep = &mut *self.inner.lock().unwrap();
        rx::recv_common(ep, buf as u64, len, src_addr, tag, ignore, context, flags, tagged)
    }

    /// Send a payload.
    ///
    /// # Safety contract
    /// Unless `INJECT` is set, `buf` must stay valid until the send
    /// completion is drained.
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &self,
        buf: *const u8,
        len: usize,
        dest_addr: u64,
        tag: u64,
        data: u64,
        context: u64,
        flags: MsgFlags,
        tagged: bool,
    ) -> Result<()> {
        let ep = &mut *self.inner.lock().unwrap();
        tx::send_common(ep, buf as u64, len, dest_addr, tag, data, context, flags, tagged, false, 0)
    }

    /// Inject a payload: the buffer is reusable on return.
    pub fn inject(
        &self,
        buf: *const u8,
        len: usize,
        dest_addr: u64,
        tag: u64,
        tagged: bool,
    ) -> Result<()> {
        let ep = &mut *self.inner.lock().unwrap();
        tx::send_common(
            ep,
            buf as u64,
            len,
            dest_addr,
            tag,
            0,
            0,
            MsgFlags::INJECT,
            tagged,
            false,
            0,
        )
    }

    /// Cancel an outstanding receive posted with `context`.
    ///
    /// Software-queued receives report the cancel synchronously; hardware
    /// entries complete on the unlink event.
    pub fn cancel(&self, context: u64) -> Result<()> {
        let ep = &mut *self.inner.lock().unwrap();

        let found = ep
            .rx
            .sw_recv_queue
            .iter()
            .copied()
            .find(|&id| ep.reqs.get(id).map(|r| r.context == context).unwrap_or(false))
            .or_else(|| find_recv_by_context(ep, context));

        match found {
            Some(req_id) => rx::recv_cancel(ep, req_id),
            None => Err(Error::NoMsg),
        }
    }

    /// Make progress: drain a bounded batch of device events.
    pub fn progress(&self) -> usize {
        let ep = &mut *self.inner.lock().unwrap();
        progress_locked(ep)
    }

    /// Drain one receive completion.
    pub fn recv_completion(&self) -> Option<Completion> {
        self.inner.lock().unwrap().rx.cq.pop()
    }

    /// Drain one send completion.
    pub fn send_completion(&self) -> Option<Completion> {
        self.inner.lock().unwrap().tx.cq.pop()
    }

    /// Receive counter totals (successes, failures).
    pub fn recv_counters(&self) -> (u64, u64) {
        let ep = self.inner.lock().unwrap();
        (ep.rx.cntr.success(), ep.rx.cntr.failure())
    }

    /// Send counter totals (successes, failures).
    pub fn send_counters(&self) -> (u64, u64) {
        let ep = self.inner.lock().unwrap();
        (ep.tx.cntr.success(), ep.tx.cntr.failure())
    }

    /// Current receive-side state, for diagnostics.
    pub fn rx_state(&self) -> RxState {
        self.inner.lock().unwrap().rx.state
    }

    /// Disable the receive portal and release buffer pools.
    ///
    /// Outstanding deferred events release their overflow bytes; the
    /// deferred table must drain empty.
    pub fn close(&self) -> Result<()> {
        let ep = &mut *self.inner.lock().unwrap();

        if matches!(ep.rx.state, RxState::Enabled | RxState::EnabledSoftware) {
            ep.rx.state = RxState::Disabled;
            ep.nic.pte_set_state(PtlteState::Disabled, 0)?;
            progress_locked(ep);
        }

        // No more events can arrive; resolve residual deferred pairs.
        for def_ev in ep.rx.deferred.drain_all() {
            if let Some(req) = ep.reqs.get(def_ev.req) {
                if req.cb == ReqCallback::Oflow {
                    let buf_index = req.oflow().buf_index;
                    let (nic, reqs) = (&mut ep.nic, &mut ep.reqs);
                    ep.rx
                        .oflow_pool
                        .put_bytes(buf_index, def_ev.ev.mlength, nic.as_mut(), reqs);
                }
            }
        }

        if ep.rx.oflow_pool.fini(ep.nic.as_mut()).is_err() {
            warn!("ep: overflow pool teardown incomplete");
        }
        if ep.rx.req_pool.fini(ep.nic.as_mut()).is_err() {
            warn!("ep: request-list pool teardown incomplete");
        }
        progress_locked(ep);

        let s = &ep.rx.stats;
        log::info!(
            "ep: fc stats - eq full: {} append fail: {} no match: {} request full: {} \
             unexpected: {} hw2sw unexpected: {} hw2sw append fail: {}",
            s.eq_full, s.append_fail, s.no_match, s.request_full, s.unexpected_fail,
            s.hw2sw_unexp, s.hw2sw_append_fail
        );
        Ok(())
    }
}

fn find_recv_by_context(ep: &Ep, context: u64) -> Option<ReqId> {
    ep.reqs.iter_ids().find(|&id| {
        let req = ep.reqs.get(id).unwrap();
        req.cb == ReqCallback::Recv
            && matches!(req.state, ReqState::Recv(_))
            && req.context == context
            && req.flags.contains(MsgFlags::RECV)
    })
}
