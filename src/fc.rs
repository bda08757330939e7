//! Receive-side flow control.
//!
//! When the NIC disables the receive portal (list entries exhausted, event
//! queue full, overflow buffers spent), the engine onloads the hardware
//! unexpected list into software, replenishes what can be replenished,
//! replays failed appends, and re-enables once its drop count agrees with
//! the NIC's. Peers that had sends dropped report their counts through
//! control messages; the receiver resumes them all after re-enable so
//! replay preserves per-peer ordering.

use log::{debug, warn};

use crate::addr;
use crate::config::MatchMode;
use crate::ep::Ep;
use crate::error::{fatal, Error, Result};
use crate::match_bits::MatchBits;
use crate::nic::{DisableReason, Event, EventType, Nic, PtlteState, ReturnCode, SearchCmd};
use crate::req::{ReqCallback, ReqId, ReqState, SearchReq};
use crate::rx::{self, UxSend};
use crate::{ctrl, tx};

/// Receive-endpoint states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Disabled,
    Enabled,
    EnabledSoftware,
    PendingPtlteDisable,
    PendingPtlteSoftwareManaged,
    PendingPtlteHardware,
    OnloadFlowControl,
    OnloadFlowControlReenable,
    FlowControl,
}

/// Flow-control and state-change statistics, logged at teardown.
#[derive(Debug, Default, Clone)]
pub struct FcStats {
    pub eq_full: u64,
    pub append_fail: u64,
    pub no_match: u64,
    pub request_full: u64,
    pub unexpected_fail: u64,
    pub hw2sw_unexp: u64,
    pub hw2sw_append_fail: u64,
}

/// A peer that reported dropped sends; resumed after re-enable.
#[derive(Debug)]
pub struct FcDrops {
    pub nic: u32,
    pub pid: u32,
    pub drops: u16,
}

/// Request a manual portal disable to start flow-control processing.
///
/// Flow control arriving while already in flow control means list entries
/// are exhausted beyond recovery in hardware mode.
pub(crate) fn pending_ptlte_disable(ep: &mut Ep, check_fc: bool) -> Result<()> {
    debug_assert!(matches!(
        ep.rx.state,
        RxState::Enabled
            | RxState::EnabledSoftware
            | RxState::OnloadFlowControl
            | RxState::OnloadFlowControlReenable
            | RxState::FlowControl
            | RxState::PendingPtlteSoftwareManaged
            | RxState::PendingPtlteDisable
    ));

    if check_fc && ep.rx.state == RxState::FlowControl {
        fatal!(
            "fc: list-entry exhaustion during flow control; \
             hybrid or software match mode is required"
        );
    }

    if ep.rx.state != RxState::Enabled {
        return Ok(());
    }

    debug!("fc: manual portal disable requested");
    ep.nic.pte_set_state(PtlteState::Disabled, 0)?;
    ep.rx.state = RxState::PendingPtlteDisable;
    Ok(())
}

/// Link-event LE-pool usage check; forces a preemptive transition when the
/// allocation crosses half the reservation.
pub(crate) fn check_le_usage_hybrid_preempt(ep: &mut Ep, ev: &Event) -> bool {
    if ev.lpe_stat_1 > (ev.lpe_stat_2 >> 1) && ep.rx.state == RxState::Enabled {
        if pending_ptlte_disable(ep, false).is_err() {
            warn!("fc: forced disable failed");
        }
        return true;
    }
    false
}

/// Unexpected-header count check on each unexpected arrival.
pub(crate) fn check_ule_hybrid_preempt(ep: &mut Ep) -> Result<()> {
    if ep.cfg.rx_match_mode == MatchMode::Hybrid
        && ep.cfg.hybrid_unexpected_msg_preemptive
        && ep.rx.state == RxState::Enabled
        && ep.rx.orx_hw_ule_cnt > ep.cfg.req_size_hint as i64
    {
        return match pending_ptlte_disable(ep, false) {
            Ok(()) => {
                warn!(
                    "fc: transitioning to software matching, {} unexpected headers",
                    ep.rx.orx_hw_ule_cnt
                );
                Ok(())
            }
            Err(e) => {
                warn!("fc: failed to transition to software matching: {}", e);
                Err(e)
            }
        };
    }
    Ok(())
}

/// Posted-receive count check on each hardware append.
pub(crate) fn check_recv_count_hybrid_preempt(ep: &mut Ep) -> Result<()> {
    if ep.cfg.rx_match_mode == MatchMode::Hybrid
        && ep.cfg.hybrid_posted_recv_preemptive
        && ep.rx.orx_reqs > ep.cfg.posted_recv_hint
    {
        debug_assert_eq!(ep.rx.state, RxState::Enabled);
        return match pending_ptlte_disable(ep, false) {
            Ok(()) => {
                warn!(
                    "fc: transitioning to software matching, {} posted receives",
                    ep.rx.orx_reqs
                );
                Err(Error::Again)
            }
            Err(e) => {
                warn!("fc: failed to transition to software matching: {}", e);
                Err(e)
            }
        };
    }
    Ok(())
}

/// Attempt to re-enable the receive portal.
///
/// Every peer that dropped sends must have reported before the local count
/// can equal the NIC's; a mismatch retries on the next notify.
pub(crate) fn recv_reenable(ep: &mut Ep) -> Result<()> {
    if ep.rx.drop_count < 0 {
        warn!("fc: waiting for pending notify messages");
        return Err(Error::Again);
    }

    let status = ep.nic.pte_status();
    if ep.rx.drop_count != status.drop_count {
        debug!(
            "fc: processed {}/{} drops",
            ep.rx.drop_count, status.drop_count
        );
        return Err(Error::Again);
    }

    warn!("fc: re-enabling portal, drop count {}", ep.rx.drop_count);

    loop {
        match msg_enable(ep) {
            Ok(()) => return Ok(()),
            Err(Error::Again) => {
                if ep.rx.new_state == RxState::EnabledSoftware {
                    // Synchronous transition saw a stale count; retried on
                    // the next peer notify.
                    warn!("fc: software transition drop mismatch, will retry on notify");
                    return Err(Error::Again);
                }
            }
            Err(e) => fatal!("fc: portal enable failed: {}", e),
        }
    }
}

/// Change the portal to its re-enabled state.
fn msg_enable(ep: &mut Ep) -> Result<()> {
    if ep.rx.new_state == RxState::EnabledSoftware {
        // Disabled-to-software-managed is synchronous so drop-count
        // mismatches surface here rather than as disable events.
        return ep.nic.pte_transition_sm(ep.rx.drop_count);
    }
    ep.nic.pte_set_state(PtlteState::Enabled, ep.rx.drop_count)
}

/// A peer reported dropped sends.
pub(crate) fn process_drops(ep: &mut Ep, nic: u32, pid: u32, drops: u16) {
    ep.rx.fc_drops.push(FcDrops { nic, pid, drops });
    ep.rx.drop_count += drops as i64;

    debug!("fc: processed {} drops from {:#x}:{}", drops, nic, pid);

    // Re-enable only after onload has finished.
    if ep.rx.state == RxState::FlowControl {
        let ret = recv_reenable(ep);
        debug_assert!(matches!(ret, Ok(()) | Err(Error::Again)));

        if ep.rx.new_state == RxState::EnabledSoftware && ret.is_ok() {
            fc_progress_ctrl(ep);
            ep.rx.state = RxState::EnabledSoftware;
            warn!("fc: now software managed");
        }
    }
}

/// Send a resume message to every peer that reported drops, in report
/// order.
pub(crate) fn recv_resume(ep: &mut Ep) -> Result<()> {
    while !ep.rx.fc_drops.is_empty() {
        let drops = ep.rx.fc_drops.remove(0);
        if let Err(e) = ctrl::send_resume(ep, drops.nic, drops.pid, drops.drops) {
            ep.rx.fc_drops.insert(0, drops);
            return Err(e);
        }
    }
    Ok(())
}

/// Queue resume messages until they all fit; resets the drop counter for
/// the next cycle.
pub(crate) fn fc_progress_ctrl(ep: &mut Ep) {
    debug_assert_eq!(ep.rx.state, RxState::FlowControl);

    ep.rx.drop_count = ep.cfg.initial_drop_count() as i64;

    loop {
        match recv_resume(ep) {
            Ok(()) => break,
            Err(Error::Again) => continue,
            Err(e) => fatal!("fc: resume fan-out failed: {}", e),
        }
    }
}

/// Hardware-to-software transition finished onloading.
fn post_ux_onload_sw(ep: &mut Ep) {
    debug_assert_eq!(ep.cfg.rx_match_mode, MatchMode::Hybrid);
    debug_assert_eq!(ep.rx.prev_state, RxState::Enabled);
    debug_assert_eq!(ep.rx.new_state, RxState::EnabledSoftware);

    let (nic, reqs) = (&mut ep.nic, &mut ep.reqs);
    if let Err(e) = ep.rx.req_pool.replenish(nic.as_mut(), reqs) {
        warn!("fc: request-list replenish failed: {}", e);
    }

    // Appends that failed during the transition can now be replayed.
    let ret = rx::recv_replay(ep);
    debug_assert!(matches!(ret, Ok(()) | Err(Error::Again)));

    if ep.rx.state == RxState::PendingPtlteSoftwareManaged {
        warn!("fc: now software managed");
        ep.rx.state = RxState::EnabledSoftware;
    }
}

/// Flow-control onload complete; replenish, replay and try to re-enable.
fn post_ux_onload_fc(ep: &mut Ep) {
    if ep.rx.new_state == RxState::EnabledSoftware {
        debug!("fc: transitioning to software managed matching");
        ep.rx.msg_offload = false;
    }

    // A full event queue recovers without touching list resources.
    if ep.rx.fc_reason != Some(DisableReason::FcEqFull) {
        let (nic, reqs) = (&mut ep.nic, &mut ep.reqs);
        let ret = if ep.rx.new_state == RxState::EnabledSoftware {
            ep.rx.req_pool.replenish(nic.as_mut(), reqs)
        } else {
            ep.rx.oflow_pool.replenish(nic.as_mut(), reqs)
        };
        if let Err(e) = ret {
            warn!("fc: buffer replenish failed: {}", e);
        }
    }

    if ep.rx.new_state == RxState::Enabled {
        ep.rx.msg_offload = true;
    }

    let ret = rx::recv_replay(ep);
    debug_assert!(matches!(ret, Ok(()) | Err(Error::Again)));

    if ep.rx.state != RxState::OnloadFlowControlReenable
        && ep.rx.new_state != RxState::EnabledSoftware
    {
        fatal!(
            "fc: list-entry resources not recovered during flow control; \
             hybrid or software match mode is required"
        );
    }

    ep.rx.state = RxState::FlowControl;
    let ret = recv_reenable(ep);
    debug_assert!(matches!(ret, Ok(()) | Err(Error::Again)));
    warn!("fc: now in flow-control recovery");

    if ep.rx.new_state == RxState::EnabledSoftware && ret.is_ok() {
        fc_progress_ctrl(ep);
        ep.rx.state = RxState::EnabledSoftware;
        warn!("fc: now software managed");
    }
}

/// Every unexpected header has onloaded; merge lists and continue per the
/// transition in progress.
pub(crate) fn ux_onload_complete(ep: &mut Ep, search_req: ReqId) {
    debug_assert!(matches!(
        ep.rx.state,
        RxState::OnloadFlowControlReenable | RxState::PendingPtlteSoftwareManaged
    ));

    ep.rx.ule_offsets = Vec::new();
    ep.rx.cur_ule_offsets = 0;

    // Entries that arrived on the request list while the transition was in
    // flight append after the onloaded ones.
    let pending = std::mem::take(&mut ep.rx.sw_pending_ux_list);
    debug!(
        "fc: merging {} pending entries into {} onloaded",
        pending.len(),
        ep.rx.sw_ux_list.len()
    );
    ep.rx.sw_ux_list.extend(pending);
    warn!("fc: software unexpected list now {} entries", ep.rx.sw_ux_list.len());

    if ep.rx.state == RxState::PendingPtlteSoftwareManaged {
        post_ux_onload_sw(ep);
    } else {
        post_ux_onload_fc(ep);
    }

    ep.reqs.free(search_req);
}

/// Unexpected-list onload search events.
pub(crate) fn ux_onload_cb(ep: &mut Ep, req_id: ReqId, ev: &Event) -> Result<()> {
    debug_assert!(matches!(
        ep.rx.state,
        RxState::OnloadFlowControl
            | RxState::OnloadFlowControlReenable
            | RxState::PendingPtlteSoftwareManaged
    ));

    match ev.event_type {
        EventType::PutOverflow => {
            debug_assert_eq!(ev.rc, ReturnCode::Ok);

            let ux_id = ep.rx.next_ux_id();
            let mut ux = UxSend {
                ux_id,
                claimed: false,
                req: None,
                put_ev: ev.clone(),
            };

            // Non-zero length pairs with a Put event now or later;
            // zero-byte onloads stand alone.
            if ev.rlength > 0 {
                let (matched, handle) = ep.rx.deferred.match_put_event(req_id, ev);
                if matched {
                    let def_ev = ep.rx.deferred.remove(handle);
                    ux.req = Some(def_ev.req);
                    ux.put_ev = def_ev.ev;
                } else {
                    // Gather the Put later.
                    ep.rx.deferred.get_mut(handle).ux_id = Some(ux_id);
                    ep.reqs.get_mut(req_id).unwrap().search_mut().puts_pending += 1;
                }
            }

            // A freed unexpected entry means re-enable can be attempted.
            if ep.rx.state == RxState::OnloadFlowControl {
                ep.rx.state = RxState::OnloadFlowControlReenable;
            }

            // Absorb the snapshotted remote offset so a software get pulls
            // from the right place.
            if ev.rlength > 0 {
                ux.put_ev.remote_offset =
                    ep.rx.ule_offsets[ep.rx.cur_ule_offsets] + ev.mlength as u64;
            }
            ep.rx.cur_ule_offsets += 1;

            debug!("fc: onloaded unexpected send {}", ux_id);
            ep.rx.sw_ux_list.push(ux);
            ep.rx.orx_hw_ule_cnt -= 1;
            Ok(())
        }
        EventType::Search => {
            if ep.rx.new_state == RxState::EnabledSoftware
                && ep.rx.state == RxState::OnloadFlowControl
            {
                ep.rx.state = RxState::OnloadFlowControlReenable;
            }

            if ep.rx.state == RxState::OnloadFlowControl {
                fatal!(
                    "fc: list-entry resources not recovered during flow control; \
                     hybrid or software match mode is required"
                );
            }

            let search = ep.reqs.get_mut(req_id).unwrap().search_mut();
            search.complete = true;
            let done = search.puts_pending == 0;
            debug!("fc: unexpected-list onload search done");

            if done {
                ux_onload_complete(ep, req_id);
            }
            Ok(())
        }
        _ => fatal!("fc: unexpected onload event {:?}", ev.event_type),
    }
}

/// Issue the search-and-delete that onloads the hardware unexpected list.
pub(crate) fn ux_onload(ep: &mut Ep) -> Result<()> {
    debug_assert!(matches!(
        ep.rx.state,
        RxState::OnloadFlowControl
            | RxState::OnloadFlowControlReenable
            | RxState::PendingPtlteSoftwareManaged
    ));

    debug!("fc: initiating hardware unexpected-list onload");

    // Remote offsets must be snapshotted before the delete starts.
    ep.rx.ule_offsets = ep.nic.ule_offsets();
    ep.rx.cur_ule_offsets = 0;

    let req_id = ep
        .reqs
        .alloc(ReqCallback::UxOnload, ReqState::Search(SearchReq::default()));

    let ret = ep.nic.search(SearchCmd {
        buffer_id: req_id,
        match_bits: MatchBits::new(),
        ignore_bits: crate::match_bits::search_ignore(false, 0, true),
        match_id: addr::MATCH_ID_ANY,
        delete: true,
        use_once: false,
    });

    if let Err(e) = ret {
        ep.reqs.free(req_id);
        ep.rx.ule_offsets = Vec::new();
        warn!("fc: unexpected-list onload initiation failed: {}", e);
        return Err(e);
    }
    ep.nic.ring();

    Ok(())
}

/// A no-match search acts as a barrier proving all prior appends have been
/// processed; onload starts once it completes.
pub(crate) fn flush_appends(ep: &mut Ep) -> Result<()> {
    debug_assert!(matches!(
        ep.rx.state,
        RxState::OnloadFlowControl
            | RxState::OnloadFlowControlReenable
            | RxState::PendingPtlteSoftwareManaged
    ));

    let req_id = ep
        .reqs
        .alloc(ReqCallback::FlushAppends, ReqState::Search(SearchReq::default()));

    // Match bits that match nothing.
    let ret = ep.nic.search(SearchCmd {
        buffer_id: req_id,
        match_bits: MatchBits(!0u64),
        ignore_bits: MatchBits(0),
        match_id: addr::MATCH_ID_ANY,
        delete: false,
        use_once: false,
    });

    if let Err(e) = ret {
        ep.reqs.free(req_id);
        return Err(e);
    }
    ep.nic.ring();
    Ok(())
}

pub(crate) fn flush_appends_cb(ep: &mut Ep, req_id: ReqId, ev: &Event) -> Result<()> {
    debug_assert_eq!(ev.event_type, EventType::Search);
    debug_assert_eq!(ev.rc, ReturnCode::NoMatch);

    let ret = ux_onload(ep);
    if ret.is_ok() {
        ep.reqs.free(req_id);
    }
    ret
}

/// Portal state-change events: the receiver state machine.
pub(crate) fn pte_state_change(ep: &mut Ep, ev: &Event) {
    let fc_reason = ev.sc_reason;

    match ev.ptlte_state {
        PtlteState::Enabled => {
            debug_assert!(matches!(
                ep.rx.state,
                RxState::FlowControl | RxState::Disabled | RxState::PendingPtlteHardware
            ));

            if ep.rx.state == RxState::FlowControl {
                fc_progress_ctrl(ep);
                warn!("fc: now enabled");
            }
            ep.rx.state = RxState::Enabled;
        }

        PtlteState::Disabled => {
            if ep.rx.state == RxState::Disabled {
                return;
            }

            if fc_reason == Some(DisableReason::Uncorrectable) {
                fatal!("fc: disabled, uncorrectable list-entry error");
            }

            // A stale drop count was used during enable; another attempt
            // comes with the next peer notify.
            if ev.rc == ReturnCode::NoMatch {
                debug_assert!(matches!(
                    ep.rx.state,
                    RxState::FlowControl
                        | RxState::OnloadFlowControl
                        | RxState::OnloadFlowControlReenable
                        | RxState::PendingPtlteSoftwareManaged
                ));
                warn!("fc: re-enable drop count mismatch, retrying on notify");
                return;
            }

            // Flow control during a hardware-to-software transition:
            // onload is already running and must re-enable on completion.
            if ep.rx.state == RxState::PendingPtlteSoftwareManaged {
                warn!("fc: flow control during transition to software managed");
                ep.rx.state = RxState::OnloadFlowControlReenable;
                return;
            }

            if !matches!(
                ep.rx.state,
                RxState::Enabled | RxState::EnabledSoftware | RxState::PendingPtlteDisable
            ) {
                // A software disable can race hardware-initiated flow
                // control; that one is benign.
                if fc_reason == Some(DisableReason::SoftwareInitiated) {
                    return;
                }
                fatal!(
                    "fc: list-entry exhaustion during flow control; \
                     hybrid or software match mode is required"
                );
            }

            // Default is to re-enable in the state held before disable.
            ep.rx.prev_state = ep.rx.state;
            ep.rx.new_state = ep.rx.state;
            ep.rx.state = RxState::OnloadFlowControl;

            debug!(
                "fc: flow control detected, nic auto {} reason {:?}",
                ev.sc_nic_auto, fc_reason
            );

            match fc_reason {
                Some(DisableReason::SoftwareInitiated) | None => {
                    // Software-initiated disables skip the duplicate event
                    // older devices generate.
                    warn!("fc: software-initiated flow control");
                    if ep.cfg.legacy_drop_count {
                        ep.rx.drop_count += 1;
                    }
                    if ep.cfg.rx_match_mode == MatchMode::Hybrid {
                        ep.rx.new_state = RxState::EnabledSoftware;
                    }
                    ep.rx.stats.append_fail += 1;
                }
                Some(DisableReason::FcEqFull) => {
                    warn!("fc: flow control, event queue full");
                    ep.rx.state = RxState::OnloadFlowControlReenable;
                    ep.rx.stats.eq_full += 1;
                }
                Some(DisableReason::FcNoMatch) => {
                    warn!(
                        "fc: flow control, no overflow match; larger overflow \
                         buffers may reduce occurrence (current {}B)",
                        ep.cfg.oflow_buf_size
                    );
                    ep.rx.state = RxState::OnloadFlowControlReenable;
                    ep.rx.stats.no_match += 1;
                }
                Some(DisableReason::FcUnexpectedFail) => {
                    warn!("fc: flow control, unexpected-header resources");
                    ep.rx.stats.unexpected_fail += 1;
                }
                Some(DisableReason::FcRequestFull) => {
                    warn!(
                        "fc: flow control, request list full; larger request \
                         buffers may reduce occurrence (current {}B)",
                        ep.cfg.req_buf_size
                    );
                    ep.rx.state = RxState::OnloadFlowControlReenable;
                    ep.rx.stats.request_full += 1;
                }
                Some(reason) => {
                    fatal!("fc: invalid disable reason {:?}", reason);
                }
            }
            ep.rx.fc_reason = fc_reason;

            loop {
                match flush_appends(ep) {
                    Ok(()) => break,
                    Err(Error::Again) => continue,
                    Err(e) => fatal!("fc: flush appends failed: {}", e),
                }
            }
        }

        PtlteState::SoftwareManaged => {
            // Software asked for a disable after hardware started its own
            // transition; wait for the disable event.
            if ep.rx.state == RxState::PendingPtlteDisable {
                return;
            }

            debug!(
                "fc: software managed, nic auto {} reason {:?}",
                ev.sc_nic_auto, fc_reason
            );

            if ev.rc == ReturnCode::NoMatch {
                warn!("fc: bad drop count on software transition, ignored");
                return;
            }

            if ep.rx.state == RxState::FlowControl {
                fatal!("fc: flow control to software transition must be synchronous");
            }

            debug_assert!(matches!(
                ep.rx.state,
                RxState::Disabled | RxState::Enabled | RxState::PendingPtlteSoftwareManaged
            ));

            match fc_reason {
                Some(DisableReason::SoftwareInitiated) | None => {
                    // Initial software-managed start.
                    debug_assert_eq!(ep.rx.state, RxState::Disabled);
                    if !ep.cfg.msg_offload {
                        warn!("fc: software managed matching enabled");
                        ep.rx.state = RxState::EnabledSoftware;
                    }
                }
                Some(DisableReason::SmAppendFail) | Some(DisableReason::SmUnexpectedFail) => {
                    // The NIC started the transition; in-flight appends
                    // fail onto the replay queue and no new appends happen
                    // until onload completes.
                    warn!("fc: NIC transition to software managed, reason {:?}", fc_reason);
                    ep.rx.fc_reason = fc_reason;
                    ep.rx.prev_state = ep.rx.state;
                    ep.rx.new_state = RxState::EnabledSoftware;

                    if fc_reason == Some(DisableReason::SmUnexpectedFail) {
                        ep.rx.stats.hw2sw_unexp += 1;
                    } else {
                        ep.rx.stats.hw2sw_append_fail += 1;
                    }

                    ep.rx.msg_offload = false;
                    ep.rx.state = RxState::PendingPtlteSoftwareManaged;
                    loop {
                        match flush_appends(ep) {
                            Ok(()) => break,
                            Err(Error::Again) => continue,
                            Err(e) => {
                                warn!("fc: flush or onload error: {}", e);
                                break;
                            }
                        }
                    }
                }
                Some(reason) => fatal!("fc: invalid software-managed reason {:?}", reason),
            }
        }
    }
}

/// Route an incoming control message.
pub(crate) fn ctrl_msg_dispatch(
    ep: &mut Ep,
    kind: crate::match_bits::CtrlMsgType,
    nic: u32,
    pid: u32,
    drops: u16,
) {
    match kind {
        crate::match_bits::CtrlMsgType::FcNotify => process_drops(ep, nic, pid, drops),
        crate::match_bits::CtrlMsgType::FcResume => tx::fc_resume(ep, nic, pid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preempt_checks_only_fire_when_enabled() {
        let mut ep = crate::ep::test_support::test_ep();
        ep.cfg.rx_match_mode = MatchMode::Hybrid;
        ep.cfg.hybrid_unexpected_msg_preemptive = true;
        ep.cfg.req_size_hint = 4;
        ep.rx.orx_hw_ule_cnt = 10;

        // Not enabled: no transition.
        ep.rx.state = RxState::Disabled;
        assert!(check_ule_hybrid_preempt(&mut ep).is_ok());
        assert_eq!(ep.rx.state, RxState::Disabled);

        // Enabled: disable requested.
        ep.rx.state = RxState::Enabled;
        assert!(check_ule_hybrid_preempt(&mut ep).is_ok());
        assert_eq!(ep.rx.state, RxState::PendingPtlteDisable);
    }

    #[test]
    fn test_reenable_requires_matching_drop_count() {
        // NIC saw 3 drops; notifies must sum to 3 before re-enable.
        let mut ep = crate::ep::test_support::test_ep_with(|nic| {
            nic.status.drop_count = 3;
        });
        ep.rx.state = RxState::FlowControl;
        ep.rx.new_state = RxState::Enabled;
        ep.rx.drop_count = 1;

        assert_eq!(recv_reenable(&mut ep), Err(Error::Again));

        ep.rx.drop_count = 3;
        assert!(recv_reenable(&mut ep).is_ok());
    }
}
