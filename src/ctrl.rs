//! Flow-control control messages.
//!
//! Two message kinds cross a small control portal as zero-byte puts with
//! all identifying state in the match bits: a notify carrying a sender's
//! drop count, and a resume releasing a peer to replay. Both retry on a
//! full target event queue after the configured delay.

use log::{debug, warn};

use crate::addr;
use crate::ep::Ep;
use crate::error::{fatal, Result};
use crate::fc;
use crate::match_bits::{CtrlMsgType, LeType, MatchBits};
use crate::nic::{Event, EventType, Nic, PutCmd, ReturnCode, TargetPte};
use crate::req::{CtrlReq, ReqCallback, ReqId, ReqState};
use crate::tx;

/// Emit a control message for the given control request.
pub(crate) fn ctrl_msg_send(ep: &mut Ep, req_id: ReqId) -> Result<()> {
    let (kind, nic, pid, drops) = {
        let req = ep.reqs.get(req_id).unwrap();
        match &req.state {
            ReqState::Ctrl(c) => (c.kind, c.nic, c.pid, c.drops),
            _ => fatal!("request {} is not a control message", req_id),
        }
    };

    let mut mb = MatchBits::new();
    mb.set_le_type(LeType::Ctrl);
    mb.set_ctrl_msg_type(kind);
    mb.set_drops(drops);

    let initiator = ep.msg_match_id();
    let cmd = PutCmd {
        nic,
        pid,
        pte: TargetPte::Ctrl,
        buffer_id: req_id,
        match_bits: mb,
        header_data: 0,
        initiator,
        addr: 0,
        len: 0,
        eager_length: 0,
        rendezvous_id: 0,
        remote_offset: 0,
    };

    ep.nic.idc_put(cmd, &[])?;
    ep.nic.ring();

    debug!("ctrl: sent {:?} to {:#x}:{} drops {}", kind, nic, pid, drops);
    Ok(())
}

/// Queue a resume message to a peer that reported drops.
pub(crate) fn send_resume(ep: &mut Ep, nic: u32, pid: u32, drops: u16) -> Result<()> {
    let req_id = ep.reqs.alloc(
        ReqCallback::Ctrl,
        ReqState::Ctrl(CtrlReq {
            kind: CtrlMsgType::FcResume,
            nic,
            pid,
            drops,
            retry_count: 0,
            peer_idx: None,
        }),
    );

    if let Err(e) = ctrl_msg_send(ep, req_id) {
        ep.reqs.free(req_id);
        return Err(e);
    }
    Ok(())
}

/// Acknowledgement of an outgoing control message.
pub(crate) fn ctrl_ack_cb(ep: &mut Ep, req_id: ReqId, ev: &Event) -> Result<()> {
    if ev.event_type != EventType::Ack {
        fatal!("ctrl: unexpected event {:?} on control request", ev.event_type);
    }

    let (kind, peer_idx) = {
        let req = ep.reqs.get(req_id).unwrap();
        match &req.state {
            ReqState::Ctrl(c) => (c.kind, c.peer_idx),
            _ => fatal!("request {} is not a control message", req_id),
        }
    };

    match kind {
        CtrlMsgType::FcNotify => {
            let idx = peer_idx.expect("notify belongs to a peer");
            tx::fc_notify_ack(ep, idx, ev.rc)
        }
        CtrlMsgType::FcResume => match ev.rc {
            ReturnCode::Ok => {
                debug!("ctrl: resume delivered");
                ep.reqs.free(req_id);
                Ok(())
            }
            // The peer's control event queue filled; it drains, so replay
            // until accepted.
            ReturnCode::EntryNotFound => {
                if let ReqState::Ctrl(c) = &mut ep.reqs.get_mut(req_id).unwrap().state {
                    c.retry_count += 1;
                    warn!(
                        "ctrl: resume dropped, retry {} after {}us",
                        c.retry_count, ep.cfg.fc_retry_usec_delay
                    );
                }
                std::thread::sleep(std::time::Duration::from_micros(
                    ep.cfg.fc_retry_usec_delay,
                ));
                ctrl_msg_send(ep, req_id)
            }
            rc => fatal!("ctrl: unexpected resume ack status {:?}", rc),
        },
    }
}

/// Incoming put on the control portal.
pub(crate) fn ctrl_msg_cb(ep: &mut Ep, _req_id: ReqId, ev: &Event) -> Result<()> {
    match ev.event_type {
        EventType::Link => Ok(()),
        EventType::Put => {
            let mb = ev.match_bits;
            let Some(kind) = mb.ctrl_msg_type() else {
                fatal!("ctrl: unknown control message type {:#x}", mb.raw());
            };

            let nic = addr::match_id_ep(ep.pid_bits, ev.initiator);
            let pid = addr::match_id_pid(ep.pid_bits, ev.initiator);
            debug!("ctrl: {:?} from {:#x}:{} drops {}", kind, nic, pid, mb.drops());

            fc::ctrl_msg_dispatch(ep, kind, nic, pid, mb.drops());
            Ok(())
        }
        _ => fatal!("ctrl: unexpected control portal event {:?}", ev.event_type),
    }
}
