//! Request handles and the request-id table.
//!
//! Every outstanding operation is a `Request` with a stable numeric id,
//! unique while the request is live and reused afterward. Events reference
//! requests by id; the table is the arena that makes parent/child receive
//! relationships safe without shared ownership.

use bitflags::bitflags;

use crate::addr::FabAddr;
use crate::error::fatal;
use crate::match_bits::CtrlMsgType;
use crate::nic::{EventType, MemDesc, PtlList, ReturnCode};

bitflags! {
    /// Operation flags, caller-supplied plus completion-reporting bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgFlags: u32 {
        const MSG            = 1 << 0;
        const TAGGED         = 1 << 1;
        const RECV           = 1 << 2;
        const SEND           = 1 << 3;
        const COMPLETION     = 1 << 4;
        const MULTI_RECV     = 1 << 5;
        const PEEK           = 1 << 6;
        const CLAIM          = 1 << 7;
        const INJECT         = 1 << 8;
        const MATCH_COMPLETE = 1 << 9;
        const REMOTE_CQ_DATA = 1 << 10;
        const FENCE          = 1 << 11;
        const MORE           = 1 << 12;
    }
}

/// Stable request identifier.
pub type ReqId = u32;

/// Callback binding: selects the handler the demultiplexer invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqCallback {
    /// Posted receive (priority list or software queue).
    Recv,
    /// Receive waiting on a match-complete notify acknowledgement.
    NotifyMatch,
    /// Overflow-list buffer.
    Oflow,
    /// Request-list buffer (software managed matching).
    ReqBuf,
    /// Unexpected-list onload search.
    UxOnload,
    /// No-match search used as an append barrier.
    FlushAppends,
    /// Unexpected-list peek search.
    Peek,
    /// Claim: remote-offset discovery search.
    ClaimOffset,
    /// Claim: search-and-delete onload.
    ClaimOnload,
    /// Eager send.
    SendEager,
    /// Rendezvous send.
    SendRdzv,
    /// Rendezvous source window.
    RdzvSrc,
    /// Zero-byte-put portal (notify sink on the sender).
    Zbp,
    /// Outgoing control message (flow-control notify/resume).
    Ctrl,
    /// Control portal (incoming control messages).
    CtrlPte,
}

/// Receive-specific request state.
#[derive(Debug)]
pub struct RecvReq {
    pub recv_buf: u64,
    pub recv_md: Option<MemDesc>,
    pub ulen: usize,
    pub tag: u64,
    pub ignore: u64,
    pub match_id: u32,
    pub tagged: bool,
    pub multi_recv: bool,
    /// Offset into the multi-receive buffer for the next match.
    pub start_offset: usize,
    /// Received (requested) length from the target event.
    pub rlen: usize,
    /// Bytes consumed from this multi-receive buffer by completed children.
    pub mrecv_bytes: usize,
    /// Total bytes at which an auto-unlinked parent is exhausted.
    pub mrecv_unlink_bytes: usize,
    /// Live children of a multi-receive parent.
    pub children: Vec<ReqId>,
    pub parent: Option<ReqId>,
    /// Parent hit its unlink condition while children were outstanding;
    /// free it when the last child completes.
    pub parent_free_pending: bool,
    /// Target-event fields were populated.
    pub tgt_event: bool,
    pub unlinked: bool,
    pub canceled: bool,
    pub auto_unlinked: bool,
    /// Queued on the software receive queue.
    pub software_list: bool,
    /// Appended to the hardware priority list.
    pub hw_offloaded: bool,
    /// Restricted-protocol receive must wait for the done-notify ACK.
    pub done_notify: bool,
    /// Rendezvous events seen so far.
    pub rdzv_events: u8,
    pub rdzv_event_types: [Option<EventType>; 4],
    pub rdzv_id: u16,
    pub rdzv_lac: u8,
    pub rdzv_proto: u8,
    /// Eager bytes that arrived with the rendezvous put.
    pub rdzv_mlen: usize,
    pub rdzv_initiator: u32,
    pub rget_nic: u32,
    pub rget_pid: u32,
    /// Initiator-provided source offset for the rendezvous get.
    pub src_offset: u64,
    pub rc: ReturnCode,
    pub initiator: u32,
    pub vni: u16,
    /// Overflow-buffer start address correlating Put and Put-Overflow.
    pub oflow_start: u64,
    /// Claim state: snapshotted unexpected-entry offsets.
    pub ule_offsets: Vec<u64>,
    pub cur_ule_offsets: usize,
    pub num_ule_offsets: usize,
    pub offset_found: bool,
    pub ule_offset: u64,
}

impl RecvReq {
    pub fn new(buf: u64, len: usize, md: Option<MemDesc>) -> Self {
        Self {
            recv_buf: buf,
            recv_md: md,
            ulen: len,
            tag: 0,
            ignore: 0,
            match_id: crate::addr::MATCH_ID_ANY,
            tagged: false,
            multi_recv: false,
            start_offset: 0,
            rlen: 0,
            mrecv_bytes: 0,
            mrecv_unlink_bytes: 0,
            children: Vec::new(),
            parent: None,
            parent_free_pending: false,
            tgt_event: false,
            unlinked: false,
            canceled: false,
            auto_unlinked: false,
            software_list: false,
            hw_offloaded: false,
            done_notify: false,
            rdzv_events: 0,
            rdzv_event_types: [None; 4],
            rdzv_id: 0,
            rdzv_lac: 0,
            rdzv_proto: 0,
            rdzv_mlen: 0,
            rdzv_initiator: 0,
            rget_nic: 0,
            rget_pid: 0,
            src_offset: 0,
            rc: ReturnCode::Ok,
            initiator: 0,
            vni: 0,
            oflow_start: 0,
            ule_offsets: Vec::new(),
            cur_ule_offsets: 0,
            num_ule_offsets: 0,
            offset_found: false,
            ule_offset: 0,
        }
    }
}

/// Send-specific request state.
#[derive(Debug)]
pub struct SendReq {
    pub caddr: FabAddr,
    pub dest_addr: u64,
    pub buf: u64,
    pub len: usize,
    pub tag: u64,
    pub tagged: bool,
    /// Inline completion data.
    pub data: u64,
    pub send_md: Option<MemDesc>,
    /// Bounce-buffer index; exclusive with `send_md`.
    pub ibuf: Option<usize>,
    pub rdzv_id: u16,
    /// Initiator events counted toward rendezvous send completion.
    pub rdzv_send_events: u8,
    pub tx_id: u16,
    pub rc: ReturnCode,
    /// Index of the flow-control peer this send is parked on. Weak: the
    /// peer never owns the request.
    pub fc_peer: Option<usize>,
    pub triggered: bool,
    pub trig_thresh: u64,
}

impl SendReq {
    pub fn new(caddr: FabAddr, dest_addr: u64, buf: u64, len: usize) -> Self {
        Self {
            caddr,
            dest_addr,
            buf,
            len,
            tag: 0,
            tagged: false,
            data: 0,
            send_md: None,
            ibuf: None,
            rdzv_id: 0,
            rdzv_send_events: 0,
            tx_id: 0,
            rc: ReturnCode::Ok,
            fc_peer: None,
            triggered: false,
            trig_thresh: 0,
        }
    }
}

/// Unexpected-list search state (onload and peek flows).
#[derive(Debug, Default)]
pub struct SearchReq {
    /// Put events still outstanding for onloaded entries.
    pub puts_pending: u32,
    /// The search completion event arrived.
    pub complete: bool,
}

/// Overflow- or request-list buffer request state.
#[derive(Debug)]
pub struct OflowReq {
    /// Index of the buffer in its pool.
    pub buf_index: usize,
    /// List the buffer is appended to.
    pub list: PtlList,
}

/// Rendezvous source-window request state.
#[derive(Debug)]
pub struct RdzvSrcReq {
    pub lac: u8,
}

/// Outgoing control-message state.
#[derive(Debug)]
pub struct CtrlReq {
    pub kind: CtrlMsgType,
    pub nic: u32,
    pub pid: u32,
    pub drops: u16,
    pub retry_count: u32,
    /// Owning flow-control peer for notify messages.
    pub peer_idx: Option<usize>,
}

/// Variant payload of a request.
#[derive(Debug)]
pub enum ReqState {
    Recv(RecvReq),
    Send(SendReq),
    Search(SearchReq),
    Oflow(OflowReq),
    RdzvSrc(RdzvSrcReq),
    Ctrl(CtrlReq),
    ZeroByte,
}

/// A polymorphic request handle.
#[derive(Debug)]
pub struct Request {
    pub id: ReqId,
    pub cb: ReqCallback,
    pub context: u64,
    pub flags: MsgFlags,
    /// Effective data length reported on completion.
    pub data_len: usize,
    pub tag: u64,
    /// Remote completion-queue data.
    pub data: u64,
    /// Buffer address reported on completion.
    pub buf: u64,
    pub state: ReqState,
}

impl Request {
    pub fn recv(&self) -> &RecvReq {
        match &self.state {
            ReqState::Recv(r) => r,
            _ => fatal!("request {} is not a receive", self.id),
        }
    }

    pub fn recv_mut(&mut self) -> &mut RecvReq {
        match &mut self.state {
            ReqState::Recv(r) => r,
            _ => fatal!("request {} is not a receive", self.id),
        }
    }

    pub fn send(&self) -> &SendReq {
        match &self.state {
            ReqState::Send(s) => s,
            _ => fatal!("request {} is not a send", self.id),
        }
    }

    pub fn send_mut(&mut self) -> &mut SendReq {
        match &mut self.state {
            ReqState::Send(s) => s,
            _ => fatal!("request {} is not a send", self.id),
        }
    }

    pub fn search(&self) -> &SearchReq {
        match &self.state {
            ReqState::Search(s) => s,
            _ => fatal!("request {} is not a search", self.id),
        }
    }

    pub fn search_mut(&mut self) -> &mut SearchReq {
        match &mut self.state {
            ReqState::Search(s) => s,
            _ => fatal!("request {} is not a search", self.id),
        }
    }

    pub fn oflow(&self) -> &OflowReq {
        match &self.state {
            ReqState::Oflow(o) => o,
            _ => fatal!("request {} is not an overflow buffer", self.id),
        }
    }
}

/// Arena of live requests with stable, reused ids.
#[derive(Debug, Default)]
pub struct ReqTable {
    slots: Vec<Option<Request>>,
    free: Vec<ReqId>,
    live: usize,
}

impl ReqTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot for a request with the given callback binding.
    pub fn alloc(&mut self, cb: ReqCallback, state: ReqState) -> ReqId {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as ReqId
            }
        };

        self.slots[id as usize] = Some(Request {
            id,
            cb,
            context: 0,
            flags: MsgFlags::empty(),
            data_len: 0,
            tag: 0,
            data: 0,
            buf: 0,
            state,
        });
        self.live += 1;
        id
    }

    pub fn get(&self, id: ReqId) -> Option<&Request> {
        self.slots.get(id as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: ReqId) -> Option<&mut Request> {
        self.slots.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    /// Free a request; the id becomes reusable.
    pub fn free(&mut self, id: ReqId) -> Request {
        let req = self.slots[id as usize]
            .take()
            .unwrap_or_else(|| fatal!("double free of request {}", id));
        self.free.push(id);
        self.live -= 1;
        req
    }

    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    /// Ids of live requests, in slot order.
    pub fn iter_ids(&self) -> impl Iterator<Item = ReqId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i as ReqId)
    }
}
