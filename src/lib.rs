//! # tagmsg - two-sided messaging over a match-offloading NIC
//!
//! This crate implements the point-to-point messaging engine of a
//! libfabric-style provider for a high-radix NIC that offloads matching of
//! tagged and untagged messages.
//!
//! ## Features
//!
//! - **Offloaded matching**: posted receives append to a hardware priority
//!   list; unexpected sends land in overflow buffers and pair up through a
//!   deferred-event table.
//! - **Rendezvous**: large payloads transfer by target-initiated pull, with
//!   optional restricted-read protocol and done-notify.
//! - **Flow-control recovery**: portal disable, unexpected-list onload,
//!   drop/notify/resume with ordered replay; drops are invisible to the
//!   application.
//! - **Hybrid matching**: hardware-managed matching can transition to
//!   software-managed under resource exhaustion, preemptively or on demand.
//!
//! ## Usage
//!
//! ```ignore
//! use tagmsg::{Endpoint, MsgConfig, MsgFlags};
//!
//! let cfg = MsgConfig::default()
//!     .with_rdzv_threshold(16 * 1024)
//!     .with_oflow_buf_size(2 * 1024 * 1024);
//!
//! let ep = Endpoint::new(nic, av, src_addr, pid_bits, cfg)?;
//!
//! // Post a tagged receive.
//! ep.recv(buf.as_mut_ptr(), buf.len(), tagmsg::FI_ADDR_UNSPEC,
//!         7, 0, 0x1, MsgFlags::COMPLETION, true)?;
//!
//! // Send to peer 1.
//! ep.send(data.as_ptr(), data.len(), 1, 7, 0, 0x2,
//!         MsgFlags::COMPLETION, true)?;
//!
//! // Drive both sides.
//! loop {
//!     ep.progress();
//!     if let Some(comp) = ep.recv_completion() { /* ... */ }
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: configuration (`MsgConfig`, match modes, thresholds)
//! - [`match_bits`]: the 64-bit match-word layout both sides share
//! - [`addr`]: fabric addressing and the address-vector interface
//! - [`nic`]: the narrow device interface (events, commands, [`nic::Nic`])
//! - [`req`]: request handles and the request-id table
//! - [`defer`]: Put / Put-Overflow correlation
//! - [`oflow`]: overflow and request-list buffer pools
//! - [`rx`]: receive engine (post, match, peek/claim, multi-receive)
//! - [`rdzv`]: rendezvous coordinator
//! - [`tx`]: send engine and sender-side drop/replay
//! - [`fc`]: receive-side flow control state machine
//! - [`ctrl`]: flow-control notify/resume messages
//! - [`cq`]: completion queue and counter interfaces
//! - [`ep`]: the endpoint aggregate and event demultiplexer

pub mod addr;
pub mod config;
pub mod cq;
pub mod ctrl;
pub mod defer;
pub mod ep;
pub mod error;
pub mod fc;
pub mod match_bits;
pub mod nic;
pub mod oflow;
pub mod rdzv;
pub mod req;
pub mod rx;
pub mod tx;

// Re-export main types
pub use addr::{AddrTable, AddressVector, FabAddr, FI_ADDR_NOTAVAIL, FI_ADDR_UNSPEC};
pub use config::{MatchMode, MsgConfig, RdzvProto};
pub use cq::{CompErr, CompKind, Completion};
pub use ep::Endpoint;
pub use error::{Error, Result};
pub use fc::RxState;
pub use match_bits::{CtrlMsgType, LeType, MatchBits, TAG_MASK};
pub use nic::{
    AppendCmd, DisableReason, Event, EventType, GetCmd, LeFlags, MemDesc, Nic, PtlList,
    PteStatus, PtlteState, PutCmd, ReturnCode, SearchCmd, TargetPte,
};
pub use req::MsgFlags;
