//! Overflow buffer pool.
//!
//! Overflow buffers land the eager bytes of unexpected sends. Each buffer is
//! a registered region appended to the NIC overflow list as a locally
//! managed entry; the NIC consumes it put by put and auto-unlinks it when
//! the free space drops below the configured headroom. Software then owes
//! the pool a replacement, and the buffer itself stays alive until every
//! byte written into it has been copied out to a receive buffer.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use log::{debug, warn};

use crate::error::Result;
use crate::match_bits::{MatchBits, TAG_MASK};
use crate::nic::{AppendCmd, LeFlags, MemDesc, Nic, PtlList};
use crate::req::{OflowReq, ReqCallback, ReqId, ReqState, ReqTable};

/// Alignment for overflow buffers (cache line).
pub const OFLOW_BUF_ALIGN: usize = 64;

/// Pool sizing attributes.
#[derive(Debug, Clone)]
pub struct OflowAttr {
    /// List the buffers append to: the overflow list for hardware-managed
    /// matching, the request list for software-managed matching.
    pub list: PtlList,
    pub buf_size: usize,
    pub min_posted: usize,
    pub max_cached: usize,
    /// Auto-unlink headroom: the entry unlinks when free space drops below
    /// this (the maximum eager payload).
    pub min_free: usize,
}

/// One overflow buffer.
pub struct OflowBuf {
    ptr: NonNull<u8>,
    capacity: usize,
    md: Option<MemDesc>,
    /// Bytes copied out so far.
    cur_offset: usize,
    /// Bytes the NIC wrote before unlinking; consumption target.
    unlink_length: Option<usize>,
    /// Owning overflow request.
    pub req: ReqId,
    linked: bool,
}

impl std::fmt::Debug for OflowBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OflowBuf")
            .field("addr", &self.addr())
            .field("capacity", &self.capacity)
            .field("cur_offset", &self.cur_offset)
            .field("unlink_length", &self.unlink_length)
            .field("req", &self.req)
            .field("linked", &self.linked)
            .finish()
    }
}

impl OflowBuf {
    fn new(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity, OFLOW_BUF_ALIGN)
            .expect("overflow buffer layout");
        let ptr = unsafe {
            let p = alloc(layout);
            assert!(!p.is_null(), "overflow buffer allocation failed");
            NonNull::new_unchecked(p)
        };
        Self {
            ptr,
            capacity,
            md: None,
            cur_offset: 0,
            unlink_length: None,
            req: 0,
            linked: false,
        }
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn reset(&mut self) {
        self.cur_offset = 0;
        self.unlink_length = None;
        self.req = 0;
        self.linked = false;
    }

    #[inline]
    fn consumed(&self) -> bool {
        matches!(self.unlink_length, Some(len) if self.cur_offset == len)
    }
}

impl Drop for OflowBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, OFLOW_BUF_ALIGN).unwrap();
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

/// The pool: linked buffers, a bounded cache of free ones, counters.
#[derive(Debug)]
pub struct OflowPool {
    attr: OflowAttr,
    bufs: Vec<Option<OflowBuf>>,
    /// Free buffer indices with memory retained.
    cache: Vec<usize>,
    /// Empty slots in `bufs`.
    free_slots: Vec<usize>,
    linked: usize,
}

impl OflowPool {
    pub fn new(attr: OflowAttr) -> Self {
        Self {
            attr,
            bufs: Vec::new(),
            cache: Vec::new(),
            free_slots: Vec::new(),
            linked: 0,
        }
    }

    #[inline]
    pub fn linked(&self) -> usize {
        self.linked
    }

    pub fn buf(&self, idx: usize) -> &OflowBuf {
        self.bufs[idx].as_ref().expect("live overflow buffer")
    }

    /// Append buffers until `min_posted` are linked.
    ///
    /// Returns `Error::Again` when the command queue refuses an append; the
    /// caller re-drives replenishment from the event path.
    pub fn replenish(&mut self, nic: &mut dyn Nic, reqs: &mut ReqTable) -> Result<()> {
        while self.linked < self.attr.min_posted {
            let idx = self.take_buf();

            let (addr, capacity) = {
                let buf = self.bufs[idx].as_ref().unwrap();
                (buf.addr(), buf.capacity())
            };

            let md = nic.map(addr as *const u8, capacity)?;
            let cb = if self.attr.list == PtlList::Overflow {
                ReqCallback::Oflow
            } else {
                ReqCallback::ReqBuf
            };
            let req_id = reqs.alloc(
                cb,
                ReqState::Oflow(OflowReq { buf_index: idx, list: self.attr.list }),
            );

            // Landing entries match any message-list put.
            let mut ignore = MatchBits(!0u64);
            ignore.set_tag(TAG_MASK);

            let cmd = AppendCmd {
                list: self.attr.list,
                buffer_id: req_id,
                addr,
                len: capacity,
                match_bits: MatchBits::new(),
                ignore_bits: ignore,
                match_id: crate::addr::MATCH_ID_ANY,
                min_free: self.attr.min_free,
                flags: LeFlags::MANAGE_LOCAL | LeFlags::OP_PUT | LeFlags::EVENT_UNLINK_DISABLE,
            };

            if let Err(e) = nic.append_le(cmd) {
                nic.unmap(md);
                reqs.free(req_id);
                self.recycle(idx);
                return Err(e);
            }

            {
                let buf = self.bufs[idx].as_mut().unwrap();
                buf.md = Some(md);
                buf.req = req_id;
                buf.linked = true;
            }
            self.linked += 1;

            debug!("oflow buffer linked: idx={} req={} addr={:#x}", idx, req_id, addr);
        }
        nic.ring();

        Ok(())
    }

    fn take_buf(&mut self) -> usize {
        if let Some(idx) = self.cache.pop() {
            return idx;
        }
        let buf = OflowBuf::new(self.attr.buf_size);
        if let Some(slot) = self.free_slots.pop() {
            self.bufs[slot] = Some(buf);
            slot
        } else {
            self.bufs.push(Some(buf));
            self.bufs.len() - 1
        }
    }

    fn recycle(&mut self, idx: usize) {
        if self.attr.max_cached == 0 || self.cache.len() < self.attr.max_cached {
            self.bufs[idx].as_mut().unwrap().reset();
            self.cache.push(idx);
        } else {
            self.bufs[idx] = None;
            self.free_slots.push(idx);
        }
    }

    /// The NIC auto-unlinked a buffer while delivering a put. Record how
    /// many bytes it wrote; the buffer frees once they are all copied out.
    pub fn auto_unlinked(
        &mut self,
        idx: usize,
        unlink_length: usize,
        nic: &mut dyn Nic,
        reqs: &mut ReqTable,
    ) {
        {
            let buf = self.bufs[idx].as_mut().unwrap();
            debug_assert!(buf.linked);
            buf.linked = false;
            buf.unlink_length = Some(unlink_length);
        }
        self.linked -= 1;

        debug!("oflow buffer auto-unlinked: idx={} unlink_length={}", idx, unlink_length);
        self.check_consumed(idx, nic, reqs);
    }

    /// Manual unlink completion; only observed during teardown.
    pub fn manual_unlinked(&mut self, idx: usize, nic: &mut dyn Nic, reqs: &mut ReqTable) {
        let req;
        {
            let buf = self.bufs[idx].as_mut().unwrap();
            if buf.linked {
                buf.linked = false;
                self.linked -= 1;
            }
            req = buf.req;
            if let Some(md) = buf.md.take() {
                nic.unmap(md);
            }
        }
        reqs.free(req);
        self.recycle(idx);
    }

    /// Append failed with no space; recycle and report for flow control.
    pub fn link_err(&mut self, idx: usize, nic: &mut dyn Nic, reqs: &mut ReqTable) {
        warn!("oflow buffer append failed: idx={}", idx);
        let req;
        {
            let buf = self.bufs[idx].as_mut().unwrap();
            debug_assert!(buf.linked);
            buf.linked = false;
            req = buf.req;
            if let Some(md) = buf.md.take() {
                nic.unmap(md);
            }
        }
        self.linked -= 1;
        reqs.free(req);
        self.recycle(idx);
    }

    /// Consume bytes copied out of a buffer.
    ///
    /// Zero-length unexpected messages carry no dependency on the buffer.
    pub fn put_bytes(&mut self, idx: usize, bytes: usize, nic: &mut dyn Nic, reqs: &mut ReqTable) {
        if bytes == 0 {
            return;
        }

        {
            let buf = self.bufs[idx].as_mut().unwrap();
            buf.cur_offset += bytes;
            debug!(
                "oflow putting {} bytes ({}/{:?}): idx={}",
                bytes, buf.cur_offset, buf.unlink_length, idx
            );
        }
        self.check_consumed(idx, nic, reqs);
    }

    fn check_consumed(&mut self, idx: usize, nic: &mut dyn Nic, reqs: &mut ReqTable) {
        let (consumed, req) = {
            let buf = self.bufs[idx].as_ref().unwrap();
            (buf.consumed(), buf.req)
        };
        if !consumed {
            return;
        }

        let buf = self.bufs[idx].as_mut().unwrap();
        if let Some(md) = buf.md.take() {
            nic.unmap(md);
        }
        reqs.free(req);
        self.recycle(idx);
        debug!("oflow buffer consumed: idx={}", idx);
    }

    /// Unlink every linked buffer; teardown with the portal disabled.
    pub fn fini(&mut self, nic: &mut dyn Nic) -> Result<()> {
        for (idx, slot) in self.bufs.iter().enumerate() {
            if let Some(buf) = slot {
                if buf.linked {
                    nic.unlink_le(self.attr.list, buf.req)?;
                    debug!("oflow unlink issued: idx={}", idx);
                }
            }
        }
        nic.ring();
        Ok(())
    }
}
