//! Deferred-event table.
//!
//! Every Put Overflow event has a matching Put event, generated in either
//! order; progress requires both. The first of a pair parks here, keyed by
//! {initiator, rendezvous id} for rendezvous transactions and by the
//! overflow-buffer start address otherwise. The second of the pair finds and
//! consumes the record.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::nic::{Event, EventType};
use crate::req::ReqId;

/// Bucket count; power of two sized for a few thousand live entries.
pub const DEF_EVENT_HT_BUCKETS: usize = 256;

const KEY_RDZV_BIT: u64 = 1 << 63;

/// Packed correlation key.
///
/// The rendezvous arm sets the top bit; the overflow arm is the raw start
/// address. Aliasing between the arms is resolved by the full comparison in
/// [`DeferredEvents::match_put_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefKey(u64);

impl DefKey {
    pub fn from_event(ev: &Event) -> Self {
        if ev.rendezvous {
            DefKey(KEY_RDZV_BIT | ((ev.initiator as u64) << 16) | ev.rdzv_id() as u64)
        } else {
            DefKey(ev.start)
        }
    }

    #[inline]
    fn bucket(self) -> usize {
        let mut h = DefaultHasher::new();
        self.0.hash(&mut h);
        (h.finish() as usize) & (DEF_EVENT_HT_BUCKETS - 1)
    }
}

/// One parked event awaiting its pair.
#[derive(Debug)]
pub struct DeferredEvent {
    pub key: DefKey,
    /// Request whose second event is awaited; a receive for priority-list
    /// traffic, the onload search request during recovery.
    pub req: ReqId,
    pub ev: Event,
    /// Onloaded unexpected-send record awaiting its Put event.
    pub ux_id: Option<u64>,
    /// Multi-receive placement recorded at Put-Overflow time.
    pub mrecv_start: usize,
    pub mrecv_len: usize,
}

/// Handle to a live table entry; valid until the entry is removed.
#[derive(Debug, Clone, Copy)]
pub struct DefHandle {
    bucket: usize,
    idx: usize,
}

/// The table: fixed bucket array, linear scan within a bucket.
#[derive(Debug)]
pub struct DeferredEvents {
    buckets: Vec<Vec<DeferredEvent>>,
    len: usize,
}

impl Default for DeferredEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredEvents {
    pub fn new() -> Self {
        Self {
            buckets: (0..DEF_EVENT_HT_BUCKETS).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    /// Find the pair of `ev`, or park it.
    ///
    /// Returns `(true, handle)` when a matching record exists; the caller
    /// consumes it with [`remove`](Self::remove) once progress succeeds.
    /// Returns `(false, handle)` when `ev` was inserted at the bucket tail;
    /// the handle allows fixup of the fresh record.
    pub fn match_put_event(&mut self, req: ReqId, ev: &Event) -> (bool, DefHandle) {
        let key = DefKey::from_event(ev);
        let match_type = if ev.event_type == EventType::Put {
            EventType::PutOverflow
        } else {
            EventType::Put
        };

        let bucket = key.bucket();
        for (idx, def_ev) in self.buckets[bucket].iter().enumerate() {
            if def_ev.key == key
                && def_ev.ev.event_type == match_type
                && def_ev.ev.rc == ev.rc
                && def_ev.ev.initiator == ev.initiator
                && def_ev.ev.match_bits == ev.match_bits
            {
                return (true, DefHandle { bucket, idx });
            }
        }

        self.buckets[bucket].push(DeferredEvent {
            key,
            req,
            ev: ev.clone(),
            ux_id: None,
            mrecv_start: 0,
            mrecv_len: 0,
        });
        self.len += 1;

        (
            false,
            DefHandle {
                bucket,
                idx: self.buckets[bucket].len() - 1,
            },
        )
    }

    pub fn get_mut(&mut self, h: DefHandle) -> &mut DeferredEvent {
        &mut self.buckets[h.bucket][h.idx]
    }

    /// Remove a record previously located or inserted.
    pub fn remove(&mut self, h: DefHandle) -> DeferredEvent {
        self.len -= 1;
        self.buckets[h.bucket].remove(h.idx)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drain every record; teardown with the portal disabled.
    pub fn drain_all(&mut self) -> Vec<DeferredEvent> {
        self.len = 0;
        let mut out = Vec::new();
        for bucket in &mut self.buckets {
            out.append(bucket);
        }
        out
    }
}
