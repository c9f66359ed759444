//! Multi-producer, single-consumer ring of variable-length trace records.
//!
//! The data area is an array of 64-bit atomic words. Every record starts on a word boundary:
//! - word 0: event id
//! - word 1: timestamp in nanoseconds since the buffer was created
//! - word 2: record length in bytes (low half), producer pid (high half)
//! - argument bytes, zero-padded to the next word
//!
//! Producers reserve space by advancing `tail_reserve`, fill their slot, then publish it by
//! storing the event id with [`RECORD_VALID`] set (release). The consumer stops at the first slot
//! that is not valid yet, so records surface in reservation order. After reading a record the
//! consumer zeroes its words before releasing the space, which keeps every free word zero.
//!
//! A record that would straddle the end of the data area is preceded by a wrap marker padding out
//! the rest of the area. The marker has the valid bit clear, so no published id word can equal it.
//! An empty ring skips the padding outright instead of charging it against free space.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::event::TraceEvents;
use crate::{Result, TraceError};

pub const RECORD_HEADER_LEN: usize = 24;
pub const RECORD_ALIGN: usize = 8;

/// Set in the id word of a published record. Event ids must leave it clear.
pub const RECORD_VALID: u64 = 1 << 63;

const WRAP_MARKER: u64 = !RECORD_VALID;

const fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}

pub struct TraceBuffer {
    words: Box<[AtomicU64]>,
    cap: u64,
    head: AtomicU64,
    tail_reserve: AtomicU64,
    dropped: AtomicU64,
    events: TraceEvents,
    epoch: Instant,
    pid: u32,
}

impl std::fmt::Debug for TraceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceBuffer")
            .field("capacity", &self.cap)
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail_reserve.load(Ordering::Relaxed))
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl TraceBuffer {
    /// `capacity_bytes` must be a non-zero multiple of [`RECORD_ALIGN`].
    pub fn new(capacity_bytes: usize, events: TraceEvents) -> Self {
        assert!(capacity_bytes > 0);
        assert_eq!(capacity_bytes % RECORD_ALIGN, 0);
        let words = (0..capacity_bytes / RECORD_ALIGN)
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            words,
            cap: capacity_bytes as u64,
            head: AtomicU64::new(0),
            tail_reserve: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            events,
            epoch: Instant::now(),
            pid: std::process::id(),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.cap as usize
    }

    pub fn events(&self) -> &TraceEvents {
        &self.events
    }

    /// Records rejected because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail_reserve.load(Ordering::Acquire)
    }

    /// Bytes a record with `arglen` argument bytes occupies in the ring.
    pub fn record_size(arglen: usize) -> usize {
        align_up(RECORD_HEADER_LEN + arglen, RECORD_ALIGN)
    }

    /// Reserves a slot for event `event_id` with room for `arglen` argument bytes.
    ///
    /// The slot is published when the returned record is finished or dropped; until then every
    /// later record stays invisible to the consumer.
    pub fn record_start(&self, event_id: u64, arglen: usize) -> Result<TraceRecord<'_>> {
        if event_id & RECORD_VALID != 0 {
            return Err(TraceError::ReservedEventId(event_id));
        }
        if arglen > self.capacity_bytes() || Self::record_size(arglen) > self.capacity_bytes() {
            return Err(TraceError::TooLarge {
                len: RECORD_HEADER_LEN.saturating_add(arglen),
                capacity: self.capacity_bytes(),
            });
        }
        let size = Self::record_size(arglen) as u64;

        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail_reserve.load(Ordering::Acquire);

            let used = tail.wrapping_sub(head);
            if used > self.cap {
                // Raced with the consumer advancing `head` between the two loads.
                continue;
            }
            let free = self.cap - used;

            let remaining = self.cap - tail % self.cap;
            let padding = if remaining < size { remaining } else { 0 };
            if padding + size > free && used == 0 {
                // Nothing is queued: move both cursors to the start of the data area. The skipped
                // words are already zero, so the consumer stops there until `head` catches up.
                let aligned = tail + padding;
                if self
                    .tail_reserve
                    .compare_exchange(tail, aligned, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let _ = self.head.compare_exchange(
                        head,
                        aligned,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
                continue;
            }
            if padding + size > free {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(TraceError::Full);
            }

            let new_tail = tail + padding + size;
            if self
                .tail_reserve
                .compare_exchange(tail, new_tail, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            if padding != 0 {
                self.words[self.word_index(tail)].store(WRAP_MARKER, Ordering::Release);
            }
            let timestamp = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
            return Ok(TraceRecord {
                buf: self,
                start: tail + padding,
                end: new_tail,
                event_id,
                timestamp,
                arglen,
                data: Vec::with_capacity(arglen),
            });
        }
    }

    /// Records `event_id` with `args` if the event is enabled. Returns whether anything was
    /// written.
    pub fn trace(&self, event_id: u64, args: &[TraceArg<'_>]) -> Result<bool> {
        if !self.events.is_enabled(event_id) {
            return Ok(false);
        }
        let arglen = args.iter().map(TraceArg::encoded_len).sum();
        let mut rec = self.record_start(event_id, arglen)?;
        for arg in args {
            match *arg {
                TraceArg::U64(v) => rec.write_u64(v),
                TraceArg::Str(s) => rec.write_str(s),
            }
        }
        rec.finish();
        Ok(true)
    }

    fn word_index(&self, pos: u64) -> usize {
        ((pos % self.cap) as usize) / RECORD_ALIGN
    }

    fn store_word(&self, pos: u64, value: u64) {
        self.words[self.word_index(pos)].store(value, Ordering::Relaxed);
    }

    fn load_word(&self, pos: u64) -> u64 {
        self.words[self.word_index(pos)].load(Ordering::Relaxed)
    }

    fn clear(&self, from: u64, to: u64) {
        let mut pos = from;
        while pos < to {
            self.store_word(pos, 0);
            pos += RECORD_ALIGN as u64;
        }
    }

    /// Removes every published record up to the first one still being written, oldest first.
    /// Only one thread may drain at a time.
    pub fn drain(&self) -> Vec<TraceEntry> {
        let mut out = Vec::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail_reserve.load(Ordering::Acquire);
            if head == tail {
                break;
            }

            let id_word = self.words[self.word_index(head)].load(Ordering::Acquire);
            if self.head.load(Ordering::Acquire) != head {
                // A producer realigned the empty ring after `head` was loaded.
                continue;
            }
            let remaining = self.cap - head % self.cap;
            if id_word == WRAP_MARKER {
                self.store_word(head, 0);
                self.head.store(head + remaining, Ordering::Release);
                continue;
            }
            if id_word & RECORD_VALID == 0 {
                break;
            }

            let timestamp_ns = self.load_word(head + 8);
            let len_pid = self.load_word(head + 16);
            let len = (len_pid & 0xFFFF_FFFF) as usize;
            let pid = (len_pid >> 32) as u32;
            let total = align_up(len, RECORD_ALIGN) as u64;
            if len < RECORD_HEADER_LEN || total > remaining || total > tail - head {
                tracing::error!(head, len, "corrupt trace record, dropping the rest of the ring");
                self.clear(head, head + remaining);
                self.head.store(head + remaining, Ordering::Release);
                break;
            }

            let mut args = Vec::with_capacity(total as usize - RECORD_HEADER_LEN);
            let mut pos = head + RECORD_HEADER_LEN as u64;
            while pos < head + total {
                args.extend_from_slice(&self.load_word(pos).to_le_bytes());
                pos += RECORD_ALIGN as u64;
            }
            args.truncate(len - RECORD_HEADER_LEN);

            out.push(TraceEntry {
                event_id: id_word & !RECORD_VALID,
                timestamp_ns,
                pid,
                args,
            });
            self.clear(head, head + total);
            self.head.store(head + total, Ordering::Release);
        }
        out
    }
}

/// A reserved, not yet published record.
pub struct TraceRecord<'a> {
    buf: &'a TraceBuffer,
    start: u64,
    end: u64,
    event_id: u64,
    timestamp: u64,
    arglen: usize,
    data: Vec<u8>,
}

impl TraceRecord<'_> {
    fn append(&mut self, bytes: &[u8]) {
        assert!(
            self.data.len() + bytes.len() <= self.arglen,
            "trace record for event {} overflows its {} argument bytes",
            self.event_id,
            self.arglen
        );
        self.data.extend_from_slice(bytes);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.append(&v.to_le_bytes());
    }

    /// Writes a `u32` length followed by the bytes of `s`.
    pub fn write_str(&mut self, s: &str) {
        let len = u32::try_from(s.len()).unwrap_or(u32::MAX);
        self.append(&len.to_le_bytes());
        self.append(&s.as_bytes()[..len as usize]);
    }

    /// Publishes the record.
    pub fn finish(self) {}

    fn commit(&mut self) {
        let buf = self.buf;
        let len = (RECORD_HEADER_LEN + self.arglen) as u64;
        buf.store_word(self.start + 8, self.timestamp);
        buf.store_word(self.start + 16, len | (u64::from(buf.pid) << 32));

        let mut pos = self.start + RECORD_HEADER_LEN as u64;
        let mut chunks = self.data.chunks(RECORD_ALIGN);
        while pos < self.end {
            let mut word = [0u8; RECORD_ALIGN];
            if let Some(chunk) = chunks.next() {
                word[..chunk.len()].copy_from_slice(chunk);
            }
            buf.store_word(pos, u64::from_le_bytes(word));
            pos += RECORD_ALIGN as u64;
        }

        buf.words[buf.word_index(self.start)].store(self.event_id | RECORD_VALID, Ordering::Release);
    }
}

impl Drop for TraceRecord<'_> {
    fn drop(&mut self) {
        self.commit();
    }
}

/// One argument for [`TraceBuffer::trace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceArg<'a> {
    U64(u64),
    Str(&'a str),
}

impl TraceArg<'_> {
    fn encoded_len(&self) -> usize {
        match self {
            Self::U64(_) => 8,
            Self::Str(s) => 4 + s.len(),
        }
    }
}

/// A committed record read back by [`TraceBuffer::drain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub event_id: u64,
    pub timestamp_ns: u64,
    pub pid: u32,
    pub args: Vec<u8>,
}

impl TraceEntry {
    pub fn args(&self) -> TraceArgs<'_> {
        TraceArgs {
            buf: &self.args,
            pos: 0,
        }
    }
}

/// Reads arguments back in the order they were written.
#[derive(Debug, Clone)]
pub struct TraceArgs<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TraceArgs<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(TraceError::MalformedArgs(self.pos))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    pub fn str(&mut self) -> Result<&'a str> {
        let at = self.pos;
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        let bytes = self.take(u32::from_le_bytes(b) as usize)?;
        std::str::from_utf8(bytes).map_err(|_| TraceError::MalformedArgs(at))
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }
}
