//! Binary trace records collected in a lock-free ring.
//!
//! Producers on any thread reserve a record with [`TraceBuffer::record_start`], append their
//! arguments and commit it by finishing (or dropping) the [`TraceRecord`]. Records become visible
//! strictly in reservation order. A single flushing thread calls [`TraceBuffer::drain`].

#![forbid(unsafe_code)]

mod event;
mod ring;

pub use event::{TraceEvent, TraceEvents};
pub use ring::{
    TraceArg, TraceArgs, TraceBuffer, TraceEntry, TraceRecord, RECORD_ALIGN, RECORD_HEADER_LEN,
    RECORD_VALID,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceError {
    #[error("trace buffer full")]
    Full,

    #[error("trace record of {len} bytes does not fit a {capacity}-byte buffer")]
    TooLarge { len: usize, capacity: usize },

    #[error("event id {0:#x} is reserved")]
    ReservedEventId(u64),

    #[error("malformed trace argument at offset {0}")]
    MalformedArgs(usize),
}

pub type Result<T> = std::result::Result<T, TraceError>;
