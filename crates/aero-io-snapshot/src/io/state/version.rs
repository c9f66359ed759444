use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Magic prefix of every device snapshot blob.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"AERO";

/// Version of the TLV container itself (not of any particular device).
pub const SNAPSHOT_FORMAT_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("snapshot truncated")]
    UnexpectedEof,
    #[error("invalid snapshot magic")]
    InvalidMagic,
    #[error("unsupported snapshot format version {0}")]
    UnsupportedFormatVersion(SnapshotVersion),
    #[error("snapshot device id mismatch (expected {expected:?}, found {found:?})")]
    DeviceIdMismatch { expected: [u8; 4], found: [u8; 4] },
    #[error("unsupported device major version {found} (supported {supported})")]
    UnsupportedDeviceMajorVersion { found: u16, supported: u16 },
    #[error("duplicate snapshot field tag {0}")]
    DuplicateFieldTag(u16),
    #[error("invalid snapshot field encoding: {0}")]
    InvalidFieldEncoding(&'static str),
    #[error("missing snapshot field `{0}`")]
    MissingField(&'static str),
    #[error("section `{section}` version {version} is older than the minimum {minimum}")]
    VersionTooOld {
        section: String,
        version: u16,
        minimum: u16,
    },
    #[error("section `{section}` version {version} is newer than supported {supported}")]
    VersionTooNew {
        section: String,
        version: u16,
        supported: u16,
    },
    #[error("no registered section `{section}` for instance {instance_id}")]
    UnknownSection { section: String, instance_id: u32 },
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Fixed-size header preceding the TLV field list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub format_version: SnapshotVersion,
    pub device_id: [u8; 4],
    pub device_version: SnapshotVersion,
}

impl SnapshotHeader {
    fn encode(&self) -> Vec<u8> {
        codec::Encoder::new()
            .bytes(&SNAPSHOT_MAGIC)
            .u16(self.format_version.major)
            .u16(self.format_version.minor)
            .bytes(&self.device_id)
            .u16(self.device_version.major)
            .u16(self.device_version.minor)
            .finish()
    }

    /// Parses the header and returns it along with the remaining field bytes.
    pub fn parse(bytes: &[u8]) -> SnapshotResult<(Self, &[u8])> {
        if bytes.len() < HEADER_LEN {
            return Err(SnapshotError::UnexpectedEof);
        }
        let (head, rest) = bytes.split_at(HEADER_LEN);
        let mut d = codec::Decoder::new(head);
        if d.bytes(4)? != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let format_version = SnapshotVersion::new(d.u16()?, d.u16()?);
        if format_version.major != SNAPSHOT_FORMAT_VERSION.major {
            return Err(SnapshotError::UnsupportedFormatVersion(format_version));
        }
        let mut device_id = [0u8; 4];
        device_id.copy_from_slice(d.bytes(4)?);
        let device_version = SnapshotVersion::new(d.u16()?, d.u16()?);
        d.finish()?;

        Ok((
            Self {
                format_version,
                device_id,
                device_version,
            },
            rest,
        ))
    }
}

/// Builds a snapshot blob. Fields are emitted in ascending tag order so the output is
/// deterministic regardless of the order the device wrote them in.
pub struct SnapshotWriter {
    header: SnapshotHeader,
    fields: BTreeMap<u16, Vec<u8>>,
}

impl SnapshotWriter {
    pub fn new(device_id: [u8; 4], device_version: SnapshotVersion) -> Self {
        Self {
            header: SnapshotHeader {
                format_version: SNAPSHOT_FORMAT_VERSION,
                device_id,
                device_version,
            },
            fields: BTreeMap::new(),
        }
    }

    pub fn field_bytes(&mut self, tag: u16, bytes: Vec<u8>) {
        let prev = self.fields.insert(tag, bytes);
        assert!(prev.is_none(), "snapshot field tag {tag} written twice");
    }

    pub fn field_u8(&mut self, tag: u16, v: u8) {
        self.field_bytes(tag, vec![v]);
    }

    pub fn field_bool(&mut self, tag: u16, v: bool) {
        self.field_u8(tag, u8::from(v));
    }

    pub fn field_u16(&mut self, tag: u16, v: u16) {
        self.field_bytes(tag, v.to_le_bytes().to_vec());
    }

    pub fn field_u32(&mut self, tag: u16, v: u32) {
        self.field_bytes(tag, v.to_le_bytes().to_vec());
    }

    pub fn field_u64(&mut self, tag: u16, v: u64) {
        self.field_bytes(tag, v.to_le_bytes().to_vec());
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = self.header.encode();
        for (tag, bytes) in self.fields {
            let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&bytes);
        }
        out
    }
}

/// Parsed view over a snapshot blob. Unknown tags are kept but ignored by callers, which keeps
/// minor-version additions loadable by older code.
pub struct SnapshotReader<'a> {
    header: SnapshotHeader,
    fields: BTreeMap<u16, &'a [u8]>,
}

impl<'a> SnapshotReader<'a> {
    pub fn parse(bytes: &'a [u8], expected_device_id: [u8; 4]) -> SnapshotResult<Self> {
        let (header, mut rest) = SnapshotHeader::parse(bytes)?;
        if header.device_id != expected_device_id {
            return Err(SnapshotError::DeviceIdMismatch {
                expected: expected_device_id,
                found: header.device_id,
            });
        }

        let mut fields = BTreeMap::new();
        while !rest.is_empty() {
            let mut d = codec::Decoder::new(rest);
            let tag = d.u16()?;
            let len = d.u32()? as usize;
            let value = d.bytes(len)?;
            if fields.insert(tag, value).is_some() {
                return Err(SnapshotError::DuplicateFieldTag(tag));
            }
            rest = d.remaining();
        }

        Ok(Self { header, fields })
    }

    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }

    pub fn ensure_device_major(&self, supported: u16) -> SnapshotResult<()> {
        let found = self.header.device_version.major;
        if found != supported {
            return Err(SnapshotError::UnsupportedDeviceMajorVersion { found, supported });
        }
        Ok(())
    }

    pub fn bytes(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields.get(&tag).copied()
    }

    fn fixed<const N: usize>(&self, tag: u16, what: &'static str) -> SnapshotResult<Option<[u8; N]>> {
        match self.bytes(tag) {
            None => Ok(None),
            Some(buf) => buf
                .try_into()
                .map(Some)
                .map_err(|_| SnapshotError::InvalidFieldEncoding(what)),
        }
    }

    pub fn u8(&self, tag: u16) -> SnapshotResult<Option<u8>> {
        Ok(self.fixed::<1>(tag, "u8")?.map(|b| b[0]))
    }

    pub fn bool(&self, tag: u16) -> SnapshotResult<Option<bool>> {
        match self.u8(tag)? {
            None => Ok(None),
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            Some(_) => Err(SnapshotError::InvalidFieldEncoding("bool")),
        }
    }

    pub fn u16(&self, tag: u16) -> SnapshotResult<Option<u16>> {
        Ok(self.fixed::<2>(tag, "u16")?.map(u16::from_le_bytes))
    }

    pub fn u32(&self, tag: u16) -> SnapshotResult<Option<u32>> {
        Ok(self.fixed::<4>(tag, "u32")?.map(u32::from_le_bytes))
    }

    pub fn u64(&self, tag: u16) -> SnapshotResult<Option<u64>> {
        Ok(self.fixed::<8>(tag, "u64")?.map(u64::from_le_bytes))
    }
}

/// Little-endian byte builders used inside composite fields.
pub mod codec {
    use super::{SnapshotError, SnapshotResult};

    #[derive(Debug, Default)]
    pub struct Encoder {
        buf: Vec<u8>,
    }

    impl Encoder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn u8(mut self, v: u8) -> Self {
            self.buf.push(v);
            self
        }

        pub fn bool(self, v: bool) -> Self {
            self.u8(u8::from(v))
        }

        pub fn u16(mut self, v: u16) -> Self {
            self.buf.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn u32(mut self, v: u32) -> Self {
            self.buf.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn u64(mut self, v: u64) -> Self {
            self.buf.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn bytes(mut self, v: &[u8]) -> Self {
            self.buf.extend_from_slice(v);
            self
        }

        pub fn finish(self) -> Vec<u8> {
            self.buf
        }
    }

    #[derive(Debug)]
    pub struct Decoder<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Decoder<'a> {
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, pos: 0 }
        }

        pub fn bytes(&mut self, len: usize) -> SnapshotResult<&'a [u8]> {
            let end = self
                .pos
                .checked_add(len)
                .filter(|&end| end <= self.buf.len())
                .ok_or(SnapshotError::UnexpectedEof)?;
            let out = &self.buf[self.pos..end];
            self.pos = end;
            Ok(out)
        }

        fn array<const N: usize>(&mut self) -> SnapshotResult<[u8; N]> {
            let mut out = [0u8; N];
            out.copy_from_slice(self.bytes(N)?);
            Ok(out)
        }

        pub fn u8(&mut self) -> SnapshotResult<u8> {
            Ok(self.array::<1>()?[0])
        }

        pub fn bool(&mut self) -> SnapshotResult<bool> {
            match self.u8()? {
                0 => Ok(false),
                1 => Ok(true),
                _ => Err(SnapshotError::InvalidFieldEncoding("bool")),
            }
        }

        pub fn u16(&mut self) -> SnapshotResult<u16> {
            Ok(u16::from_le_bytes(self.array()?))
        }

        pub fn u32(&mut self) -> SnapshotResult<u32> {
            Ok(u32::from_le_bytes(self.array()?))
        }

        pub fn u64(&mut self) -> SnapshotResult<u64> {
            Ok(u64::from_le_bytes(self.array()?))
        }

        pub fn remaining(&self) -> &'a [u8] {
            &self.buf[self.pos..]
        }

        /// Fails if any bytes were left unread.
        pub fn finish(self) -> SnapshotResult<()> {
            if self.pos != self.buf.len() {
                return Err(SnapshotError::InvalidFieldEncoding("trailing bytes"));
            }
            Ok(())
        }
    }
}
