use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ferry_na::{Address, MemBuffer, MemToken, NetworkLayer};

use crate::context::Context;
use crate::proc::{Decoder, Encoder, Proc};
use crate::{Error, Result};

// count + mode + total, then base + len + token length per segment
const HEADER_LEN: usize = 4 + 1 + 8;
const MIN_SEGMENT_LEN: usize = 8 + 8 + 4;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkAccess {
    ReadOnly = 1,
    WriteOnly = 2,
    ReadWrite = 3,
}

impl BulkAccess {
    /// Whether transfers may read from a region with this mode.
    #[inline]
    pub fn can_read(self) -> bool {
        matches!(self, BulkAccess::ReadOnly | BulkAccess::ReadWrite)
    }

    /// Whether transfers may write into a region with this mode.
    #[inline]
    pub fn can_write(self) -> bool {
        matches!(self, BulkAccess::WriteOnly | BulkAccess::ReadWrite)
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(BulkAccess::ReadOnly),
            2 => Some(BulkAccess::WriteOnly),
            3 => Some(BulkAccess::ReadWrite),
            _ => None,
        }
    }
}

/// One contiguous piece of a region, addressed by the owner's virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Segment {
    pub base: u64,
    pub len: u64,
}

/// A slice of a local buffer to expose through a descriptor.
#[derive(Debug, Clone)]
pub struct LocalSegment {
    pub buf: MemBuffer,
    pub offset: u64,
    pub len: u64,
}

impl LocalSegment {
    pub fn new(buf: MemBuffer, offset: u64, len: u64) -> Self {
        LocalSegment { buf, offset, len }
    }

    pub fn whole(buf: MemBuffer) -> Self {
        let len = buf.len() as u64;
        LocalSegment {
            buf,
            offset: 0,
            len,
        }
    }
}

enum Origin {
    Local {
        na: Arc<dyn NetworkLayer>,
        parts: Vec<LocalSegment>,
        // Distinct registrations; every segment token is a copy of one of these.
        registrations: Vec<MemToken>,
    },
    Remote {
        peer: Option<Address>,
    },
}

struct Inner {
    access: BulkAccess,
    total: u64,
    segments: Vec<Segment>,
    // Offset of each segment within the region.
    starts: Vec<u64>,
    tokens: Vec<MemToken>,
    origin: Origin,
    freed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Origin::Local {
            na, registrations, ..
        } = &self.origin
        {
            if !self.freed.load(Ordering::Acquire) {
                for token in registrations {
                    let _ = na.mem_deregister(token);
                }
            }
        }
    }
}

/// Description of a memory region reachable by one-sided transfers.
///
/// A local descriptor refers to memory this process registered; it stays registered until
/// [`free`](BulkDescriptor::free) is called or the last clone is dropped, and must outlive
/// every transfer that uses it. A remote descriptor is an immutable proxy for a peer's region,
/// usable only as the target of transfers.
#[derive(Clone)]
pub struct BulkDescriptor {
    inner: Arc<Inner>,
}

fn check_layout(segments: &[Segment]) -> std::result::Result<u64, String> {
    if segments.is_empty() {
        return Err(String::from("no segments"));
    }
    let mut total = 0u64;
    for seg in segments {
        if seg.len == 0 {
            return Err(String::from("zero-length segment"));
        }
        seg.base
            .checked_add(seg.len)
            .ok_or_else(|| format!("segment at {:#x} wraps the address space", seg.base))?;
        total = total
            .checked_add(seg.len)
            .ok_or_else(|| String::from("total length overflows"))?;
    }
    let mut sorted: Vec<_> = segments.to_vec();
    sorted.sort_unstable_by_key(|s| s.base);
    for pair in sorted.windows(2) {
        if pair[0].base + pair[0].len > pair[1].base {
            return Err(format!(
                "segments at {:#x} and {:#x} overlap",
                pair[0].base, pair[1].base
            ));
        }
    }
    Ok(total)
}

fn prefix_starts(segments: &[Segment]) -> Vec<u64> {
    segments
        .iter()
        .scan(0u64, |acc, s| {
            let start = *acc;
            *acc += s.len;
            Some(start)
        })
        .collect()
}

impl BulkDescriptor {
    /// Register the first `len` bytes of `buf`.
    pub fn create(ctx: &Context, buf: &MemBuffer, len: u64, access: BulkAccess) -> Result<Self> {
        Self::create_segments(ctx, vec![LocalSegment::new(buf.clone(), 0, len)], access)
    }

    /// Register a scatter/gather region made of `parts`, in order.
    pub fn create_segments(
        ctx: &Context,
        parts: Vec<LocalSegment>,
        access: BulkAccess,
    ) -> Result<Self> {
        for part in &parts {
            let end = part.offset.checked_add(part.len);
            if !matches!(end, Some(end) if end <= part.buf.len() as u64) {
                return Err(Error::InvalidArgument(format!(
                    "segment [{}, +{}) exceeds a {}-byte buffer",
                    part.offset,
                    part.len,
                    part.buf.len()
                )));
            }
        }
        let segments: Vec<Segment> = parts
            .iter()
            .map(|p| Segment {
                base: p.buf.base_addr() + p.offset,
                len: p.len,
            })
            .collect();
        let total = check_layout(&segments).map_err(Error::InvalidArgument)?;

        let na = Arc::clone(ctx.na());
        let mut registered: Vec<(MemBuffer, MemToken)> = Vec::new();
        let mut tokens = Vec::with_capacity(parts.len());
        for part in &parts {
            let token = match registered.iter().find(|(b, _)| b.ptr_eq(&part.buf)) {
                Some((_, token)) => token.clone(),
                None => match na.mem_register(&part.buf) {
                    Ok(token) => {
                        registered.push((part.buf.clone(), token.clone()));
                        token
                    }
                    Err(e) => {
                        for (_, token) in &registered {
                            let _ = na.mem_deregister(token);
                        }
                        return Err(e.into());
                    }
                },
            };
            tokens.push(token);
        }
        let registrations = registered.into_iter().map(|(_, t)| t).collect();

        Ok(BulkDescriptor {
            inner: Arc::new(Inner {
                access,
                total,
                starts: prefix_starts(&segments),
                segments,
                tokens,
                origin: Origin::Local {
                    na,
                    parts,
                    registrations,
                },
                freed: AtomicBool::new(false),
            }),
        })
    }

    /// Allocate a zeroed buffer of `len` bytes and register it.
    pub fn alloc(ctx: &Context, len: u64, access: BulkAccess) -> Result<Self> {
        let len_usize = usize::try_from(len)
            .map_err(|_| Error::InvalidArgument(format!("cannot allocate {} bytes", len)))?;
        let mut v = Vec::new();
        v.try_reserve_exact(len_usize)?;
        v.resize(len_usize, 0);
        Self::create(ctx, &MemBuffer::from_vec(v), len, access)
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.inner.total
    }

    #[inline]
    pub fn segments(&self) -> &[Segment] {
        &self.inner.segments
    }

    #[inline]
    pub fn access(&self) -> BulkAccess {
        self.inner.access
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        matches!(self.inner.origin, Origin::Local { .. })
    }

    /// The peer owning a remote region, if known.
    pub fn peer(&self) -> Option<&Address> {
        match &self.inner.origin {
            Origin::Remote { peer } => peer.as_ref(),
            Origin::Local { .. } => None,
        }
    }

    #[inline]
    pub fn is_freed(&self) -> bool {
        self.inner.freed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.is_freed() {
            Err(Error::AlreadyFreed)
        } else {
            Ok(())
        }
    }

    #[inline]
    pub(crate) fn token(&self, segment: usize) -> &MemToken {
        &self.inner.tokens[segment]
    }

    /// Bind a remote descriptor to the peer that owns it.
    pub fn with_peer(&self, peer: Address) -> Result<Self> {
        if self.is_local() {
            return Err(Error::InvalidArgument(String::from(
                "a local descriptor cannot be bound to a peer",
            )));
        }
        Ok(BulkDescriptor {
            inner: Arc::new(Inner {
                access: self.inner.access,
                total: self.inner.total,
                segments: self.inner.segments.clone(),
                starts: self.inner.starts.clone(),
                tokens: self.inner.tokens.clone(),
                origin: Origin::Remote { peer: Some(peer) },
                freed: AtomicBool::new(false),
            }),
        })
    }

    /// Release the region. Local memory is deregistered; transfers issued afterwards fail with
    /// `AlreadyFreed`.
    pub fn free(&self) -> Result<()> {
        if self.inner.freed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyFreed);
        }
        if let Origin::Local {
            na, registrations, ..
        } = &self.inner.origin
        {
            for token in registrations {
                na.mem_deregister(token)?;
            }
        }
        Ok(())
    }

    pub fn encode_into(&self, enc: &mut Encoder) -> Result<()> {
        enc.put_len(self.inner.segments.len())?;
        enc.put_u8(self.inner.access as u8)?;
        enc.put_u64(self.inner.total)?;
        for (seg, token) in self.inner.segments.iter().zip(&self.inner.tokens) {
            enc.put_u64(seg.base)?;
            enc.put_u64(seg.len)?;
            enc.put_bytes(token.as_bytes())?;
        }
        Ok(())
    }

    /// Read a descriptor in wire format. The result is remote and bound to the decoder's peer.
    pub fn decode_from(dec: &mut Decoder<'_>) -> Result<Self> {
        let corrupt = |e: Error| match e {
            Error::DecodeFailed(msg) => Error::CorruptDescriptor(msg),
            e => e,
        };
        if dec.remaining() < HEADER_LEN {
            return Err(Error::CorruptDescriptor(String::from("truncated header")));
        }
        let count = dec.get_u32()? as usize;
        let mode = dec.get_u8()?;
        let total = dec.get_u64()?;
        let access = BulkAccess::from_u8(mode)
            .ok_or_else(|| Error::CorruptDescriptor(format!("invalid access mode {}", mode)))?;
        if count > dec.remaining() / MIN_SEGMENT_LEN {
            return Err(Error::CorruptDescriptor(format!(
                "{} segments cannot fit in {} bytes",
                count,
                dec.remaining()
            )));
        }
        let mut segments = Vec::with_capacity(count);
        let mut tokens = Vec::with_capacity(count);
        for _ in 0..count {
            let base = dec.get_u64().map_err(corrupt)?;
            let len = dec.get_u64().map_err(corrupt)?;
            let token = dec.get_bytes().map_err(corrupt)?;
            segments.push(Segment { base, len });
            tokens.push(MemToken(token.to_vec()));
        }
        let computed = check_layout(&segments).map_err(Error::CorruptDescriptor)?;
        if computed != total {
            return Err(Error::CorruptDescriptor(format!(
                "declared length {} but segments sum to {}",
                total, computed
            )));
        }
        Ok(BulkDescriptor {
            inner: Arc::new(Inner {
                access,
                total,
                starts: prefix_starts(&segments),
                segments,
                tokens,
                origin: Origin::Remote {
                    peer: dec.peer().cloned(),
                },
                freed: AtomicBool::new(false),
            }),
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::with_capacity(
            HEADER_LEN
                + self
                    .inner
                    .tokens
                    .iter()
                    .map(|t| MIN_SEGMENT_LEN + t.as_bytes().len())
                    .sum::<usize>(),
        )?;
        self.encode_into(&mut enc)?;
        Ok(enc.into_bytes())
    }

    /// Parse a remote descriptor. It carries no peer address until
    /// [`with_peer`](Self::with_peer) binds one.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let desc = Self::decode_from(&mut dec)?;
        if dec.remaining() != 0 {
            return Err(Error::CorruptDescriptor(format!(
                "{} trailing bytes",
                dec.remaining()
            )));
        }
        Ok(desc)
    }

    fn local_parts(&self) -> Result<&[LocalSegment]> {
        self.ensure_live()?;
        match &self.inner.origin {
            Origin::Local { parts, .. } => Ok(parts),
            Origin::Remote { .. } => Err(Error::InvalidArgument(String::from(
                "a remote descriptor cannot be dereferenced",
            ))),
        }
    }

    /// Split `[offset, offset + len)` of the region into `(segment, offset in segment, len)`.
    fn spans(&self, offset: u64, len: u64) -> Result<Vec<(usize, u64, u64)>> {
        let end = offset.checked_add(len);
        if !matches!(end, Some(end) if end <= self.inner.total) {
            return Err(Error::InvalidArgument(format!(
                "range [{}, +{}) exceeds a {}-byte region",
                offset, len, self.inner.total
            )));
        }
        let mut out = Vec::new();
        let mut cursor = offset;
        let mut left = len;
        while left > 0 {
            let seg = self.inner.starts.partition_point(|&s| s <= cursor) - 1;
            let within = cursor - self.inner.starts[seg];
            let n = left.min(self.inner.segments[seg].len - within);
            out.push((seg, within, n));
            cursor += n;
            left -= n;
        }
        Ok(out)
    }

    /// Copy `len` bytes starting at `offset` of a local region out into a vector.
    pub fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let parts = self.local_parts()?;
        let spans = self.spans(offset, len)?;
        let mut out = vec![0u8; len as usize];
        let mut pos = 0usize;
        for (seg, within, n) in spans {
            let part = &parts[seg];
            part.buf
                .read_at(part.offset + within, &mut out[pos..pos + n as usize])
                .map_err(Error::from)?;
            pos += n as usize;
        }
        Ok(out)
    }

    /// The whole local region, segments concatenated in order.
    pub fn read_to_vec(&self) -> Result<Vec<u8>> {
        self.read_at(0, self.inner.total)
    }

    pub fn segment_bytes(&self, index: usize) -> Result<Vec<u8>> {
        let seg = self.inner.segments.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!("segment {} out of range", index))
        })?;
        self.read_at(self.inner.starts[index], seg.len)
    }

    /// Scatter `data` into a local region starting at `offset`.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let parts = self.local_parts()?;
        let mut pos = 0usize;
        for (seg, within, n) in self.spans(offset, data.len() as u64)? {
            let part = &parts[seg];
            part.buf
                .write_at(part.offset + within, &data[pos..pos + n as usize])
                .map_err(Error::from)?;
            pos += n as usize;
        }
        Ok(())
    }
}

impl fmt::Debug for BulkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkDescriptor")
            .field("local", &self.is_local())
            .field("access", &self.inner.access)
            .field("size", &self.inner.total)
            .field("segments", &self.inner.segments)
            .finish()
    }
}

impl Proc for BulkDescriptor {
    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        self.encode_into(enc)
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Self::decode_from(dec)
    }
}
