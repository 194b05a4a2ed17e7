//! Length-prefixed, magic-tagged framing over non-blocking streams.
//!
//! ## Wire format
//!
//! ```text
//! Plain:     [magic: i32-be][length: i32-be][payload: length bytes]
//! Sequenced: [magic: i32-be][length: i32-be][sequence: i64-be][payload]
//! ```
//!
//! `length` counts payload bytes only.  A wrong magic number, a negative or
//! oversized length, or (in the sequenced format) any sequence number other
//! than the next expected one is fatal to the connection.
//!
//! Both halves are driven by readiness events: [`FrameReader::read_ready`]
//! and [`FrameWriter::write_ready`] consume or produce as many bytes as the
//! stream accepts and report `WouldBlock` when the caller should wait for
//! the next event.  Partial headers and payloads are kept between calls, so
//! a frame may be assembled across any number of events.

use {
    crate::error::{MembershipError, Result},
    std::{
        collections::VecDeque,
        io::{self, IoSlice, Read, Write},
    },
};

/// Magic number prefacing every frame.
pub const FRAME_MAGIC: i32 = 24_051_967;

/// Most bytes requested from the stream in one read call.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Largest header of any format.
pub const MAX_HEADER_SIZE: usize = 16;

/// Frames handed to one scatter write in the sequenced format.
const MAX_BATCH_FRAMES: usize = 32;

/// Header layout of a message link.  Both ends must agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// `magic | length`; one frame per write call.
    Plain,
    /// `magic | length | sequence`; queued frames go out in one scatter write.
    Sequenced,
}

impl FrameFormat {
    /// Bytes preceding every payload.
    pub const fn header_size(self) -> usize {
        match self {
            Self::Plain => 8,
            Self::Sequenced => MAX_HEADER_SIZE,
        }
    }
}

/// Decoded frame header, big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: i32,
    /// Payload bytes that follow the header.
    pub length: i32,
    /// Present only in the sequenced format.
    pub sequence: Option<i64>,
}

impl FrameHeader {
    /// Encode into `buf`, returning the number of header bytes used.
    pub fn encode(&self, buf: &mut [u8; MAX_HEADER_SIZE]) -> usize {
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..8].copy_from_slice(&self.length.to_be_bytes());
        match self.sequence {
            Some(sequence) => {
                buf[8..16].copy_from_slice(&sequence.to_be_bytes());
                FrameFormat::Sequenced.header_size()
            }
            None => FrameFormat::Plain.header_size(),
        }
    }

    pub fn decode(format: FrameFormat, buf: &[u8; MAX_HEADER_SIZE]) -> Self {
        let mut word = [0u8; 4];
        word.copy_from_slice(&buf[0..4]);
        let magic = i32::from_be_bytes(word);
        word.copy_from_slice(&buf[4..8]);
        let length = i32::from_be_bytes(word);
        let sequence = match format {
            FrameFormat::Plain => None,
            FrameFormat::Sequenced => {
                let mut long = [0u8; 8];
                long.copy_from_slice(&buf[8..16]);
                Some(i64::from_be_bytes(long))
            }
        };
        Self {
            magic,
            length,
            sequence,
        }
    }
}

/// A complete inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: Option<i64>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// No more bytes for now; wait for the next read event.
    WouldBlock,
    /// The peer closed the stream.
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Every queued frame has been written.
    Drained,
    /// Frames remain; wait for the next write event.
    WouldBlock,
}

struct PartialPayload {
    sequence: Option<i64>,
    buf: Vec<u8>,
    filled: usize,
}

impl PartialPayload {
    fn is_complete(&self) -> bool {
        self.filled == self.buf.len()
    }
}

/// Inbound half: header first, then exactly `length` payload bytes.
pub struct FrameReader {
    format: FrameFormat,
    magic: i32,
    max_frame_size: usize,
    header: [u8; MAX_HEADER_SIZE],
    header_filled: usize,
    payload: Option<PartialPayload>,
    next_sequence: i64,
    failed: bool,
}

impl FrameReader {
    /// Reader expecting [`FRAME_MAGIC`] and sequence numbers from 0.
    pub fn new(format: FrameFormat, max_frame_size: usize) -> Self {
        Self::with_magic(format, FRAME_MAGIC, max_frame_size)
    }

    /// Reader for a link tagged with `magic`.  Frames longer than
    /// `max_frame_size` are fatal.
    pub fn with_magic(format: FrameFormat, magic: i32, max_frame_size: usize) -> Self {
        Self {
            format,
            magic,
            max_frame_size,
            header: [0u8; MAX_HEADER_SIZE],
            header_filled: 0,
            payload: None,
            next_sequence: 0,
            failed: false,
        }
    }

    /// Sequence number the next frame must carry.
    pub fn next_sequence(&self) -> i64 {
        self.next_sequence
    }

    /// Whether a frame is partially assembled.
    pub fn in_frame(&self) -> bool {
        self.header_filled > 0 || self.payload.is_some()
    }

    /// Pull everything currently readable from `src`, handing each complete
    /// frame to `deliver` in stream order.  After an error the reader is
    /// dead and every later call fails.
    pub fn read_ready<R, F>(&mut self, src: &mut R, mut deliver: F) -> Result<ReadStatus>
    where
        R: Read + ?Sized,
        F: FnMut(Frame),
    {
        if self.failed {
            return Err(MembershipError::ConnectionClosed);
        }
        let result = self.read_frames(src, &mut deliver);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn read_frames<R, F>(&mut self, src: &mut R, deliver: &mut F) -> Result<ReadStatus>
    where
        R: Read + ?Sized,
        F: FnMut(Frame),
    {
        loop {
            if self.payload.is_none() {
                if let Some(status) = self.fill_header(src)? {
                    return Ok(status);
                }
                continue;
            }

            if let Some(partial) = self.payload.as_mut() {
                if !partial.is_complete() {
                    let start = partial.filled;
                    let end = partial
                        .buf
                        .len()
                        .min(start.saturating_add(READ_BUFFER_SIZE));
                    match read_some(src, &mut partial.buf[start..end])? {
                        Some(0) => return Ok(ReadStatus::Eof),
                        Some(n) => partial.filled = start.saturating_add(n),
                        None => return Ok(ReadStatus::WouldBlock),
                    }
                }
            }

            if self
                .payload
                .as_ref()
                .is_some_and(PartialPayload::is_complete)
            {
                if let Some(partial) = self.payload.take() {
                    self.header_filled = 0;
                    deliver(Frame {
                        sequence: partial.sequence,
                        payload: partial.buf,
                    });
                }
            }
        }
    }

    /// One read towards the header.  `Some` means stop: blocked or EOF.
    fn fill_header<R: Read + ?Sized>(&mut self, src: &mut R) -> Result<Option<ReadStatus>> {
        let header_size = self.format.header_size();
        match read_some(src, &mut self.header[self.header_filled..header_size])? {
            Some(0) => return Ok(Some(ReadStatus::Eof)),
            Some(n) => self.header_filled = self.header_filled.saturating_add(n),
            None => return Ok(Some(ReadStatus::WouldBlock)),
        }
        if self.header_filled == header_size {
            self.start_payload()?;
        }
        Ok(None)
    }

    fn start_payload(&mut self) -> Result<()> {
        let header = FrameHeader::decode(self.format, &self.header);
        if header.magic != self.magic {
            return Err(MembershipError::BadMagic {
                expected: self.magic,
                found: header.magic,
            });
        }
        let length = usize::try_from(header.length)
            .ok()
            .filter(|len| *len <= self.max_frame_size)
            .ok_or(MembershipError::InvalidFrameLength {
                length: i64::from(header.length),
                max: self.max_frame_size,
            })?;
        if let Some(sequence) = header.sequence {
            if sequence != self.next_sequence {
                return Err(MembershipError::OutOfOrder {
                    expected: self.next_sequence,
                    found: sequence,
                });
            }
            self.next_sequence = self.next_sequence.wrapping_add(1);
        }
        self.payload = Some(PartialPayload {
            sequence: header.sequence,
            buf: vec![0u8; length],
            filled: 0,
        });
        Ok(())
    }
}

struct OutboundFrame {
    header: [u8; MAX_HEADER_SIZE],
    header_len: usize,
    payload: Vec<u8>,
}

impl OutboundFrame {
    fn len(&self) -> usize {
        self.header_len.saturating_add(self.payload.len())
    }
}

/// Outbound half: a FIFO of encoded frames and the write position in the
/// front one.  Buffers are never rebuilt while a frame is partly written.
pub struct FrameWriter {
    format: FrameFormat,
    magic: i32,
    max_frame_size: usize,
    next_sequence: i64,
    queue: VecDeque<OutboundFrame>,
    offset: usize,
}

impl FrameWriter {
    /// Writer tagging frames with [`FRAME_MAGIC`].
    pub fn new(format: FrameFormat, max_frame_size: usize) -> Self {
        Self::with_magic(format, FRAME_MAGIC, max_frame_size)
    }

    /// Writer tagging frames with `magic`; larger payloads are refused at
    /// enqueue.
    pub fn with_magic(format: FrameFormat, magic: i32, max_frame_size: usize) -> Self {
        Self {
            format,
            magic,
            max_frame_size,
            next_sequence: 0,
            queue: VecDeque::new(),
            offset: 0,
        }
    }

    /// Frames not yet fully written.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_drained(&self) -> bool {
        self.queue.is_empty()
    }

    /// Frame `payload` and append it to the queue.  Nothing is written
    /// until [`FrameWriter::write_ready`].
    pub fn enqueue(&mut self, payload: Vec<u8>) -> Result<()> {
        let length = i32::try_from(payload.len())
            .ok()
            .filter(|_| payload.len() <= self.max_frame_size)
            .ok_or(MembershipError::InvalidFrameLength {
                length: i64::try_from(payload.len()).unwrap_or(i64::MAX),
                max: self.max_frame_size,
            })?;
        let sequence = match self.format {
            FrameFormat::Plain => None,
            FrameFormat::Sequenced => {
                let sequence = self.next_sequence;
                self.next_sequence = self.next_sequence.wrapping_add(1);
                Some(sequence)
            }
        };
        let mut header = [0u8; MAX_HEADER_SIZE];
        let header_len = FrameHeader {
            magic: self.magic,
            length,
            sequence,
        }
        .encode(&mut header);
        self.queue.push_back(OutboundFrame {
            header,
            header_len,
            payload,
        });
        Ok(())
    }

    /// Write as much of the queue as `dst` accepts.
    pub fn write_ready<W: Write + ?Sized>(&mut self, dst: &mut W) -> Result<WriteStatus> {
        while !self.queue.is_empty() {
            let result = {
                let slices = self.pending_slices();
                dst.write_vectored(&slices)
            };
            match result {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => self.advance(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteStatus::WouldBlock)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(WriteStatus::Drained)
    }

    fn pending_slices(&self) -> Vec<IoSlice<'_>> {
        let batch = match self.format {
            FrameFormat::Plain => 1,
            FrameFormat::Sequenced => MAX_BATCH_FRAMES,
        };
        let mut slices = Vec::with_capacity(batch.saturating_mul(2));
        for (i, frame) in self.queue.iter().take(batch).enumerate() {
            let skip = if i == 0 { self.offset } else { 0 };
            let header = &frame.header[..frame.header_len];
            if skip < header.len() {
                slices.push(IoSlice::new(&header[skip..]));
                if !frame.payload.is_empty() {
                    slices.push(IoSlice::new(&frame.payload));
                }
            } else {
                let start = skip.saturating_sub(header.len());
                if start < frame.payload.len() {
                    slices.push(IoSlice::new(&frame.payload[start..]));
                }
            }
        }
        slices
    }

    fn advance(&mut self, mut written: usize) {
        while written > 0 {
            let Some(front) = self.queue.front() else {
                break;
            };
            let remaining = front.len().saturating_sub(self.offset);
            if written >= remaining {
                written = written.saturating_sub(remaining);
                self.queue.pop_front();
                self.offset = 0;
            } else {
                self.offset = self.offset.saturating_add(written);
                written = 0;
            }
        }
    }
}

/// `Some(n)` bytes read (0 is EOF), `None` when the read would block.
fn read_some<R: Read + ?Sized>(src: &mut R, buf: &mut [u8]) -> Result<Option<usize>> {
    loop {
        match src.read(buf) {
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}
