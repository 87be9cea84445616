//! Write and read pcap trace files
//!
//! A trace file is a 24 byte global header followed by one record per packet. Each record is a 16 byte header
//! (seconds, microseconds, captured length, original length) followed by the captured bytes. Every field is written
//! little endian regardless of the host so the files look the same everywhere and can be opened by wireshark,
//! tcpdump and friends.
//!
//! [`TraceWriter`] writes a trace incrementally. Each record goes out in a single write so a failed write never
//! leaves a record header without its payload behind. [`read_trace_file`] decodes a trace back into memory.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::SystemTime;

use thiserror::Error;

/// Magic value for a pcap file with microsecond timestamps
pub const TRACE_MAGIC: u32 = 0xA1B2_C3D4;

/// Trace magic as it appears when the file was written with the opposite byte order
const SWAPPED_MAGIC: u32 = 0xD4C3_B2A1;

pub const VERSION_MAJOR: u16 = 2;
pub const VERSION_MINOR: u16 = 4;

/// Largest packet the capture expects to see
pub const SNAPLEN: u32 = 65535;

/// Link type written into the global header
pub const LINK_TYPE: u32 = 1;

/// Size of the global header in bytes
pub const GLOBAL_HEADER_LEN: usize = 24;

/// Size of a packet record header in bytes
pub const RECORD_HEADER_LEN: usize = 16;

/// Errors that can occur when reading a trace file
#[derive(Debug, Error)]
pub enum TraceError {
    /// Error reading from IO
    #[error("Encountered IO error")]
    Io(#[from] io::Error),
    /// Not enough data for the global header. Contains the number of bytes found.
    #[error("Trace file too small for a global header ({0} bytes)")]
    TooSmall(usize),
    /// File was written with the opposite byte order
    #[error("Trace file endianness does not match")]
    SwappedEndianness,
    /// Found a bad magic value in the trace file
    #[error("Trace file had bad magic: {0:0X}")]
    BadMagic(u32),
    /// Version other than 2.4
    #[error("Unsupported trace version {0}.{1}")]
    Version(u16, u16),
}

/// Capture time of a packet
///
/// The two fields are stored exactly as they appear in a record header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    /// Seconds since the unix epoch
    pub secs: u32,
    /// Microseconds within the second
    pub micros: u32,
}

impl Timestamp {
    #[must_use]
    pub const fn new(secs: u32, micros: u32) -> Self {
        Self { secs, micros }
    }
}

impl From<SystemTime> for Timestamp {
    /// Both fields come from the same sample. Times before the epoch collapse to zero.
    fn from(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
        Self {
            secs: since_epoch.as_secs() as u32,
            micros: since_epoch.subsec_micros(),
        }
    }
}

/// The global header at the start of every trace file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceHeader {
    pub version_major: u16,
    pub version_minor: u16,
    /// Offset from UTC in seconds. Always 0 when written by this crate.
    pub thiszone: i32,
    /// Timestamp accuracy. Always 0 when written by this crate.
    pub sigfigs: u32,
    pub snaplen: u32,
    pub link_type: u32,
}

impl Default for TraceHeader {
    fn default() -> Self {
        Self {
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            thiszone: 0,
            sigfigs: 0,
            snaplen: SNAPLEN,
            link_type: LINK_TYPE,
        }
    }
}

impl TraceHeader {
    /// Encode the header into its on-disk form
    #[must_use]
    pub fn to_bytes(&self) -> [u8; GLOBAL_HEADER_LEN] {
        let mut out = [0_u8; GLOBAL_HEADER_LEN];
        out[0..4].copy_from_slice(&TRACE_MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&self.version_major.to_le_bytes());
        out[6..8].copy_from_slice(&self.version_minor.to_le_bytes());
        out[8..12].copy_from_slice(&self.thiszone.to_le_bytes());
        out[12..16].copy_from_slice(&self.sigfigs.to_le_bytes());
        out[16..20].copy_from_slice(&self.snaplen.to_le_bytes());
        out[20..24].copy_from_slice(&self.link_type.to_le_bytes());
        out
    }

    /// Parse a global header from the start of `data`
    ///
    /// # Errors
    /// Returns an error if there are fewer than 24 bytes, the magic is wrong, or the version isn't 2.4.
    pub fn parse(data: &[u8]) -> Result<Self, TraceError> {
        if data.len() < GLOBAL_HEADER_LEN {
            return Err(TraceError::TooSmall(data.len()));
        }
        let magic = le_u32(&data[0..4]);
        if magic == SWAPPED_MAGIC {
            return Err(TraceError::SwappedEndianness);
        }
        if magic != TRACE_MAGIC {
            return Err(TraceError::BadMagic(magic));
        }
        let version_major = le_u16(&data[4..6]);
        let version_minor = le_u16(&data[6..8]);
        if version_major != VERSION_MAJOR || version_minor != VERSION_MINOR {
            return Err(TraceError::Version(version_major, version_minor));
        }
        Ok(Self {
            version_major,
            version_minor,
            thiszone: le_u32(&data[8..12]) as i32,
            sigfigs: le_u32(&data[12..16]),
            snaplen: le_u32(&data[16..20]),
            link_type: le_u32(&data[20..24]),
        })
    }
}

/// One packet read back from a trace file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    pub timestamp: Timestamp,
    /// Length of the packet on the wire. Never smaller than the captured data.
    pub original_len: u32,
    /// Captured bytes
    pub data: Vec<u8>,
}

impl PacketRecord {
    #[must_use]
    pub fn captured_len(&self) -> usize {
        self.data.len()
    }
}

/// Write packets to a trace file one at a time
///
/// The global header is written when the writer is created. Nothing is buffered between records: every call to
/// [`TraceWriter::write_packet`] hands one complete record to the underlying writer.
#[derive(Debug)]
pub struct TraceWriter<W: Write = File> {
    out: W,
    scratch: Vec<u8>,
    records: u64,
}

impl TraceWriter<File> {
    /// Create (or truncate) the file at `path` and write the global header
    ///
    /// Parent directories are not created.
    ///
    /// # Errors
    /// Returns an error if the file can't be created or the header can't be written.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path)?;
        Self::new(file)
    }
}

impl<W: Write> TraceWriter<W> {
    /// Start a trace on an arbitrary writer
    ///
    /// # Errors
    /// Returns any error from writing the global header.
    pub fn new(mut out: W) -> io::Result<Self> {
        out.write_all(&TraceHeader::default().to_bytes())?;
        out.flush()?;
        Ok(Self {
            out,
            scratch: Vec::with_capacity(RECORD_HEADER_LEN + SNAPLEN as usize),
            records: 0,
        })
    }

    /// Append one packet record
    ///
    /// The captured length is `data.len()`. `original_len` is the length the packet had before capture.
    ///
    /// # Errors
    /// Returns [`io::ErrorKind::InvalidInput`] without writing anything if `original_len` is smaller than the data
    /// or either length doesn't fit in 32 bits. Any write error is returned as is. A failed write may leave a
    /// partial record at the end of the file if the underlying writer accepted part of it.
    pub fn write_packet(&mut self, timestamp: Timestamp, original_len: usize, data: &[u8]) -> io::Result<()> {
        if original_len < data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "original length is smaller than the captured data",
            ));
        }
        let captured = u32::try_from(data.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "packet too large for a trace record"))?;
        let original = u32::try_from(original_len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "original length too large for a trace record"))?;

        self.scratch.clear();
        self.scratch.extend_from_slice(&timestamp.secs.to_le_bytes());
        self.scratch.extend_from_slice(&timestamp.micros.to_le_bytes());
        self.scratch.extend_from_slice(&captured.to_le_bytes());
        self.scratch.extend_from_slice(&original.to_le_bytes());
        self.scratch.extend_from_slice(data);
        self.out.write_all(&self.scratch)?;
        self.records += 1;
        Ok(())
    }

    /// Append a packet that was captured in full
    ///
    /// # Errors
    /// Same as [`TraceWriter::write_packet`].
    pub fn write_captured(&mut self, timestamp: Timestamp, data: &[u8]) -> io::Result<()> {
        self.write_packet(timestamp, data.len(), data)
    }

    /// Number of records written so far
    #[must_use]
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Flush and release the underlying writer
    ///
    /// # Errors
    /// Returns any error from the final flush. The writer is released either way.
    pub fn close(mut self) -> io::Result<()> {
        self.out.flush()
    }

    /// Erase the writer type so traces on different sinks can be handled alike
    pub fn boxed(self) -> TraceWriter<Box<dyn Write + Send>>
    where
        W: Send + 'static,
    {
        TraceWriter {
            out: Box::new(self.out),
            scratch: self.scratch,
            records: self.records,
        }
    }

    /// Flush and hand back the underlying writer
    ///
    /// # Errors
    /// Returns any error from the flush.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// A decoded trace file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    pub header: TraceHeader,
    /// Records in file order
    pub records: Vec<PacketRecord>,
    /// Bytes at the end of the file that don't form a complete record
    pub trailing: usize,
}

/// Parse a trace file
///
/// A record cut short at the end of the file (what's left behind when a capture is torn down mid write) is not an
/// error: it is counted in [`Trace::trailing`] and dropped.
///
/// # Errors
/// If the trace file is not in the expected format, then an error will be returned.
pub fn read_trace_file<R: Read>(trace_file: &mut R) -> Result<Trace, TraceError> {
    let mut trace_data = Vec::new();
    let data_size = trace_file.read_to_end(&mut trace_data)?;
    let header = TraceHeader::parse(&trace_data)?;

    let mut records = Vec::new();
    let mut index = GLOBAL_HEADER_LEN;
    while index + RECORD_HEADER_LEN <= data_size {
        let secs = le_u32(&trace_data[index..index + 4]);
        let micros = le_u32(&trace_data[index + 4..index + 8]);
        let captured = le_u32(&trace_data[index + 8..index + 12]) as usize;
        let original_len = le_u32(&trace_data[index + 12..index + 16]);
        let start = index + RECORD_HEADER_LEN;
        // A corrupt length field can point past the end of memory on 32 bit targets
        let end = match start.checked_add(captured) {
            Some(end) if end <= data_size => end,
            _ => break,
        };
        records.push(PacketRecord {
            timestamp: Timestamp::new(secs, micros),
            original_len,
            data: trace_data[start..end].to_vec(),
        });
        index = end;
    }

    Ok(Trace {
        header,
        records,
        trailing: data_size - index,
    })
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

#[cfg(test)]
mod trace_testing {
    use super::*;
    use std::io::Cursor;

    const HEADER_BYTES: [u8; 24] = [
        0xd4, 0xc3, 0xb2, 0xa1, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff,
        0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
    ];

    /// Accepts `limit` writes and then fails every one after that
    struct FailAfter {
        inner: Vec<u8>,
        limit: usize,
    }

    impl Write for FailAfter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.limit == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.limit -= 1;
            self.inner.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn header_bytes() {
        let writer = TraceWriter::new(Vec::new()).unwrap();
        let buffer = writer.into_inner().unwrap();
        assert_eq!(buffer, HEADER_BYTES);
    }

    #[test]
    fn open_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.pcap");
        std::fs::write(&path, vec![0xee; 100]).unwrap();
        let mut writer = TraceWriter::open(&path).unwrap();
        writer.write_captured(Timestamp::new(1, 2), &[0x45; 20]).unwrap();
        writer.close().unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[..GLOBAL_HEADER_LEN], &HEADER_BYTES);
        assert_eq!(data.len(), GLOBAL_HEADER_LEN + RECORD_HEADER_LEN + 20);
    }

    #[test]
    fn open_needs_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = TraceWriter::open(dir.path().join("nope").join("t.pcap")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn record_layout() {
        let payload: Vec<u8> = (0..40).collect();
        let mut writer = TraceWriter::new(Vec::new()).unwrap();
        writer.write_captured(Timestamp::new(0x0102_0304, 500), &payload).unwrap();
        assert_eq!(writer.records(), 1);
        let buffer = writer.into_inner().unwrap();
        let record = &buffer[GLOBAL_HEADER_LEN..];
        assert_eq!(&record[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&record[4..8], &500_u32.to_le_bytes());
        assert_eq!(&record[8..12], &[40, 0, 0, 0]);
        assert_eq!(&record[12..16], &[40, 0, 0, 0]);
        assert_eq!(&record[16..], payload.as_slice());
    }

    #[test]
    fn original_length_may_exceed_captured() {
        let mut writer = TraceWriter::new(Vec::new()).unwrap();
        writer.write_packet(Timestamp::default(), 1500, &[0xaa; 64]).unwrap();
        let buffer = writer.into_inner().unwrap();
        assert_eq!(&buffer[32..36], &64_u32.to_le_bytes());
        assert_eq!(&buffer[36..40], &1500_u32.to_le_bytes());
        assert_eq!(buffer.len(), GLOBAL_HEADER_LEN + RECORD_HEADER_LEN + 64);
    }

    #[test]
    fn short_original_length_rejected() {
        let mut writer = TraceWriter::new(Vec::new()).unwrap();
        let err = writer.write_packet(Timestamp::default(), 10, &[0; 20]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(writer.records(), 0);
        assert_eq!(writer.into_inner().unwrap().len(), GLOBAL_HEADER_LEN);
    }

    #[test]
    fn failed_write_keeps_earlier_records() {
        // header, then two records, then the disk fills up
        let sink = FailAfter {
            inner: Vec::new(),
            limit: 3,
        };
        let mut writer = TraceWriter::new(sink).unwrap();
        writer.write_captured(Timestamp::new(1, 0), &[1; 20]).unwrap();
        writer.write_captured(Timestamp::new(2, 0), &[2; 30]).unwrap();
        assert!(writer.write_captured(Timestamp::new(3, 0), &[3; 40]).is_err());
        assert_eq!(writer.records(), 2);

        let sink = writer.into_inner().unwrap();
        let trace = read_trace_file(&mut Cursor::new(sink.inner)).unwrap();
        assert_eq!(trace.records.len(), 2);
        assert_eq!(trace.trailing, 0);
        assert_eq!(trace.records[1].data, vec![2; 30]);
    }

    #[test]
    fn read_back() {
        let packets: [&[u8]; 3] = [&[0x45; 60], &[0x60; 1500], &[0x45; 40]];
        let mut writer = TraceWriter::new(Vec::new()).unwrap();
        for (i, p) in packets.iter().enumerate() {
            writer.write_captured(Timestamp::new(100 + i as u32, 7), p).unwrap();
        }
        let buffer = writer.into_inner().unwrap();
        let trace = read_trace_file(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(trace.header, TraceHeader::default());
        assert_eq!(trace.records.len(), 3);
        for (i, (record, packet)) in trace.records.iter().zip(packets).enumerate() {
            assert_eq!(record.timestamp, Timestamp::new(100 + i as u32, 7));
            assert_eq!(record.captured_len(), packet.len());
            assert_eq!(record.original_len as usize, packet.len());
            assert_eq!(record.data, packet);
        }
    }

    #[test]
    fn truncated_tail_is_reported() {
        let mut writer = TraceWriter::new(Vec::new()).unwrap();
        writer.write_captured(Timestamp::new(5, 5), &[9; 10]).unwrap();
        writer.write_captured(Timestamp::new(6, 6), &[8; 10]).unwrap();
        let mut buffer = writer.into_inner().unwrap();
        buffer.truncate(buffer.len() - 4);
        let trace = read_trace_file(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(trace.records.len(), 1);
        assert_eq!(trace.trailing, RECORD_HEADER_LEN + 6);
    }

    #[test]
    fn huge_length_field_is_trailing() {
        let mut writer = TraceWriter::new(Vec::new()).unwrap();
        writer.write_captured(Timestamp::new(1, 0), &[7; 12]).unwrap();
        let mut buffer = writer.into_inner().unwrap();
        let mut bogus = [0_u8; RECORD_HEADER_LEN];
        bogus[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        bogus[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
        buffer.extend_from_slice(&bogus);
        buffer.extend_from_slice(&[1, 2, 3]);
        let trace = read_trace_file(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(trace.records.len(), 1);
        assert_eq!(trace.trailing, RECORD_HEADER_LEN + 3);
    }

    #[test]
    fn boxed_writer_keeps_count() {
        let mut writer = TraceWriter::new(Vec::new()).unwrap();
        writer.write_captured(Timestamp::new(1, 0), &[7; 12]).unwrap();
        let mut boxed = writer.boxed();
        boxed.write_captured(Timestamp::new(2, 0), &[8; 12]).unwrap();
        assert_eq!(boxed.records(), 2);
        boxed.close().unwrap();
    }

    #[test]
    fn bad_headers() {
        assert!(matches!(
            read_trace_file(&mut Cursor::new(vec![0; 10])),
            Err(TraceError::TooSmall(10))
        ));

        let mut swapped = HEADER_BYTES;
        swapped[0..4].copy_from_slice(&TRACE_MAGIC.to_be_bytes());
        assert!(matches!(
            TraceHeader::parse(&swapped),
            Err(TraceError::SwappedEndianness)
        ));

        let mut ng = HEADER_BYTES;
        ng[0..4].copy_from_slice(&0x0A0D_0D0A_u32.to_le_bytes());
        assert!(matches!(TraceHeader::parse(&ng), Err(TraceError::BadMagic(0x0A0D_0D0A))));

        let mut old = HEADER_BYTES;
        old[6] = 3;
        assert!(matches!(TraceHeader::parse(&old), Err(TraceError::Version(2, 3))));
    }

    #[test]
    fn timestamp_from_system_time() {
        use std::time::Duration;
        let time = SystemTime::UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        assert_eq!(Timestamp::from(time), Timestamp::new(1_700_000_000, 123_456));
        let before = SystemTime::UNIX_EPOCH - Duration::from_secs(1);
        assert_eq!(Timestamp::from(before), Timestamp::default());
    }
}
