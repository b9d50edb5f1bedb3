//! Streaming trace format.
//!
//! A stream starts with a 10-byte sample type tag (a NumPy dtype string
//! such as `<f4`, NUL padded) and is followed by one record per trace:
//!
//! `[u32 sample count][u32 aux count, WithAux only][samples][aux bytes]`
//!
//! Records may differ in length. The writer never seeks, so a stream can be
//! produced while the capture is running and read back up to the last
//! complete record.

use crate::error::{AnalysisError, Result};
use crate::trace::{AuxData, Trace, TraceSet};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Length of the sample type tag at the start of a stream.
pub const TYPE_TAG_LEN: usize = 10;

/// Element type of the samples stored in a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleType {
    I8,
    U8,
    I16,
    U16,
    I32,
    F32,
    F64,
}

impl SampleType {
    pub const ALL: [SampleType; 7] = [
        SampleType::I8,
        SampleType::U8,
        SampleType::I16,
        SampleType::U16,
        SampleType::I32,
        SampleType::F32,
        SampleType::F64,
    ];

    /// NumPy dtype string written in the stream tag.
    pub fn dtype(&self) -> &'static str {
        match self {
            SampleType::I8 => "|i1",
            SampleType::U8 => "|u1",
            SampleType::I16 => "<i2",
            SampleType::U16 => "<u2",
            SampleType::I32 => "<i4",
            SampleType::F32 => "<f4",
            SampleType::F64 => "<f8",
        }
    }

    pub fn from_dtype(dtype: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.dtype() == dtype)
    }

    /// Size of one sample in bytes.
    pub fn size(&self) -> usize {
        match self {
            SampleType::I8 | SampleType::U8 => 1,
            SampleType::I16 | SampleType::U16 => 2,
            SampleType::I32 | SampleType::F32 => 4,
            SampleType::F64 => 8,
        }
    }

    fn tag(&self) -> [u8; TYPE_TAG_LEN] {
        let mut tag = [0u8; TYPE_TAG_LEN];
        let dtype = self.dtype().as_bytes();
        tag[..dtype.len()].copy_from_slice(dtype);
        tag
    }

    fn read_sample<R: Read>(&self, reader: &mut R) -> io::Result<f32> {
        Ok(match self {
            SampleType::I8 => reader.read_i8()? as f32,
            SampleType::U8 => reader.read_u8()? as f32,
            SampleType::I16 => reader.read_i16::<LittleEndian>()? as f32,
            SampleType::U16 => reader.read_u16::<LittleEndian>()? as f32,
            SampleType::I32 => reader.read_i32::<LittleEndian>()? as f32,
            SampleType::F32 => reader.read_f32::<LittleEndian>()?,
            SampleType::F64 => reader.read_f64::<LittleEndian>()? as f32,
        })
    }
}

/// Sample element that can be written to a stream.
pub trait Sample: Copy {
    const TYPE: SampleType;

    fn write_le<W: Write>(self, writer: &mut W) -> io::Result<()>;
}

macro_rules! impl_sample {
    ($ty:ty, $variant:ident, |$value:ident, $writer:ident| $write:expr) => {
        impl Sample for $ty {
            const TYPE: SampleType = SampleType::$variant;

            fn write_le<W: Write>(self, $writer: &mut W) -> io::Result<()> {
                let $value = self;
                $write
            }
        }
    };
}

impl_sample!(i8, I8, |v, w| w.write_i8(v));
impl_sample!(u8, U8, |v, w| w.write_u8(v));
impl_sample!(i16, I16, |v, w| w.write_i16::<LittleEndian>(v));
impl_sample!(u16, U16, |v, w| w.write_u16::<LittleEndian>(v));
impl_sample!(i32, I32, |v, w| w.write_i32::<LittleEndian>(v));
impl_sample!(f32, F32, |v, w| w.write_f32::<LittleEndian>(v));
impl_sample!(f64, F64, |v, w| w.write_f64::<LittleEndian>(v));

/// Record layout of a stream. Writer and reader must agree on it; the
/// layout is not encoded in the stream itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RecordLayout {
    /// `[count][samples]`
    #[default]
    SamplesOnly,
    /// `[count][aux count][samples][aux]`
    WithAux,
}

/// Append-only stream writer.
///
/// In write-through mode every record goes to the underlying writer as soon
/// as it is received. In buffered mode records are kept in memory until
/// [`StreamWriter::flush_pending`] or [`StreamWriter::finish`], and are then
/// written in arrival order.
pub struct StreamWriter<W: Write, S: Sample> {
    inner: W,
    layout: RecordLayout,
    write_through: bool,
    header_written: bool,
    pending: Vec<(Vec<S>, AuxData)>,
    traces_written: usize,
    longest_trace: usize,
}

impl<S: Sample> StreamWriter<BufWriter<File>, S> {
    /// Create (or truncate) a stream file in write-through mode.
    pub fn create<P: AsRef<Path>>(path: P, layout: RecordLayout) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| AnalysisError::file_io(path, e))?;
        Ok(Self::new(BufWriter::new(file), layout))
    }
}

impl<W: Write, S: Sample> StreamWriter<W, S> {
    /// Write-through stream writer.
    pub fn new(inner: W, layout: RecordLayout) -> Self {
        Self {
            inner,
            layout,
            write_through: true,
            header_written: false,
            pending: Vec::new(),
            traces_written: 0,
            longest_trace: 0,
        }
    }

    /// Stream writer that holds records until they are flushed.
    pub fn buffered(inner: W, layout: RecordLayout) -> Self {
        Self {
            write_through: false,
            ..Self::new(inner, layout)
        }
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Records written to the underlying writer so far.
    pub fn traces_written(&self) -> usize {
        self.traces_written
    }

    /// Sample count of the longest trace received so far.
    pub fn longest_trace(&self) -> usize {
        self.longest_trace
    }

    /// Records received but not yet written.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Append one trace. Aux data is only accepted by the `WithAux` layout.
    pub fn write_trace(&mut self, samples: &[S], aux: Option<&[u8]>) -> Result<()> {
        let aux = match (self.layout, aux) {
            (RecordLayout::SamplesOnly, Some(aux)) if !aux.is_empty() => {
                return Err(AnalysisError::InvalidParameter(
                    "aux data cannot be stored in a samples-only stream".to_string(),
                ));
            }
            (RecordLayout::SamplesOnly, _) | (RecordLayout::WithAux, None) => &[][..],
            (RecordLayout::WithAux, Some(aux)) => aux,
        };

        check_count(samples.len(), "sample count")?;
        check_count(aux.len(), "aux count")?;

        self.longest_trace = self.longest_trace.max(samples.len());

        if self.write_through {
            self.write_record(samples, aux)
        } else {
            self.pending.push((samples.to_vec(), aux.to_vec()));
            Ok(())
        }
    }

    /// Write all pending records in arrival order. Returns how many were
    /// written.
    pub fn flush_pending(&mut self) -> Result<usize> {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();

        for (samples, aux) in &pending {
            self.write_record(samples, aux)?;
        }

        self.inner.flush()?;
        if count > 0 {
            log::debug!("Flushed {} pending stream records", count);
        }
        Ok(count)
    }

    /// Flush everything and return the underlying writer. A stream with no
    /// records still receives its type tag.
    pub fn finish(mut self) -> Result<W> {
        self.flush_pending()?;
        self.write_header()?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn write_header(&mut self) -> Result<()> {
        if !self.header_written {
            self.inner.write_all(&S::TYPE.tag())?;
            self.header_written = true;
        }
        Ok(())
    }

    fn write_record(&mut self, samples: &[S], aux: &[u8]) -> Result<()> {
        self.write_header()?;

        self.inner.write_u32::<LittleEndian>(samples.len() as u32)?;
        if self.layout == RecordLayout::WithAux {
            self.inner.write_u32::<LittleEndian>(aux.len() as u32)?;
        }
        for &sample in samples {
            sample.write_le(&mut self.inner)?;
        }
        if self.layout == RecordLayout::WithAux {
            self.inner.write_all(aux)?;
        }

        self.traces_written += 1;
        Ok(())
    }
}

fn check_count(count: usize, what: &str) -> Result<()> {
    if u32::try_from(count).is_err() {
        return Err(AnalysisError::InvalidParameter(format!(
            "{} {} does not fit a stream record",
            what, count
        )));
    }
    Ok(())
}

/// Sequential reader over a trace stream.
pub struct StreamReader<R: Read> {
    inner: R,
    sample_type: SampleType,
    layout: RecordLayout,
    traces_read: usize,
    longest_trace: usize,
}

impl StreamReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P, layout: RecordLayout) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| AnalysisError::file_io(path, e))?;
        Self::new(BufReader::new(file), layout)
    }
}

impl<R: Read> StreamReader<R> {
    /// Read the type tag and prepare to read records.
    pub fn new(mut inner: R, layout: RecordLayout) -> Result<Self> {
        let mut tag = [0u8; TYPE_TAG_LEN];
        inner
            .read_exact(&mut tag)
            .map_err(|e| AnalysisError::from_decode(e, "stream type tag"))?;

        let end = tag.iter().position(|&b| b == 0).unwrap_or(TYPE_TAG_LEN);
        let dtype = String::from_utf8_lossy(&tag[..end]);
        let sample_type = SampleType::from_dtype(&dtype).ok_or_else(|| {
            AnalysisError::Format(format!("unsupported stream sample type {:?}", dtype))
        })?;
        log::debug!("Stream sample type {}", sample_type.dtype());

        Ok(Self {
            inner,
            sample_type,
            layout,
            traces_read: 0,
            longest_trace: 0,
        })
    }

    /// Like [`StreamReader::new`], but fails unless the stream holds
    /// samples of type `expected`.
    pub fn with_expected(inner: R, layout: RecordLayout, expected: SampleType) -> Result<Self> {
        let reader = Self::new(inner, layout)?;
        if reader.sample_type != expected {
            return Err(AnalysisError::Format(format!(
                "stream holds {} samples, expected {}",
                reader.sample_type.dtype(),
                expected.dtype()
            )));
        }
        Ok(reader)
    }

    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    pub fn traces_read(&self) -> usize {
        self.traces_read
    }

    pub fn longest_trace(&self) -> usize {
        self.longest_trace
    }

    /// Read the next record, or `None` at a clean end of stream. Running out
    /// of bytes inside a record is a format error.
    pub fn next_record(&mut self) -> Result<Option<(Trace, Option<AuxData>)>> {
        let count = match self.read_record_start()? {
            Some(count) => count as usize,
            None => return Ok(None),
        };

        let truncated = |e| AnalysisError::from_decode(e, "stream record");

        let aux_count = match self.layout {
            RecordLayout::WithAux => self.inner.read_u32::<LittleEndian>().map_err(truncated)? as usize,
            RecordLayout::SamplesOnly => 0,
        };

        let raw = read_exact_vec(&mut self.inner, count.saturating_mul(self.sample_type.size()))?;
        let mut cursor = raw.as_slice();
        let mut trace = Vec::with_capacity(count);
        for _ in 0..count {
            trace.push(self.sample_type.read_sample(&mut cursor).map_err(truncated)?);
        }

        let aux = match self.layout {
            RecordLayout::WithAux => Some(read_exact_vec(&mut self.inner, aux_count)?),
            RecordLayout::SamplesOnly => None,
        };

        self.traces_read += 1;
        self.longest_trace = self.longest_trace.max(count);
        Ok(Some((trace, aux)))
    }

    /// Read up to `limit` records (all remaining if `None`) into a new set.
    pub fn read_traces(&mut self, limit: Option<usize>) -> Result<TraceSet> {
        let mut set = TraceSet::new();
        set.load_from_reader(self, limit)?;
        Ok(set)
    }

    /// Read every remaining record into a new set.
    pub fn into_trace_set(mut self) -> Result<TraceSet> {
        self.read_traces(None)
    }

    /// Read the leading record count, telling a clean end of stream apart
    /// from a record cut short.
    fn read_record_start(&mut self) -> Result<Option<u32>> {
        let mut buf = [0u8; 4];
        let mut filled = 0;

        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        match filled {
            0 => Ok(None),
            4 => Ok(Some(u32::from_le_bytes(buf))),
            _ => Err(AnalysisError::Format("truncated stream record".to_string())),
        }
    }
}

/// Read exactly `len` bytes without trusting `len` for the allocation.
fn read_exact_vec<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(AnalysisError::Format("truncated stream record".to_string()));
    }
    Ok(buf)
}
