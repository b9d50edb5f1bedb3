//! TRS trace container.
//!
//! Layout: a sequence of (tag, payload) header entries terminated by the
//! 0x5F marker, followed by `num_traces` records of `[aux][samples]`, all
//! little endian. Only 32-bit float sample coding is supported.

use crate::error::{AnalysisError, Result};
use crate::progress::{NoProgress, ProgressSink};
use crate::trace::TraceSet;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Number of traces (u32)
const TAG_NUM_TRACES: u8 = 0x41;
/// Samples per trace (u32)
const TAG_NUM_SAMPLES: u8 = 0x42;
/// Sample coding (u8)
const TAG_SAMPLE_CODING: u8 = 0x43;
/// Auxiliary data length per trace (u16)
const TAG_AUX_LENGTH: u8 = 0x44;
/// Trace set description (variable length string)
const TAG_DESCRIPTION: u8 = 0x47;
/// End of header
const TAG_TRACE_BLOCK: u8 = 0x5F;

/// Sample coding byte for IEEE-754 single precision samples.
pub const CODING_F32: u8 = 0x14;

/// Long-form description length marker: four length bytes follow.
const LONG_LENGTH_4: u8 = 0x84;

/// Metadata parsed from a TRS header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrsHeader {
    pub num_traces: usize,
    pub samples_per_trace: usize,
    pub sample_coding: u8,
    pub aux_length: usize,
    pub description: String,
}

impl Default for TrsHeader {
    fn default() -> Self {
        Self {
            num_traces: 0,
            samples_per_trace: 0,
            sample_coding: CODING_F32,
            aux_length: 0,
            description: String::new(),
        }
    }
}

impl TrsHeader {
    /// Size in bytes of one trace record in the data block.
    pub fn record_size(&self) -> usize {
        self.aux_length
            .saturating_add(self.samples_per_trace.saturating_mul(std::mem::size_of::<f32>()))
    }

    fn parse<R: Read>(reader: &mut R) -> Result<Self> {
        let mut header = TrsHeader::default();
        let truncated = |e| AnalysisError::from_decode(e, "header");

        loop {
            let tag = reader.read_u8().map_err(truncated)?;

            match tag {
                TAG_NUM_TRACES => {
                    header.num_traces = reader.read_u32::<LittleEndian>().map_err(truncated)? as usize;
                    log::debug!("TRS tag 0x41: {} traces", header.num_traces);
                }
                TAG_NUM_SAMPLES => {
                    header.samples_per_trace =
                        reader.read_u32::<LittleEndian>().map_err(truncated)? as usize;
                    log::debug!("TRS tag 0x42: {} samples per trace", header.samples_per_trace);
                }
                TAG_SAMPLE_CODING => {
                    let coding = reader.read_u8().map_err(truncated)?;
                    if coding != CODING_F32 {
                        return Err(AnalysisError::Format(format!(
                            "unsupported sample coding 0x{:02X}",
                            coding
                        )));
                    }
                    header.sample_coding = coding;
                }
                TAG_AUX_LENGTH => {
                    header.aux_length = reader.read_u16::<LittleEndian>().map_err(truncated)? as usize;
                    log::debug!("TRS tag 0x44: {} aux bytes per trace", header.aux_length);
                }
                TAG_DESCRIPTION => {
                    let len = read_length(reader)?;
                    let mut raw = Vec::new();
                    reader.by_ref().take(len as u64).read_to_end(&mut raw)?;
                    if raw.len() != len {
                        return Err(AnalysisError::Format("truncated header".to_string()));
                    }
                    header.description = String::from_utf8_lossy(&raw).into_owned();
                }
                TAG_TRACE_BLOCK => break,
                other => {
                    return Err(AnalysisError::Format(format!("unknown marker 0x{:02X}", other)));
                }
            }
        }

        Ok(header)
    }
}

/// Decode a tag payload length. A byte with the high bit clear is the
/// length itself; otherwise its low 7 bits count the little endian length
/// bytes that follow.
fn read_length<R: Read>(reader: &mut R) -> Result<usize> {
    let first = reader
        .read_u8()
        .map_err(|e| AnalysisError::from_decode(e, "header"))?;

    if first & 0x80 == 0 {
        return Ok(first as usize);
    }

    let count = (first & 0x7F) as usize;
    if count == 0 || count > 4 {
        return Err(AnalysisError::Format(format!(
            "invalid length encoding 0x{:02X}",
            first
        )));
    }

    let mut len = 0usize;
    for i in 0..count {
        let byte = reader
            .read_u8()
            .map_err(|e| AnalysisError::from_decode(e, "header"))?;
        len |= (byte as usize) << (8 * i);
    }
    Ok(len)
}

/// Reader over a TRS container. The header is parsed on construction; the
/// data block is only touched by [`TrsReader::read_trace_set`].
pub struct TrsReader<R: Read> {
    inner: R,
    header: TrsHeader,
}

impl TrsReader<BufReader<File>> {
    /// Open a TRS file and parse its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| AnalysisError::file_io(path, e))?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> TrsReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let header = TrsHeader::parse(&mut inner)?;
        Ok(Self { inner, header })
    }

    pub fn header(&self) -> &TrsHeader {
        &self.header
    }

    pub fn into_header(self) -> TrsHeader {
        self.header
    }

    /// Read every record of the data block into a new trace set, reporting
    /// one progress unit per record.
    pub fn read_trace_set(mut self, progress: &dyn ProgressSink) -> Result<TraceSet> {
        let header = &self.header;
        log::info!(
            "Loading {} traces of {} samples",
            header.num_traces,
            header.samples_per_trace
        );

        let mut set = TraceSet::with_description(header.description.clone());
        let record_size = header.record_size();
        let mut record = Vec::new();

        for index in 0..header.num_traces {
            // The header is untrusted: grow the buffer only as bytes arrive.
            record.clear();
            self.inner
                .by_ref()
                .take(record_size as u64)
                .read_to_end(&mut record)?;
            if record.len() != record_size {
                return Err(AnalysisError::Format("truncated data block".to_string()));
            }

            let (aux, samples) = record.split_at(header.aux_length);
            let aux = if aux.is_empty() { None } else { Some(aux.to_vec()) };
            let mut trace = vec![0.0f32; header.samples_per_trace];
            LittleEndian::read_f32_into(samples, &mut trace);

            set.add_trace(trace, aux, false)?;
            progress.update("loading traces", index + 1, header.num_traces);
        }

        Ok(set)
    }
}

/// Header-only inspection of a TRS file.
pub fn read_trs_header_file<P: AsRef<Path>>(path: P) -> Result<TrsHeader> {
    Ok(TrsReader::open(path)?.into_header())
}

/// Load a complete TRS file.
pub fn read_trs_file<P: AsRef<Path>>(path: P) -> Result<TraceSet> {
    TrsReader::open(path)?.read_trace_set(&NoProgress)
}

/// Serialize a trace set as a TRS container.
///
/// Every trace must have the length of trace #0, and every aux entry the
/// length of aux entry #0, since the header declares a single size for all
/// records.
pub fn write_trs<W: Write>(set: &TraceSet, mut writer: W) -> Result<()> {
    let samples_per_trace = set.trace_length().unwrap_or(0);
    let aux_length = set.aux_length();

    for (index, (trace, aux)) in set.iter().enumerate() {
        if trace.len() != samples_per_trace {
            return Err(AnalysisError::Format(format!(
                "trace {} has {} samples, expected {}",
                index,
                trace.len(),
                samples_per_trace
            )));
        }
        let aux_len = aux.map_or(0, |a| a.len());
        if aux_len != aux_length {
            return Err(AnalysisError::Format(format!(
                "trace {} has {} aux bytes, expected {}",
                index, aux_len, aux_length
            )));
        }
    }

    let num_traces = header_field::<u32>(set.num_traces(), "trace count")?;
    let num_samples = header_field::<u32>(samples_per_trace, "samples per trace")?;
    let aux_field = header_field::<u16>(aux_length, "aux length")?;
    let description = set.description().as_bytes();
    let description_len = header_field::<u32>(description.len(), "description length")?;

    writer.write_u8(TAG_NUM_TRACES)?;
    writer.write_u32::<LittleEndian>(num_traces)?;
    writer.write_u8(TAG_NUM_SAMPLES)?;
    writer.write_u32::<LittleEndian>(num_samples)?;
    writer.write_u8(TAG_SAMPLE_CODING)?;
    writer.write_u8(CODING_F32)?;
    writer.write_u8(TAG_AUX_LENGTH)?;
    writer.write_u16::<LittleEndian>(aux_field)?;
    writer.write_u8(TAG_DESCRIPTION)?;
    writer.write_u8(LONG_LENGTH_4)?;
    writer.write_u32::<LittleEndian>(description_len)?;
    writer.write_all(description)?;
    writer.write_u8(TAG_TRACE_BLOCK)?;

    for (trace, aux) in set.iter() {
        if let Some(aux) = aux {
            writer.write_all(aux)?;
        }
        for &sample in trace {
            writer.write_f32::<LittleEndian>(sample)?;
        }
    }

    writer.flush()?;
    Ok(())
}

/// Write a trace set to a TRS file, replacing any existing file.
pub fn write_trs_file<P: AsRef<Path>>(set: &TraceSet, path: P) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| AnalysisError::file_io(path, e))?;
    write_trs(set, BufWriter::new(file)).map_err(|e| match e {
        AnalysisError::Io(source) => AnalysisError::file_io(path, source),
        other => other,
    })?;
    log::info!("Wrote {} traces to {}", set.num_traces(), path.display());
    Ok(())
}

fn header_field<T: TryFrom<usize>>(value: usize, what: &str) -> Result<T> {
    T::try_from(value).map_err(|_| {
        AnalysisError::Format(format!("{} {} does not fit the TRS header", what, value))
    })
}
