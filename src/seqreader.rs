/*
 * Copyright 2013-2023, Derrick Wood
 *
 * This file is part of the Kraken 2 taxonomic sequence classification system.
 */

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};

use flate2::read::MultiGzDecoder;

use crate::errors::{ClassifyError, Result};

#[derive(PartialEq, Eq, Copy, Clone, Debug, Default)]
pub enum SequenceFormat {
    #[default]
    AutoDetect,
    Fasta,
    Fastq,
}

#[derive(PartialEq, Clone, Debug, Default)]
pub struct Sequence {
    pub format: SequenceFormat,
    /// Full header line, sigil included.
    pub header: String,
    pub id: String,
    pub seq: String,
    pub quals: String,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for Sequence {
    /// Render the record in its native format.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            SequenceFormat::Fastq => {
                writeln!(f, "{}", self.header)?;
                writeln!(f, "{}", self.seq)?;
                writeln!(f, "+")?;
                writeln!(f, "{}", self.quals)
            }
            _ => {
                writeln!(f, "{}", self.header)?;
                writeln!(f, "{}", self.seq)
            }
        }
    }
}

/// Pulls blocks or record-counted batches out of a shared input stream and
/// parses sequences from the claimed bytes. Blocks always end on record
/// boundaries, so each worker's reader holds only whole records.
#[derive(Default)]
pub struct BatchSequenceReader {
    data: Vec<u8>,
    pos: usize,
    file_format: SequenceFormat,
}

impl BatchSequenceReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_format(&self) -> SequenceFormat {
        self.file_format
    }

    fn detect_format<R: BufRead>(&mut self, ifs: &mut R) -> Result<bool> {
        if self.file_format != SequenceFormat::AutoDetect {
            return Ok(true);
        }
        match peek_byte(ifs)? {
            None => Ok(false),
            Some(b'@') => {
                self.file_format = SequenceFormat::Fastq;
                Ok(true)
            }
            Some(b'>') => {
                self.file_format = SequenceFormat::Fasta;
                Ok(true)
            }
            Some(ch) => Err(ClassifyError::Data(format!(
                "sequence reader - unrecognized file format (first byte {:#04x})",
                ch
            ))),
        }
    }

    /// Claim roughly `block_size` bytes, extended to the next record
    /// boundary. Returns false at end of input.
    pub fn load_block<R: BufRead>(&mut self, ifs: &mut R, block_size: usize) -> Result<bool> {
        self.data.clear();
        self.pos = 0;
        if !self.detect_format(ifs)? {
            return Ok(false);
        }

        let mut line_count = 0usize;
        loop {
            let line_len = ifs.read_until(b'\n', &mut self.data)?;
            if line_len == 0 {
                break;
            }
            line_count += 1;
            if self.data.len() >= block_size {
                let at_boundary = match self.file_format {
                    SequenceFormat::Fastq => line_count % 4 == 0,
                    _ => peek_byte(ifs)?.map_or(true, |b| b == b'>'),
                };
                if at_boundary {
                    break;
                }
            }
        }
        Ok(!self.data.is_empty())
    }

    /// Claim up to `record_count` whole records. Returns false at end of
    /// input.
    pub fn load_batch<R: BufRead>(&mut self, ifs: &mut R, record_count: usize) -> Result<bool> {
        self.data.clear();
        self.pos = 0;
        if !self.detect_format(ifs)? {
            return Ok(false);
        }

        let mut remaining = record_count;
        while remaining > 0 {
            match self.file_format {
                SequenceFormat::Fastq => {
                    for _ in 0..4 {
                        if ifs.read_until(b'\n', &mut self.data)? == 0 {
                            remaining = 0;
                            break;
                        }
                    }
                }
                _ => {
                    if ifs.read_until(b'\n', &mut self.data)? == 0 {
                        break;
                    }
                    while peek_byte(ifs)?.map_or(false, |b| b != b'>') {
                        if ifs.read_until(b'\n', &mut self.data)? == 0 {
                            break;
                        }
                    }
                }
            }
            remaining = remaining.saturating_sub(1);
        }
        Ok(!self.data.is_empty())
    }

    /// Parse the next record out of the claimed bytes. Returns false once
    /// the block is exhausted.
    pub fn next_sequence(&mut self, seq: &mut Sequence) -> Result<bool> {
        let Some(header) = next_line(&self.data, &mut self.pos) else {
            return Ok(false);
        };
        let format = match (self.file_format, header.as_bytes().first()) {
            (SequenceFormat::Fastq, Some(b'@')) | (SequenceFormat::AutoDetect, Some(b'@')) => {
                SequenceFormat::Fastq
            }
            (SequenceFormat::Fasta, Some(b'>')) | (SequenceFormat::AutoDetect, Some(b'>')) => {
                SequenceFormat::Fasta
            }
            _ => {
                return Err(ClassifyError::Data(format!(
                    "malformed {:?} record (saw {:?}), aborting",
                    self.file_format, header
                )))
            }
        };

        seq.format = format;
        seq.header.clear();
        seq.header.push_str(header);
        seq.id.clear();
        let body = &header[1..];
        let id_end = body
            .find(char::is_whitespace)
            .unwrap_or(body.len());
        seq.id.push_str(&body[..id_end]);

        seq.seq.clear();
        seq.quals.clear();
        match format {
            SequenceFormat::Fasta => {
                while self.pos < self.data.len() && self.data[self.pos] != b'>' {
                    match next_line(&self.data, &mut self.pos) {
                        Some(line) => seq.seq.push_str(line),
                        None => break,
                    }
                }
            }
            SequenceFormat::Fastq => {
                let Some(bases) = next_line(&self.data, &mut self.pos) else {
                    return Err(truncated_record(&seq.id));
                };
                seq.seq.push_str(bases);
                let Some(plus) = next_line(&self.data, &mut self.pos) else {
                    return Err(truncated_record(&seq.id));
                };
                if !plus.starts_with('+') {
                    return Err(ClassifyError::Data(format!(
                        "{}: malformed FASTQ record (expected '+', saw {:?})",
                        seq.id, plus
                    )));
                }
                let Some(quals) = next_line(&self.data, &mut self.pos) else {
                    return Err(truncated_record(&seq.id));
                };
                seq.quals.push_str(quals);
            }
            SequenceFormat::AutoDetect => unreachable!(),
        }
        Ok(true)
    }
}

fn truncated_record(id: &str) -> ClassifyError {
    ClassifyError::Data(format!("{}: truncated FASTQ record", id))
}

fn peek_byte<R: BufRead>(ifs: &mut R) -> io::Result<Option<u8>> {
    Ok(ifs.fill_buf()?.first().copied())
}

fn next_line<'a>(data: &'a [u8], pos: &mut usize) -> Option<&'a str> {
    if *pos >= data.len() {
        return None;
    }
    let rest = &data[*pos..];
    let end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
    *pos += (end + 1).min(rest.len());
    let line = &rest[..end];
    let line = std::str::from_utf8(line).ok()?;
    Some(line.trim_end_matches('\r'))
}

/// Open a (possibly gzipped) sequence file, or stdin when no name is given.
pub fn open_sequence_file(filename: Option<&str>) -> Result<Box<dyn BufRead + Send>> {
    let stream: Box<dyn BufRead + Send> = match filename {
        None => Box::new(BufReader::new(io::stdin())),
        Some(name) => {
            let file = File::open(name).map_err(|e| ClassifyError::in_file(name, e))?;
            let mut reader = BufReader::new(file);
            let gzipped = reader
                .fill_buf()
                .map_err(|e| ClassifyError::in_file(name, e))?
                .starts_with(&[0x1f, 0x8b]);
            if gzipped {
                Box::new(BufReader::new(MultiGzDecoder::new(reader)))
            } else {
                Box::new(reader)
            }
        }
    };
    Ok(stream)
}
