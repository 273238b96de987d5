//! # FASTA parsing & segmentation
//!
//! Only what orchestration needs: validate the alphabet, keep headers
//! verbatim, and cut sequences into the overlapping windows the predictor
//! consumes. No biology beyond that.

use thiserror::Error;

/// Accepted bases, checked case-insensitively.
const ALPHABET: &[u8] = b"ACGTN";

#[derive(Debug, Error, PartialEq)]
pub enum FastaError {
    #[error("invalid character '{found}' in sequence '{header}' at position {position}")]
    InvalidCharacter {
        header: String,
        position: usize,
        found: char,
    },

    #[error("sequence '{header}' is empty")]
    EmptySequence { header: String },

    #[error("sequence data before the first header line")]
    MissingHeader,

    #[error("input contains no sequences")]
    Empty,
}

/// One parsed record; `header` is verbatim minus the leading `>`, `bases`
/// are the concatenated sequence lines with all whitespace stripped and the
/// original case preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct FastaRecord {
    pub header: String,
    pub bases: String,
}

/// Parses FASTA text into ordered `(header, bases)` records.
pub fn parse_fasta(input: &str) -> Result<Vec<FastaRecord>, FastaError> {
    let mut records: Vec<FastaRecord> = Vec::new();
    let mut current: Option<FastaRecord> = None;

    for line in input.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(header) = trimmed.strip_prefix('>') {
            if let Some(done) = current.take() {
                if done.bases.is_empty() {
                    return Err(FastaError::EmptySequence { header: done.header });
                }
                records.push(done);
            }
            current = Some(FastaRecord {
                header: header.to_string(),
                bases: String::new(),
            });
        } else {
            let record = current.as_mut().ok_or(FastaError::MissingHeader)?;
            for ch in trimmed.chars() {
                if ch.is_whitespace() {
                    continue;
                }
                if !ALPHABET.contains(&(ch.to_ascii_uppercase() as u8)) {
                    return Err(FastaError::InvalidCharacter {
                        header: record.header.clone(),
                        position: record.bases.len() + 1,
                        found: ch,
                    });
                }
                record.bases.push(ch);
            }
        }
    }

    if let Some(done) = current.take() {
        if done.bases.is_empty() {
            return Err(FastaError::EmptySequence { header: done.header });
        }
        records.push(done);
    }

    if records.is_empty() {
        return Err(FastaError::Empty);
    }
    Ok(records)
}

/// Re-serializes records; `parse_fasta(serialize_fasta(r)) == r`.
pub fn serialize_fasta(records: &[FastaRecord]) -> String {
    let mut out = String::new();
    for record in records {
        out.push('>');
        out.push_str(&record.header);
        out.push('\n');
        for chunk in record.bases.as_bytes().chunks(80) {
            // chunks of a valid str on ASCII bases stay valid
            out.push_str(std::str::from_utf8(chunk).unwrap_or(""));
            out.push('\n');
        }
    }
    out
}

/// One prediction window. `start`/`end` are 1-based inclusive-exclusive
/// coordinates on the original sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// `{header}_segment_{i}_{start}_{end}`, or the bare header when
    /// splitting is disabled.
    pub id: String,
    pub header: String,
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub bases: String,
}

/// Cuts each record into overlapping windows of `segment_length` stepping by
/// `segment_length - overlap`. Tail windows shorter than
/// `max(1, segment_length - overlap)` are dropped. `segment_length == 0`
/// disables splitting and yields one window per record.
pub fn segment_records(records: &[FastaRecord], segment_length: u64, overlap: u64) -> Vec<Segment> {
    let mut segments = Vec::new();

    for record in records {
        let len = record.bases.len() as u64;

        if segment_length == 0 {
            segments.push(Segment {
                id: record.header.clone(),
                header: record.header.clone(),
                index: 0,
                start: 1,
                end: len + 1,
                bases: record.bases.clone(),
            });
            continue;
        }

        let step = segment_length.saturating_sub(overlap).max(1);
        let min_len = segment_length.saturating_sub(overlap).max(1);

        let mut index = 0usize;
        let mut offset = 0u64;
        while offset < len {
            let end = (offset + segment_length).min(len);
            let window_len = end - offset;
            if window_len >= min_len {
                let start_coord = offset + 1;
                let end_coord = end + 1;
                segments.push(Segment {
                    id: format!(
                        "{}_segment_{}_{}_{}",
                        record.header, index, start_coord, end_coord
                    ),
                    header: record.header.clone(),
                    index,
                    start: start_coord,
                    end: end_coord,
                    bases: record.bases[offset as usize..end as usize].to_string(),
                });
                index += 1;
            }
            if end == len {
                break;
            }
            offset += step;
        }
    }

    segments
}
