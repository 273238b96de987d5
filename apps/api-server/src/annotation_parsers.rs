//! # Result-file annotation parsers
//!
//! Typed parsers for the three annotation formats the remote service
//! returns. Each parser stands alone and returns a typed result; the
//! orchestrator decides which failures are fatal and which degrade to a
//! warning.

use pipeline_core::error::PipelineError;
use pipeline_core::models::{BaktaAnnotation, Strand};
use uuid::Uuid;

/// Canonical JSON result: `{"features": [...]}` with per-feature
/// coordinates. Features without usable coordinates are skipped with a
/// warning; a malformed document is an error.
pub fn parse_json_annotations(job_id: Uuid, text: &str) -> Result<Vec<BaktaAnnotation>, PipelineError> {
    let root: serde_json::Value = serde_json::from_str(text).map_err(|e| {
        PipelineError::InvalidInput { reason: format!("result JSON is not valid JSON: {}", e) }
    })?;
    let features = root
        .get("features")
        .and_then(|f| f.as_array())
        .ok_or_else(|| PipelineError::InvalidInput {
            reason: "result JSON has no 'features' array".to_string(),
        })?;

    let mut annotations = Vec::with_capacity(features.len());
    for feature in features {
        let start = feature.get("start").and_then(|v| v.as_i64());
        let stop = feature.get("stop").or_else(|| feature.get("end")).and_then(|v| v.as_i64());
        let contig = feature
            .get("contig")
            .or_else(|| feature.get("sequence"))
            .and_then(|v| v.as_str());
        let (Some(start), Some(stop), Some(contig)) = (start, stop, contig) else {
            tracing::warn!("[BaktaResults] skipping JSON feature without coordinates");
            continue;
        };
        if start < 1 || stop < start {
            tracing::warn!("[BaktaResults] skipping JSON feature with inverted coordinates");
            continue;
        }

        let feature_type = feature.get("type").and_then(|v| v.as_str()).unwrap_or("unknown");
        let feature_id = feature
            .get("id")
            .or_else(|| feature.get("locus"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| format!("{}_{}_{}", feature_type, start, stop));
        let strand = feature.get("strand").and_then(|v| v.as_str()).unwrap_or(".");

        annotations.push(BaktaAnnotation {
            id: 0,
            job_id,
            feature_id,
            feature_type: feature_type.to_string(),
            contig: contig.to_string(),
            start,
            end: stop,
            strand: Strand::parse(strand),
            attributes_json: feature.to_string(),
        });
    }
    Ok(annotations)
}

/// GFF3: nine tab-separated columns, `#` lines ignored, attributes as
/// `key=value` pairs. A line with the wrong column count fails the parse.
pub fn parse_gff3_annotations(job_id: Uuid, text: &str) -> Result<Vec<BaktaAnnotation>, PipelineError> {
    let mut annotations = Vec::new();

    for (lineno, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        // The optional FASTA tail of a GFF3 file ends the feature section.
        if trimmed.starts_with('>') {
            break;
        }
        let fields: Vec<&str> = trimmed.split('\t').collect();
        if fields.len() != 9 {
            return Err(PipelineError::InvalidInput {
                reason: format!("GFF3 line {} has {} columns, expected 9", lineno + 1, fields.len()),
            });
        }

        let start: i64 = fields[3].parse().map_err(|_| PipelineError::InvalidInput {
            reason: format!("GFF3 line {}: bad start '{}'", lineno + 1, fields[3]),
        })?;
        let end: i64 = fields[4].parse().map_err(|_| PipelineError::InvalidInput {
            reason: format!("GFF3 line {}: bad end '{}'", lineno + 1, fields[4]),
        })?;
        if start < 1 || end < start {
            return Err(PipelineError::InvalidInput {
                reason: format!("GFF3 line {}: inverted range {}..{}", lineno + 1, start, end),
            });
        }

        let mut attributes = serde_json::Map::new();
        for pair in fields[8].split(';').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some((key, value)) => {
                    attributes.insert(key.trim().to_string(), serde_json::json!(value.trim()));
                }
                None => {
                    attributes.insert(pair.trim().to_string(), serde_json::Value::Null);
                }
            }
        }
        let feature_id = attributes
            .get("ID")
            .or_else(|| attributes.get("locus_tag"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| format!("{}_{}_{}", fields[2], start, end));

        annotations.push(BaktaAnnotation {
            id: 0,
            job_id,
            feature_id,
            feature_type: fields[2].to_string(),
            contig: fields[0].to_string(),
            start,
            end,
            strand: Strand::parse(fields[6]),
            attributes_json: serde_json::Value::Object(attributes).to_string(),
        });
    }
    Ok(annotations)
}

/// Bakta TSV export: `Sequence Id / Type / Start / Stop / Strand /
/// Locus Tag / Gene / Product / DbXrefs`, `#` header lines ignored.
pub fn parse_tsv_annotations(job_id: Uuid, text: &str) -> Result<Vec<BaktaAnnotation>, PipelineError> {
    let mut annotations = Vec::new();

    for (lineno, line) in text.lines().enumerate() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = trimmed.split('\t').collect();
        if fields.len() < 5 {
            return Err(PipelineError::InvalidInput {
                reason: format!("TSV line {} has {} columns, expected at least 5", lineno + 1, fields.len()),
            });
        }

        let start: i64 = fields[2].parse().map_err(|_| PipelineError::InvalidInput {
            reason: format!("TSV line {}: bad start '{}'", lineno + 1, fields[2]),
        })?;
        let end: i64 = fields[3].parse().map_err(|_| PipelineError::InvalidInput {
            reason: format!("TSV line {}: bad stop '{}'", lineno + 1, fields[3]),
        })?;

        let locus_tag = fields.get(5).copied().unwrap_or("");
        let mut attributes = serde_json::Map::new();
        if let Some(gene) = fields.get(6) {
            attributes.insert("gene".to_string(), serde_json::json!(gene));
        }
        if let Some(product) = fields.get(7) {
            attributes.insert("product".to_string(), serde_json::json!(product));
        }
        if let Some(db_xrefs) = fields.get(8) {
            attributes.insert("db_xrefs".to_string(), serde_json::json!(db_xrefs));
        }

        annotations.push(BaktaAnnotation {
            id: 0,
            job_id,
            feature_id: if locus_tag.is_empty() {
                format!("{}_{}_{}", fields[1], start, end)
            } else {
                locus_tag.to_string()
            },
            feature_type: fields[1].to_string(),
            contig: fields[0].to_string(),
            start,
            end,
            strand: Strand::parse(fields[4]),
            attributes_json: serde_json::Value::Object(attributes).to_string(),
        });
    }
    Ok(annotations)
}
