//! # Sequence-level aggregation
//!
//! Turns per-segment resistance probabilities into one row per original
//! sequence. Three rules are computed independently and all persisted:
//! any-resistance, majority-vote and average-probability.

use pipeline_core::error::PipelineError;

/// One row of a per-segment prediction TSV.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRow {
    pub sequence_id: String,
    pub start: u64,
    pub end: u64,
    pub resistant: f64,
    pub susceptible: f64,
}

/// Aggregated verdicts for one original sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceAggregate {
    pub header: String,
    pub segment_count: usize,
    pub min_start: u64,
    pub max_end: u64,
    /// Resistant iff any segment probability exceeds the threshold.
    pub any_resistance: bool,
    /// Segments whose resistant probability exceeds the threshold.
    pub resistant_count: usize,
    /// Resistant iff more than half of the segments exceed the threshold.
    pub majority_vote: bool,
    /// Resistant iff the mean resistant probability exceeds the threshold.
    pub avg_classification: bool,
    pub avg_resistance_prob: f64,
    pub avg_susceptible_prob: f64,
}

pub const PREDICTION_HEADER: &str = "Sequence_ID\tStart\tEnd\tResistant\tSusceptible";

pub const AGGREGATED_HEADER: &str = "Sequence_ID\tSegment_Count\tMin_Start\tMax_End\t\
Any_Resistance\tResistant_Segment_Count\tMajority_Vote\tAvg_Classification\t\
Avg_Resistance_Prob\tAvg_Susceptible_Prob";

/// Recovers the original header from a window id shaped
/// `{header}_segment_{i}_{start}_{end}`; anything else is returned verbatim.
pub fn base_header(sequence_id: &str) -> &str {
    if let Some(pos) = sequence_id.rfind("_segment_") {
        let suffix = &sequence_id[pos + "_segment_".len()..];
        let mut parts = suffix.split('_');
        let numeric = parts.clone().count() == 3
            && parts.all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
        if numeric {
            return &sequence_id[..pos];
        }
    }
    sequence_id
}

/// Groups rows by original header (first-seen order) and applies the three
/// aggregation rules at `threshold`.
pub fn aggregate_rows(rows: &[SegmentRow], threshold: f64) -> Vec<SequenceAggregate> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: std::collections::HashMap<String, Vec<&SegmentRow>> =
        std::collections::HashMap::new();

    for row in rows {
        let header = base_header(&row.sequence_id).to_string();
        if !groups.contains_key(&header) {
            order.push(header.clone());
        }
        groups.entry(header).or_default().push(row);
    }

    order
        .into_iter()
        .map(|header| {
            let group = &groups[&header];
            let n = group.len();
            let resistant_count = group.iter().filter(|r| r.resistant > threshold).count();
            let sum_resistant: f64 = group.iter().map(|r| r.resistant).sum();
            let sum_susceptible: f64 = group.iter().map(|r| r.susceptible).sum();
            let avg_resistance_prob = sum_resistant / n as f64;
            let avg_susceptible_prob = sum_susceptible / n as f64;

            SequenceAggregate {
                segment_count: n,
                min_start: group.iter().map(|r| r.start).min().unwrap_or(0),
                max_end: group.iter().map(|r| r.end).max().unwrap_or(0),
                any_resistance: resistant_count > 0,
                resistant_count,
                majority_vote: resistant_count * 2 > n,
                avg_classification: avg_resistance_prob > threshold,
                avg_resistance_prob,
                avg_susceptible_prob,
                header,
            }
        })
        .collect()
}

/// Parses a per-segment prediction TSV back into rows. Extra model-specific
/// columns after the canonical five are ignored.
pub fn parse_prediction_tsv(text: &str) -> Result<Vec<SegmentRow>, PipelineError> {
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if lineno == 0 || line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 5 {
            return Err(PipelineError::InvalidInput {
                reason: format!("prediction TSV line {} has {} columns, expected 5", lineno + 1, fields.len()),
            });
        }
        let parse_num = |s: &str, what: &str| {
            s.parse::<f64>().map_err(|_| PipelineError::InvalidInput {
                reason: format!("prediction TSV line {}: bad {} value '{}'", lineno + 1, what, s),
            })
        };
        rows.push(SegmentRow {
            sequence_id: fields[0].to_string(),
            start: parse_num(fields[1], "start")? as u64,
            end: parse_num(fields[2], "end")? as u64,
            resistant: parse_num(fields[3], "resistant")?,
            susceptible: parse_num(fields[4], "susceptible")?,
        });
    }
    if rows.is_empty() {
        return Err(PipelineError::InvalidInput {
            reason: "prediction TSV contains no data rows".to_string(),
        });
    }
    Ok(rows)
}

fn verdict(resistant: bool) -> &'static str {
    if resistant {
        "Resistant"
    } else {
        "Susceptible"
    }
}

pub fn render_aggregated_tsv(aggregates: &[SequenceAggregate]) -> String {
    let mut out = String::from(AGGREGATED_HEADER);
    out.push('\n');
    for a in aggregates {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{:.6}\t{:.6}\n",
            a.header,
            a.segment_count,
            a.min_start,
            a.max_end,
            verdict(a.any_resistance),
            a.resistant_count,
            verdict(a.majority_vote),
            verdict(a.avg_classification),
            a.avg_resistance_prob,
            a.avg_susceptible_prob,
        ));
    }
    out
}

/// Fixed-step WIG rendering of the resistant-probability track, one
/// `variableStep` block per original sequence.
pub fn render_wig(rows: &[SegmentRow], step_size: u64) -> String {
    let step = step_size.max(1);
    let mut out = String::new();
    let mut current_header: Option<String> = None;

    for row in rows {
        let header = base_header(&row.sequence_id).to_string();
        if current_header.as_deref() != Some(header.as_str()) {
            out.push_str(&format!("variableStep chrom={} span={}\n", header, step));
            current_header = Some(header);
        }
        let mut pos = row.start;
        while pos < row.end {
            out.push_str(&format!("{} {:.6}\n", pos, row.resistant));
            pos += step;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, start: u64, end: u64, resistant: f64) -> SegmentRow {
        SegmentRow {
            sequence_id: id.to_string(),
            start,
            end,
            resistant,
            susceptible: 1.0 - resistant,
        }
    }

    #[test]
    fn base_header_strips_window_suffix_only() {
        assert_eq!(base_header("chr1_segment_0_1_301"), "chr1");
        assert_eq!(base_header("plasmid_a_segment_12_241_541"), "plasmid_a");
        // not a window id: kept verbatim
        assert_eq!(base_header("chr1"), "chr1");
        assert_eq!(base_header("chr1_segment_x_1_2"), "chr1_segment_x_1_2");
        assert_eq!(base_header("weird_segment_1_2"), "weird_segment_1_2");
    }

    #[test]
    fn three_rules_are_independent() {
        // probabilities 0.9, 0.2, 0.2 at threshold 0.5:
        //   any = true, majority (1 of 3) = false, mean 0.4333 = false
        let rows = vec![
            row("s_segment_0_1_101", 1, 101, 0.9),
            row("s_segment_1_101_201", 101, 201, 0.2),
            row("s_segment_2_201_301", 201, 301, 0.2),
        ];
        let agg = aggregate_rows(&rows, 0.5);
        assert_eq!(agg.len(), 1);
        let a = &agg[0];
        assert_eq!(a.header, "s");
        assert_eq!(a.segment_count, 3);
        assert_eq!(a.min_start, 1);
        assert_eq!(a.max_end, 301);
        assert!(a.any_resistance);
        assert_eq!(a.resistant_count, 1);
        assert!(!a.majority_vote);
        assert!(!a.avg_classification);
        assert!((a.avg_resistance_prob - 0.43333).abs() < 1e-4);
    }

    #[test]
    fn majority_needs_strictly_more_than_half() {
        // 2 of 4 over threshold is NOT a majority
        let rows = vec![
            row("s_segment_0_1_11", 1, 11, 0.9),
            row("s_segment_1_11_21", 11, 21, 0.9),
            row("s_segment_2_21_31", 21, 31, 0.1),
            row("s_segment_3_31_41", 31, 41, 0.1),
        ];
        let agg = aggregate_rows(&rows, 0.5);
        assert!(!agg[0].majority_vote);
        assert!(agg[0].any_resistance);
    }

    #[test]
    fn avg_rule_uses_strict_threshold_comparison() {
        let rows = vec![row("s", 1, 11, 0.5), row("s", 11, 21, 0.5)];
        // mean exactly at the threshold is not resistant
        let agg = aggregate_rows(&rows, 0.5);
        assert!(!agg[0].avg_classification);
        assert!(!agg[0].any_resistance);
    }

    #[test]
    fn groups_keep_first_seen_order() {
        let rows = vec![
            row("b_segment_0_1_11", 1, 11, 0.1),
            row("a_segment_0_1_11", 1, 11, 0.9),
            row("b_segment_1_11_21", 11, 21, 0.2),
        ];
        let agg = aggregate_rows(&rows, 0.5);
        assert_eq!(agg[0].header, "b");
        assert_eq!(agg[0].segment_count, 2);
        assert_eq!(agg[1].header, "a");
    }

    #[test]
    fn tsv_roundtrip() {
        let rows = vec![row("chr_segment_0_1_301", 1, 301, 0.75)];
        let mut text = String::from(PREDICTION_HEADER);
        text.push('\n');
        for r in &rows {
            text.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\n",
                r.sequence_id, r.start, r.end, r.resistant, r.susceptible
            ));
        }
        let parsed = parse_prediction_tsv(&text).unwrap();
        assert_eq!(parsed, rows);
    }

    #[test]
    fn tsv_rejects_garbage() {
        assert!(parse_prediction_tsv("Sequence_ID\tStart\n").is_err());
        assert!(parse_prediction_tsv("Sequence_ID\tStart\tEnd\tResistant\tSusceptible\ns\t1\t2\tnope\t0.5\n").is_err());
    }

    #[test]
    fn aggregated_tsv_contains_all_three_verdicts() {
        let rows = vec![
            row("s_segment_0_1_11", 1, 11, 0.9),
            row("s_segment_1_11_21", 11, 21, 0.2),
        ];
        let rendered = render_aggregated_tsv(&aggregate_rows(&rows, 0.5));
        let mut lines = rendered.lines();
        assert_eq!(lines.next(), Some(AGGREGATED_HEADER));
        let data = lines.next().unwrap();
        assert!(data.starts_with("s\t2\t1\t21\tResistant\t1\tSusceptible\tResistant"));
    }

    #[test]
    fn wig_emits_one_block_per_sequence() {
        let rows = vec![
            row("a_segment_0_1_21", 1, 21, 0.4),
            row("b_segment_0_1_11", 1, 11, 0.9),
        ];
        let wig = render_wig(&rows, 10);
        let blocks: Vec<&str> = wig.lines().filter(|l| l.starts_with("variableStep")).collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("chrom=a"));
        assert!(wig.contains("1 0.400000"));
        assert!(wig.contains("11 0.400000"));
    }
}
