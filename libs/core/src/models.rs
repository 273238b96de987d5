//! # Domain models
//!
//! Persisted entities for both analysis pipelines. Status enums carry the
//! legal state machine; repositories refuse anything else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of an AMR prediction job.
///
/// ```text
/// Submitted ──► Running ──► Completed
///               ├─► Error      (terminal)
///               └─► Cancelled  (terminal)
/// Submitted ──► Cancelled / Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Submitted,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "Submitted",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Error => "Error",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Submitted" => Some(Self::Submitted),
            "Running" => Some(Self::Running),
            "Completed" => Some(Self::Completed),
            "Error" => Some(Self::Error),
            "Cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Legal transitions only; a terminal state never moves again.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if *self == next {
            // Re-applying the current status is an idempotent no-op upstream.
            return true;
        }
        match self {
            Self::Submitted => matches!(next, Self::Running | Self::Cancelled | Self::Error),
            Self::Running => matches!(next, Self::Completed | Self::Error | Self::Cancelled),
            Self::Completed | Self::Error | Self::Cancelled => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an AMR-side job actually runs. `Predict` is the full pipeline;
/// the others re-process previously produced prediction TSVs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Predict,
    Aggregate,
    Sequence,
    Visualize,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Predict => "predict",
            Self::Aggregate => "aggregate",
            Self::Sequence => "sequence",
            Self::Visualize => "visualize",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "predict" => Some(Self::Predict),
            "aggregate" => Some(Self::Aggregate),
            "sequence" => Some(Self::Sequence),
            "visualize" => Some(Self::Visualize),
            _ => None,
        }
    }
}

/// An AMR prediction job row, params joined eagerly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmrJob {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub job_name: String,
    pub kind: JobKind,
    pub status: JobStatus,
    /// 0.0–100.0, monotonic while `Running`.
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub input_file_path: Option<String>,
    pub result_file_path: Option<String>,
    pub aggregated_result_file_path: Option<String>,
    /// Lock-holder of record; only the owning worker may advance status.
    pub worker_id: Option<String>,
    pub params: Option<AmrJobParams>,
}

pub const MAX_JOB_NAME_LEN: usize = 200;

/// Tuning knobs for one AMR prediction run (1:1 with the job).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmrJobParams {
    pub model_name: String,
    pub batch_size: i64,
    /// 0 disables splitting.
    pub segment_length: i64,
    pub segment_overlap: i64,
    pub use_cpu: bool,
    pub resistance_threshold: f64,
    pub enable_sequence_aggregation: bool,
}

impl Default for AmrJobParams {
    fn default() -> Self {
        Self {
            model_name: "amr-default".to_string(),
            batch_size: 8,
            segment_length: 6000,
            segment_overlap: 0,
            use_cpu: false,
            resistance_threshold: 0.5,
            enable_sequence_aggregation: true,
        }
    }
}

impl AmrJobParams {
    /// Rejects parameter combinations before a job row is ever written.
    pub fn validate(&self) -> Result<(), String> {
        if self.model_name.trim().is_empty() {
            return Err("model_name must not be empty".to_string());
        }
        if self.batch_size < 1 {
            return Err(format!("batch_size must be >= 1, got {}", self.batch_size));
        }
        if self.segment_length < 0 {
            return Err(format!("segment_length must be >= 0, got {}", self.segment_length));
        }
        if self.segment_overlap < 0 {
            return Err(format!("segment_overlap must be >= 0, got {}", self.segment_overlap));
        }
        if self.segment_length > 0 && self.segment_overlap >= self.segment_length {
            return Err(format!(
                "segment_overlap ({}) must be < segment_length ({})",
                self.segment_overlap, self.segment_length
            ));
        }
        if !(0.0..=1.0).contains(&self.resistance_threshold) {
            return Err(format!(
                "resistance_threshold must be within [0.0, 1.0], got {}",
                self.resistance_threshold
            ));
        }
        Ok(())
    }
}

/// Lifecycle of the local view of a Bakta annotation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaktaJobStatus {
    Init,
    Running,
    Successful,
    Error,
}

impl BaktaJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Running => "Running",
            Self::Successful => "Successful",
            Self::Error => "Error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Init" => Some(Self::Init),
            "Running" => Some(Self::Running),
            "Successful" => Some(Self::Successful),
            "Error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Successful | Self::Error)
    }
}

impl std::fmt::Display for BaktaJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local record of a job delegated to the external Bakta service.
///
/// `remote_id` + `secret` authorize every remote call; the secret must never
/// reach logs or error messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaktaJob {
    pub id: Uuid,
    pub remote_id: Option<Uuid>,
    #[serde(skip_serializing, default)]
    pub secret: Option<String>,
    pub name: String,
    pub status: BaktaJobStatus,
    pub fasta_path: String,
    pub config_json: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// One input sequence of a Bakta job, as parsed at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaktaSequence {
    pub id: i64,
    pub job_id: Uuid,
    pub header: String,
    pub sequence: String,
    pub length: i64,
}

/// File formats the Bakta result map is known to carry. Anything else is
/// persisted as an opaque download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaktaFileType {
    Gff3,
    Json,
    Tsv,
    Embl,
    Gbff,
    Faa,
    Ffn,
    Fna,
    TxtLogs,
    Other(String),
}

impl BaktaFileType {
    pub fn from_key(key: &str) -> Self {
        match key.to_ascii_uppercase().as_str() {
            "GFF3" => Self::Gff3,
            "JSON" => Self::Json,
            "TSV" => Self::Tsv,
            "EMBL" => Self::Embl,
            "GBFF" => Self::Gbff,
            "FAA" => Self::Faa,
            "FFN" => Self::Ffn,
            "FNA" => Self::Fna,
            "TXTLOGS" => Self::TxtLogs,
            _ => Self::Other(key.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Gff3 => "GFF3",
            Self::Json => "JSON",
            Self::Tsv => "TSV",
            Self::Embl => "EMBL",
            Self::Gbff => "GBFF",
            Self::Faa => "FAA",
            Self::Ffn => "FFN",
            Self::Fna => "FNA",
            Self::TxtLogs => "TXTLogs",
            Self::Other(s) => s.as_str(),
        }
    }

    /// On-disk extension under `<results_dir>/bakta/<job_id>/`.
    pub fn extension(&self) -> &str {
        match self {
            Self::Gff3 => "gff3",
            Self::Json => "json",
            Self::Tsv => "tsv",
            Self::Embl => "embl",
            Self::Gbff => "gbff",
            Self::Faa => "faa",
            Self::Ffn => "ffn",
            Self::Fna => "fna",
            Self::TxtLogs => "txt",
            Self::Other(_) => "bin",
        }
    }
}

impl std::fmt::Display for BaktaFileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of one downloaded result file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaktaResultFile {
    pub id: i64,
    pub job_id: Uuid,
    pub file_type: BaktaFileType,
    pub file_path: String,
    pub download_url: Option<String>,
    pub downloaded_at: DateTime<Utc>,
}

/// Strand of an annotated feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strand {
    Forward,
    Reverse,
    Unknown,
}

impl Strand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "+",
            Self::Reverse => "-",
            Self::Unknown => ".",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "+" => Self::Forward,
            "-" => Self::Reverse,
            _ => Self::Unknown,
        }
    }
}

/// A single annotated genomic feature (CDS, tRNA, rRNA, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaktaAnnotation {
    pub id: i64,
    pub job_id: Uuid,
    pub feature_id: String,
    pub feature_type: String,
    pub contig: String,
    /// 1-based, `start <= end`.
    pub start: i64,
    pub end: i64,
    pub strand: Strand,
    pub attributes_json: String,
}

/// Append-only audit row; at least one exists per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub job_id: Uuid,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
}
