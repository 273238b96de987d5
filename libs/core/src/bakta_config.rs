//! # Bakta job configuration
//!
//! Tagged struct for the remote `config` object. Presets pre-fill fields;
//! the merged result is always validated before `start` is allowed.

use serde::{Deserialize, Serialize};

/// Cell-envelope type accepted by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DermType {
    Unknown,
    Monoderm,
    Diderm,
}

/// The remote `config` payload, key for key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BaktaConfig {
    pub complete_genome: bool,
    pub compliant: bool,
    pub derm_type: Option<DermType>,
    pub genus: String,
    /// If true, a replicon table must be uploaded before `start`.
    pub has_replicons: bool,
    pub keep_contig_headers: bool,
    pub locus: String,
    pub locus_tag: String,
    pub min_contig_length: i64,
    pub plasmid: String,
    /// If non-empty, a prodigal training file must be uploaded before `start`.
    pub prodigal_training_file: String,
    pub species: String,
    pub strain: String,
    pub translation_table: i64,
    /// Unknown keys pass through to the remote service untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for BaktaConfig {
    fn default() -> Self {
        Self {
            complete_genome: false,
            compliant: false,
            derm_type: None,
            genus: String::new(),
            has_replicons: false,
            keep_contig_headers: false,
            locus: String::new(),
            locus_tag: String::new(),
            min_contig_length: 1,
            plasmid: String::new(),
            prodigal_training_file: String::new(),
            species: String::new(),
            strain: String::new(),
            translation_table: 11,
            extra: serde_json::Map::new(),
        }
    }
}

impl BaktaConfig {
    /// Named presets; sugar over the defaults, still validated after merge.
    pub fn preset(name: &str) -> Option<Self> {
        let base = Self::default();
        let cfg = match name {
            "default" => base,
            "gram_positive" => Self { derm_type: Some(DermType::Monoderm), ..base },
            "gram_negative" => Self { derm_type: Some(DermType::Diderm), ..base },
            "complete_genome" => Self { complete_genome: true, ..base },
            "draft_genome" => Self { complete_genome: false, min_contig_length: 200, ..base },
            "escherichia_coli" => Self {
                genus: "Escherichia".to_string(),
                species: "coli".to_string(),
                derm_type: Some(DermType::Diderm),
                ..base
            },
            "staphylococcus_aureus" => Self {
                genus: "Staphylococcus".to_string(),
                species: "aureus".to_string(),
                derm_type: Some(DermType::Monoderm),
                ..base
            },
            _ => return None,
        };
        Some(cfg)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.min_contig_length < 1 {
            return Err(format!(
                "minContigLength must be >= 1, got {}",
                self.min_contig_length
            ));
        }
        if self.translation_table != 4 && self.translation_table != 11 {
            return Err(format!(
                "translationTable must be 4 or 11, got {}",
                self.translation_table
            ));
        }
        Ok(())
    }

    /// Whether `start` requires a replicon-table upload first.
    pub fn requires_replicons_upload(&self) -> bool {
        self.has_replicons
    }

    /// Whether `start` requires a prodigal-training-file upload first.
    pub fn requires_prodigal_upload(&self) -> bool {
        !self.prodigal_training_file.is_empty()
    }
}
