//! Canonical name corrections applied after enrichment.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use cohort_core::UNKNOWN_CANONICAL;
use serde::Deserialize;
use strsim::jaro_winkler;

pub const DEFAULT_SIMILARITY: f64 = 0.93;

#[derive(Debug, Clone, Default, Deserialize)]
struct CanonicalRulesFile {
    #[serde(default)]
    similarity: Option<f64>,
    #[serde(default)]
    universities: Vec<String>,
    #[serde(default)]
    programs: Vec<String>,
    #[serde(default)]
    university_fixes: HashMap<String, String>,
    #[serde(default)]
    program_fixes: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CanonicalFixups {
    similarity: f64,
    universities: Vec<String>,
    programs: Vec<String>,
    university_fixes: HashMap<String, String>,
    program_fixes: HashMap<String, String>,
}

impl Default for CanonicalFixups {
    fn default() -> Self {
        Self::from_file(CanonicalRulesFile::default())
    }
}

impl CanonicalFixups {
    fn from_file(file: CanonicalRulesFile) -> Self {
        let lower_keys = |fixes: HashMap<String, String>| {
            fixes
                .into_iter()
                .map(|(k, v)| (k.trim().to_ascii_lowercase(), v))
                .collect()
        };
        Self {
            similarity: file.similarity.unwrap_or(DEFAULT_SIMILARITY),
            universities: file.universities,
            programs: file.programs,
            university_fixes: lower_keys(file.university_fixes),
            program_fixes: lower_keys(file.program_fixes),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: CanonicalRulesFile = serde_yaml::from_str(yaml).context("parsing canonical rules")?;
        Ok(Self::from_file(file))
    }

    /// Load rules from `path`; a missing file yields the pass-through set.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("loading {}", path.display()))
    }

    pub fn university(&self, name: &str) -> String {
        self.apply(name, &self.university_fixes, &self.universities)
    }

    pub fn program(&self, name: &str) -> String {
        self.apply(name, &self.program_fixes, &self.programs)
    }

    fn apply(&self, name: &str, fixes: &HashMap<String, String>, canon: &[String]) -> String {
        let trimmed = name.trim().trim_matches(',').trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(UNKNOWN_CANONICAL) {
            return UNKNOWN_CANONICAL.to_string();
        }
        if let Some(fixed) = fixes.get(&trimmed.to_ascii_lowercase()) {
            return fixed.clone();
        }
        canon
            .iter()
            .map(|c| (c, jaro_winkler(&trimmed.to_ascii_lowercase(), &c.to_ascii_lowercase())))
            .filter(|(_, score)| *score >= self.similarity)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(c, _)| c.clone())
            .unwrap_or_else(|| trimmed.to_string())
    }
}
