pub mod executor;

use foreman_core::PipelineType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One named unit of pipeline work. Declaration order is canonical order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Audit,
    Issues,
    Plans,
    Fixes,
    Qa,
    Docs,
}

impl PipelineStage {
    pub const CANONICAL: [PipelineStage; 6] = [
        PipelineStage::Audit,
        PipelineStage::Issues,
        PipelineStage::Plans,
        PipelineStage::Fixes,
        PipelineStage::Qa,
        PipelineStage::Docs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Audit => "audit",
            PipelineStage::Issues => "issues",
            PipelineStage::Plans => "plans",
            PipelineStage::Fixes => "fixes",
            PipelineStage::Qa => "qa",
            PipelineStage::Docs => "docs",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::CANONICAL.into_iter().find(|st| st.as_str() == s)
    }

    /// Audit and issues run even when nothing has been found yet.
    pub fn is_discovery(&self) -> bool {
        matches!(self, PipelineStage::Audit | PipelineStage::Issues)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Stage sequences ──

const STAGE_SEQUENCES: &[(PipelineType, &[PipelineStage])] = &[
    (PipelineType::Full, &PipelineStage::CANONICAL),
    (PipelineType::SecurityScan, &PipelineStage::CANONICAL),
    (
        PipelineType::AuditOnly,
        &[PipelineStage::Audit, PipelineStage::Issues],
    ),
    (
        PipelineType::PlanOnly,
        &[
            PipelineStage::Audit,
            PipelineStage::Issues,
            PipelineStage::Plans,
        ],
    ),
    (
        PipelineType::TargetedFix,
        &[
            PipelineStage::Issues,
            PipelineStage::Plans,
            PipelineStage::Fixes,
            PipelineStage::Qa,
        ],
    ),
    (
        PipelineType::DocsRefresh,
        &[
            PipelineStage::Audit,
            PipelineStage::Issues,
            PipelineStage::Docs,
        ],
    ),
];

/// Ordered stages a request type runs. Types outside the table run everything.
pub fn stages_for(pipeline_type: PipelineType) -> &'static [PipelineStage] {
    STAGE_SEQUENCES
        .iter()
        .find(|(t, _)| *t == pipeline_type)
        .map(|(_, stages)| *stages)
        .unwrap_or(&PipelineStage::CANONICAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TYPES: [PipelineType; 7] = [
        PipelineType::Full,
        PipelineType::SecurityScan,
        PipelineType::AuditOnly,
        PipelineType::PlanOnly,
        PipelineType::TargetedFix,
        PipelineType::DocsRefresh,
        PipelineType::Custom,
    ];

    #[test]
    fn every_sequence_is_canonical_subsequence() {
        for t in ALL_TYPES {
            let stages = stages_for(t);
            assert!(!stages.is_empty());
            assert!(
                stages.windows(2).all(|w| w[0] < w[1]),
                "{t:?}: {stages:?}"
            );
        }
    }

    #[test]
    fn unknown_type_runs_everything() {
        assert_eq!(stages_for(PipelineType::Custom), &PipelineStage::CANONICAL);
    }

    #[test]
    fn targeted_fix_skips_audit() {
        let stages = stages_for(PipelineType::TargetedFix);
        assert_eq!(stages.first(), Some(&PipelineStage::Issues));
        assert!(!stages.contains(&PipelineStage::Docs));
    }

    #[test]
    fn stage_names_roundtrip() {
        for st in PipelineStage::CANONICAL {
            assert_eq!(PipelineStage::parse(st.as_str()), Some(st));
        }
        assert_eq!(PipelineStage::parse("deploy"), None);
    }
}
