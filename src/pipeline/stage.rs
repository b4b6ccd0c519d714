//! The stage contract and the fixed stage graph.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::state::{PipelineState, StageOutput};
use crate::agents::StageError;

/// Identifies one of the five pipeline stages.
///
/// Ordering follows execution order, so a `BTreeMap<StageName, _>` iterates
/// stages in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    ContentAnalysis,
    StyleAnalysis,
    DesignAdaptation,
    CodeGeneration,
    QualityAssessment,
}

impl StageName {
    /// All stages in first-pass order.
    pub const ALL: [StageName; 5] = [
        StageName::ContentAnalysis,
        StageName::StyleAnalysis,
        StageName::DesignAdaptation,
        StageName::CodeGeneration,
        StageName::QualityAssessment,
    ];

    /// Stages re-run on a retry pass. Analysis results are reused.
    pub const RETRY_PASS: [StageName; 3] = [
        StageName::DesignAdaptation,
        StageName::CodeGeneration,
        StageName::QualityAssessment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::ContentAnalysis => "content_analysis",
            StageName::StyleAnalysis => "style_analysis",
            StageName::DesignAdaptation => "design_adaptation",
            StageName::CodeGeneration => "code_generation",
            StageName::QualityAssessment => "quality_assessment",
        }
    }

    /// Static feedback target of this stage.
    ///
    /// The forward chain plus the retry edge from quality assessment back
    /// to design adaptation.
    pub fn downstream(&self) -> Option<StageName> {
        match self {
            StageName::ContentAnalysis => Some(StageName::StyleAnalysis),
            StageName::StyleAnalysis => Some(StageName::DesignAdaptation),
            StageName::DesignAdaptation => Some(StageName::CodeGeneration),
            StageName::CodeGeneration => Some(StageName::QualityAssessment),
            StageName::QualityAssessment => Some(StageName::DesignAdaptation),
        }
    }

    /// Zero-based position in the first pass.
    pub fn position(&self) -> usize {
        match self {
            StageName::ContentAnalysis => 0,
            StageName::StyleAnalysis => 1,
            StageName::DesignAdaptation => 2,
            StageName::CodeGeneration => 3,
            StageName::QualityAssessment => 4,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// One discrete transformation step.
///
/// `execute` receives a snapshot of the run state and returns a typed
/// output; it must not persist anything. The collaboration wrapper applies
/// the output to the live state and then calls `validate_output`.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    fn validate_preconditions(&self, state: &PipelineState) -> Result<(), StageError>;

    async fn execute(&self, state: &PipelineState) -> Result<StageOutput, StageError>;

    fn validate_output(&self, state: &PipelineState) -> Result<(), StageError>;

    /// Hint for the downstream stage, if any.
    fn get_feedback(&self, _state: &PipelineState) -> Option<String> {
        None
    }

    /// Feedback addressed to `target`. Only the static downstream stage
    /// receives anything by default.
    fn provide_feedback_to(&self, target: StageName, state: &PipelineState) -> Option<String> {
        if self.name().downstream() == Some(target) {
            self.get_feedback(state)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacency_table() {
        assert_eq!(
            StageName::ContentAnalysis.downstream(),
            Some(StageName::StyleAnalysis)
        );
        assert_eq!(
            StageName::CodeGeneration.downstream(),
            Some(StageName::QualityAssessment)
        );
        assert_eq!(
            StageName::QualityAssessment.downstream(),
            Some(StageName::DesignAdaptation)
        );
    }

    #[test]
    fn test_order_matches_position() {
        for (idx, stage) in StageName::ALL.iter().enumerate() {
            assert_eq!(stage.position(), idx);
        }
        let mut sorted = StageName::ALL.to_vec();
        sorted.reverse();
        sorted.sort();
        assert_eq!(sorted, StageName::ALL.to_vec());
    }

    #[test]
    fn test_name_round_trip() {
        for stage in StageName::ALL {
            assert_eq!(stage.as_str().parse::<StageName>().unwrap(), stage);
            assert_eq!(
                serde_json::to_string(&stage).unwrap(),
                format!("\"{}\"", stage)
            );
        }
        assert!("rendering".parse::<StageName>().is_err());
    }
}
