//! Typed artifacts produced by the stages.
//!
//! Each constructor normalizes its input so that readers never need to
//! re-check presence or ranges.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// A heading found in the source content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heading {
    pub level: u8,
    pub text: String,
}

/// Result of `content_analysis`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentAnalysis {
    pub title: Option<String>,
    pub content_type: String,
    pub tone: String,
    pub headings: Vec<Heading>,
    pub paragraph_count: usize,
    pub list_item_count: usize,
    pub code_block_count: usize,
    pub word_count: usize,
    pub key_points: Vec<String>,
    pub summary: String,
}

impl ContentAnalysis {
    pub fn heading_texts(&self) -> impl Iterator<Item = &str> {
        self.headings.iter().map(|h| h.text.as_str())
    }
}

/// Colour palette, values are CSS colours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorPalette {
    pub primary: String,
    pub secondary: String,
    pub background: String,
    pub text: String,
    pub accent: String,
}

impl Default for ColorPalette {
    fn default() -> Self {
        Self {
            primary: "#1f2933".to_string(),
            secondary: "#52606d".to_string(),
            background: "#ffffff".to_string(),
            text: "#1f2933".to_string(),
            accent: "#2f80ed".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Typography {
    pub heading_font: String,
    pub body_font: String,
    pub base_size_px: u32,
    pub line_height: f64,
}

impl Default for Typography {
    fn default() -> Self {
        Self {
            heading_font: "Georgia, serif".to_string(),
            body_font: "system-ui, sans-serif".to_string(),
            base_size_px: 16,
            line_height: 1.6,
        }
    }
}

/// Result of `style_analysis`: the requested style made concrete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleProfile {
    pub style_name: String,
    pub features: Vec<String>,
    pub palette: ColorPalette,
    pub typography: Typography,
    pub layout: String,
    pub mood: String,
}

/// Named design values the stylesheet is built from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignTokens {
    pub colors: BTreeMap<String, String>,
    pub fonts: BTreeMap<String, String>,
    pub spacing: BTreeMap<String, String>,
    pub max_width: String,
}

impl DesignTokens {
    pub fn is_empty(&self) -> bool {
        self.colors.is_empty() && self.fonts.is_empty() && self.spacing.is_empty()
    }

    /// Renders the tokens as CSS custom properties on `:root`.
    pub fn to_css_variables(&self) -> String {
        let mut css = String::from(":root {\n");
        let groups = [
            ("color", &self.colors),
            ("font", &self.fonts),
            ("space", &self.spacing),
        ];
        for (prefix, values) in groups {
            for (name, value) in values {
                let _ = writeln!(css, "  --{}-{}: {};", prefix, name, value);
            }
        }
        if !self.max_width.is_empty() {
            let _ = writeln!(css, "  --max-width: {};", self.max_width);
        }
        css.push('}');
        css
    }
}

/// A single CSS rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleRule {
    pub selector: String,
    pub declarations: BTreeMap<String, String>,
}

impl StyleRule {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            declarations: BTreeMap::new(),
        }
    }

    pub fn with(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.declarations.insert(property.into(), value.into());
        self
    }

    pub fn to_css(&self) -> String {
        let mut css = format!("{} {{\n", self.selector);
        for (property, value) in &self.declarations {
            let _ = writeln!(css, "  {}: {};", property, value);
        }
        css.push('}');
        css
    }
}

/// Result of `code_generation`: a complete HTML document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedMarkup {
    pub html: String,
    pub stylesheet: String,
}

impl GeneratedMarkup {
    pub fn byte_len(&self) -> usize {
        self.html.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityFinding {
    pub severity: Severity,
    pub message: String,
}

impl QualityFinding {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }
}

/// Result of `quality_assessment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    score: f64,
    pub structural_score: f64,
    pub model_score: Option<f64>,
    pub findings: Vec<QualityFinding>,
    pub recommendations: Vec<String>,
    pub summary: String,
}

impl QualityReport {
    /// Builds a report; `score` is clamped into `[0, 1]` and NaN becomes 0.
    pub fn new(score: f64, structural_score: f64, model_score: Option<f64>) -> Self {
        Self {
            score: clamp_unit(score),
            structural_score: clamp_unit(structural_score),
            model_score: model_score.map(clamp_unit),
            findings: Vec::new(),
            recommendations: Vec::new(),
            summary: String::new(),
        }
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn with_findings(mut self, findings: Vec<QualityFinding>) -> Self {
        self.findings = findings;
        self
    }

    pub fn with_recommendations(mut self, recommendations: Vec<String>) -> Self {
        self.recommendations = recommendations;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn critical_findings(&self) -> impl Iterator<Item = &QualityFinding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
    }
}

pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_report_clamps_scores() {
        let report = QualityReport::new(1.4, -0.2, Some(f64::NAN));
        assert_eq!(report.score(), 1.0);
        assert_eq!(report.structural_score, 0.0);
        assert_eq!(report.model_score, Some(0.0));
    }

    #[test]
    fn test_critical_findings_filter() {
        let report = QualityReport::new(0.5, 0.5, None).with_findings(vec![
            QualityFinding::new(Severity::Warning, "low contrast"),
            QualityFinding::new(Severity::Critical, "missing body"),
        ]);
        let critical: Vec<_> = report.critical_findings().collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].message, "missing body");
    }

    #[test]
    fn test_style_rule_to_css() {
        let rule = StyleRule::new("h1")
            .with("font-size", "2rem")
            .with("color", "var(--color-primary)");
        assert_eq!(
            rule.to_css(),
            "h1 {\n  color: var(--color-primary);\n  font-size: 2rem;\n}"
        );
    }

    #[test]
    fn test_tokens_to_css_variables() {
        let mut tokens = DesignTokens::default();
        assert!(tokens.is_empty());
        tokens.colors.insert("primary".into(), "#111".into());
        tokens.max_width = "42rem".into();
        let css = tokens.to_css_variables();
        assert!(css.contains("--color-primary: #111;"));
        assert!(css.contains("--max-width: 42rem;"));
    }
}
