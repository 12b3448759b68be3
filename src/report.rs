//! Impact Reporter
//!
//! Renders dependency reports and removal validations for humans. Every
//! format is produced from the same `ReportView`, so all of them agree on
//! overall risk and dependency count.

use crate::analysis::risk::RiskAssessmentEngine;
use crate::error::{AppError, AppResult};
use crate::removal::plan::RemovalSafetyValidation;
use crate::schema::{DependencyReport, ImpactLevel, ObjectKind, RiskLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Console,
    Json,
    Html,
    Summary,
}

impl FromStr for ReportFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" | "text" => Ok(ReportFormat::Console),
            "json" => Ok(ReportFormat::Json),
            "html" => Ok(ReportFormat::Html),
            "summary" => Ok(ReportFormat::Summary),
            other => Err(AppError::Validation(format!("Unknown report format: '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSection {
    pub heading: String,
    pub lines: Vec<String>,
}

/// Format-independent content of a report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportView {
    pub title: String,
    pub subject: String,
    pub overall_risk: RiskLevel,
    pub total_dependencies: usize,
    pub counts_by_level: BTreeMap<ImpactLevel, usize>,
    pub verdict: String,
    pub sections: Vec<ReportSection>,
}

pub struct ImpactReporter;

impl ImpactReporter {
    pub fn render_dependency_report(report: &DependencyReport, format: ReportFormat) -> AppResult<String> {
        Self::render(&Self::dependency_view(report), format)
    }

    pub fn render_safety_validation(validation: &RemovalSafetyValidation, format: ReportFormat) -> AppResult<String> {
        Self::render(&Self::validation_view(validation), format)
    }

    pub fn dependency_view(report: &DependencyReport) -> ReportView {
        let assessment = RiskAssessmentEngine::assess_dependencies(report);

        let sections = ObjectKind::ALL
            .iter()
            .filter(|kind| !report.of_kind(**kind).is_empty())
            .map(|kind| ReportSection {
                heading: format!("{} ({})", plural(kind.label()), report.of_kind(*kind).len()),
                lines: report
                    .of_kind(*kind)
                    .iter()
                    .map(|o| format!("[{}] {} on {}", o.impact_level, o.name, o.table))
                    .collect(),
            })
            .collect();

        ReportView {
            title: "Column Dependency Report".to_string(),
            subject: format!("{}.{}", report.table, report.column),
            overall_risk: report.overall_risk(),
            total_dependencies: report.total_count(),
            counts_by_level: assessment.counts_by_level,
            verdict: report.get_removal_recommendation().to_string(),
            sections,
        }
    }

    pub fn validation_view(validation: &RemovalSafetyValidation) -> ReportView {
        let mut sections = Vec::new();
        if !validation.blocking_dependencies.is_empty() {
            sections.push(ReportSection {
                heading: "Blocking dependencies".to_string(),
                lines: validation
                    .blocking_dependencies
                    .iter()
                    .map(|o| format!("[{}] {} {} on {}", o.impact_level, o.kind, o.name, o.table))
                    .collect(),
            });
        }
        for (heading, lines) in [("Warnings", &validation.warnings), ("Recommendations", &validation.recommendations)] {
            if !lines.is_empty() {
                sections.push(ReportSection {
                    heading: heading.to_string(),
                    lines: lines.clone(),
                });
            }
        }

        let mut counts_by_level = BTreeMap::new();
        if !validation.blocking_dependencies.is_empty() {
            counts_by_level.insert(ImpactLevel::Critical, validation.blocking_dependencies.len());
        }

        ReportView {
            title: "Column Removal Safety Validation".to_string(),
            subject: format!("{}.{}", validation.table, validation.column),
            overall_risk: validation.risk_level,
            total_dependencies: validation.total_dependencies,
            counts_by_level,
            verdict: if validation.is_safe { "SAFE" } else { "DANGEROUS" }.to_string(),
            sections,
        }
    }

    pub fn render(view: &ReportView, format: ReportFormat) -> AppResult<String> {
        match format {
            ReportFormat::Console => Ok(Self::console(view)),
            ReportFormat::Json => serde_json::to_string_pretty(view)
                .map_err(|e| AppError::Internal(format!("Failed to serialize report: {}", e))),
            ReportFormat::Html => Ok(Self::html(view)),
            ReportFormat::Summary => Ok(Self::summary(view)),
        }
    }

    fn console(view: &ReportView) -> String {
        let mut out = String::new();
        let rule = "=".repeat(60);
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "{}: {}", view.title, view.subject);
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "Overall risk: {}", view.overall_risk);
        let _ = writeln!(out, "Total dependencies: {}", view.total_dependencies);
        for (level, count) in view.counts_by_level.iter().rev() {
            let _ = writeln!(out, "  {:<8} {}", level.to_string(), count);
        }
        let _ = writeln!(out, "Recommendation: {}", view.verdict);

        for section in &view.sections {
            let _ = writeln!(out);
            let _ = writeln!(out, "{}", section.heading);
            let _ = writeln!(out, "{}", "-".repeat(section.heading.len()));
            for line in &section.lines {
                let _ = writeln!(out, "  • {}", line);
            }
        }
        out
    }

    fn summary(view: &ReportView) -> String {
        format!(
            "{}: risk={} dependencies={} recommendation={}",
            view.subject, view.overall_risk, view.total_dependencies, view.verdict
        )
    }

    fn html(view: &ReportView) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "<!DOCTYPE html>");
        let _ = writeln!(out, "<html><head><meta charset=\"utf-8\"><title>{}</title></head><body>", escape_html(&view.title));
        let _ = writeln!(out, "<h1>{}: <code>{}</code></h1>", escape_html(&view.title), escape_html(&view.subject));
        let _ = writeln!(
            out,
            "<p class=\"risk risk-{}\">Overall risk: <strong>{}</strong></p>",
            view.overall_risk.to_string().to_ascii_lowercase(),
            view.overall_risk
        );
        let _ = writeln!(out, "<p>Total dependencies: <strong>{}</strong></p>", view.total_dependencies);
        let _ = writeln!(out, "<p>Recommendation: <strong>{}</strong></p>", escape_html(&view.verdict));

        if !view.counts_by_level.is_empty() {
            let _ = writeln!(out, "<table><tr><th>Impact</th><th>Count</th></tr>");
            for (level, count) in view.counts_by_level.iter().rev() {
                let _ = writeln!(out, "<tr><td>{}</td><td>{}</td></tr>", level, count);
            }
            let _ = writeln!(out, "</table>");
        }

        for section in &view.sections {
            let _ = writeln!(out, "<h2>{}</h2><ul>", escape_html(&section.heading));
            for line in &section.lines {
                let _ = writeln!(out, "<li>{}</li>", escape_html(line));
            }
            let _ = writeln!(out, "</ul>");
        }
        let _ = writeln!(out, "</body></html>");
        out
    }
}

fn plural(label: &str) -> String {
    match label {
        "index" => "Indexes".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => format!("{}{}s", first.to_uppercase(), chars.as_str()),
                None => String::new(),
            }
        }
    }
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaObject;
    use pretty_assertions::assert_eq;

    fn sample() -> DependencyReport {
        let mut report = DependencyReport::new("users", "id");
        report.insert(
            ObjectKind::ForeignKey,
            vec![SchemaObject::new("orders_user_fk", ObjectKind::ForeignKey, "orders", "", ImpactLevel::Critical)],
        );
        report.insert(
            ObjectKind::View,
            vec![SchemaObject::new("v<script>", ObjectKind::View, "users", "", ImpactLevel::High)],
        );
        report
    }

    #[test]
    fn test_all_formats_agree() {
        let report = sample();

        let console = ImpactReporter::render_dependency_report(&report, ReportFormat::Console).unwrap();
        let html = ImpactReporter::render_dependency_report(&report, ReportFormat::Html).unwrap();
        let summary = ImpactReporter::render_dependency_report(&report, ReportFormat::Summary).unwrap();
        let json = ImpactReporter::render_dependency_report(&report, ReportFormat::Json).unwrap();

        assert!(console.contains("Overall risk: CRITICAL"));
        assert!(console.contains("Total dependencies: 2"));
        assert!(html.contains("Overall risk: <strong>CRITICAL</strong>"));
        assert!(html.contains("Total dependencies: <strong>2</strong>"));
        assert_eq!(summary, "users.id: risk=CRITICAL dependencies=2 recommendation=DANGEROUS");

        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["overallRisk"], "critical");
        assert_eq!(parsed["totalDependencies"], 2);
    }

    #[test]
    fn test_html_is_escaped() {
        let html = ImpactReporter::render_dependency_report(&sample(), ReportFormat::Html).unwrap();
        assert!(html.contains("v&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("HTML".parse::<ReportFormat>().unwrap(), ReportFormat::Html);
        assert!("pdf".parse::<ReportFormat>().is_err());
    }
}
