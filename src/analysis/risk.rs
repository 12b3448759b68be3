//! Risk Assessment Engine
//!
//! Folds analyzer findings into one category plus per-level counts. Scores
//! are always recomputed from a report snapshot and never stored on their own.

use crate::analysis::foreign_key::FKChain;
use crate::analysis::table_rename::TableRenameReport;
use crate::schema::{DependencyReport, ImpactLevel, RemovalRecommendation, RiskLevel};
use serde::Serialize;
use std::collections::BTreeMap;

/// Aggregated view of a set of dependencies
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub overall_risk: RiskLevel,
    /// 0 (nothing depends on it) to 100
    pub risk_score: u32,
    pub total_dependencies: usize,
    pub counts_by_level: BTreeMap<ImpactLevel, usize>,
    pub recommendation: RemovalRecommendation,
    pub reasons: Vec<String>,
}

impl RiskAssessment {
    pub fn count(&self, level: ImpactLevel) -> usize {
        self.counts_by_level.get(&level).copied().unwrap_or(0)
    }
}

/// Stateless aggregation
pub struct RiskAssessmentEngine;

impl RiskAssessmentEngine {
    pub fn assess_dependencies(report: &DependencyReport) -> RiskAssessment {
        Self::assess_levels(report.all().map(|o| o.impact_level), Vec::new())
    }

    pub fn assess_rename(report: &TableRenameReport) -> RiskAssessment {
        let mut reasons = Vec::new();
        let cyclic = report.dependency_graph.has_circular_dependencies();
        if cyclic {
            reasons.push(format!("{} takes part in a circular foreign key", report.old_name));
        }

        let levels = report.schema_objects.iter().map(|d| d.object.impact_level);
        let mut assessment = Self::assess_levels(levels, reasons);

        // A cycle raises the level without counting as a dependency
        if cyclic {
            assessment.overall_risk = RiskLevel::Critical;
            assessment.risk_score = assessment.risk_score.max(Self::weight(ImpactLevel::Critical));
            assessment.recommendation = RemovalRecommendation::Dangerous;
        }
        assessment
    }

    /// A circular chain counts as a critical finding.
    pub fn assess_chains(chains: &[FKChain]) -> RiskAssessment {
        let mut reasons = Vec::new();
        let levels = chains.iter().map(|chain| {
            if chain.contains_cycles() {
                reasons.push(format!("Circular chain: {}", chain.tables().join(" <- ")));
                ImpactLevel::Critical
            } else if chain.has_cascade() {
                ImpactLevel::High
            } else {
                ImpactLevel::Medium
            }
        });
        let levels: Vec<ImpactLevel> = levels.collect();
        Self::assess_levels(levels, reasons)
    }

    /// Max impact wins; any critical finding flips the recommendation.
    pub fn assess_levels<I>(levels: I, mut reasons: Vec<String>) -> RiskAssessment
    where
        I: IntoIterator<Item = ImpactLevel>,
    {
        let mut counts_by_level = BTreeMap::new();
        let mut total = 0;
        for level in levels {
            *counts_by_level.entry(level).or_insert(0) += 1;
            total += 1;
        }

        let overall_risk = RiskLevel::from_impacts(counts_by_level.keys().copied());
        let risk_score = counts_by_level
            .iter()
            .map(|(level, count)| Self::weight(*level) * *count as u32)
            .sum::<u32>()
            .min(100);

        let recommendation = if counts_by_level.contains_key(&ImpactLevel::Critical) {
            reasons.push(format!(
                "{} critical dependencies",
                counts_by_level[&ImpactLevel::Critical]
            ));
            RemovalRecommendation::Dangerous
        } else {
            RemovalRecommendation::Safe
        };

        RiskAssessment {
            overall_risk,
            risk_score,
            total_dependencies: total,
            counts_by_level,
            recommendation,
            reasons,
        }
    }

    fn weight(level: ImpactLevel) -> u32 {
        match level {
            ImpactLevel::Low => 2,
            ImpactLevel::Medium => 5,
            ImpactLevel::High => 15,
            ImpactLevel::Critical => 40,
        }
    }
}
