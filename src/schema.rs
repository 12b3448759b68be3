//! Core data model shared by analyzers, planners and reporters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of schema object that can depend on a table or column
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    ForeignKey,
    View,
    Trigger,
    Index,
    Constraint,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 5] = [
        ObjectKind::ForeignKey,
        ObjectKind::View,
        ObjectKind::Trigger,
        ObjectKind::Index,
        ObjectKind::Constraint,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ObjectKind::ForeignKey => "foreign key",
            ObjectKind::View => "view",
            ObjectKind::Trigger => "trigger",
            ObjectKind::Index => "index",
            ObjectKind::Constraint => "constraint",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How badly a single dependent object is affected
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ImpactLevel {
    pub const ALL: [ImpactLevel; 4] = [
        ImpactLevel::Low,
        ImpactLevel::Medium,
        ImpactLevel::High,
        ImpactLevel::Critical,
    ];
}

impl fmt::Display for ImpactLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImpactLevel::Low => "LOW",
            ImpactLevel::Medium => "MEDIUM",
            ImpactLevel::High => "HIGH",
            ImpactLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Aggregate risk of a whole change. `Safe` means nothing depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Maximum impact across `levels`; `Safe` for an empty set.
    pub fn from_impacts<I: IntoIterator<Item = ImpactLevel>>(levels: I) -> Self {
        levels
            .into_iter()
            .max()
            .map(RiskLevel::from)
            .unwrap_or(RiskLevel::Safe)
    }
}

impl From<ImpactLevel> for RiskLevel {
    fn from(level: ImpactLevel) -> Self {
        match level {
            ImpactLevel::Low => RiskLevel::Low,
            ImpactLevel::Medium => RiskLevel::Medium,
            ImpactLevel::High => RiskLevel::High,
            ImpactLevel::Critical => RiskLevel::Critical,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Safe => "SAFE",
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// A schema object that depends on the analyzed table/column.
/// Immutable once an analyzer has produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaObject {
    pub name: String,
    pub kind: ObjectKind,
    /// Table the object is defined on (the referencing table for foreign keys)
    pub table: String,
    /// DDL or constraint body needed to recreate the object
    pub definition: String,
    pub impact_level: ImpactLevel,
}

impl SchemaObject {
    pub fn new(
        name: impl Into<String>,
        kind: ObjectKind,
        table: impl Into<String>,
        definition: impl Into<String>,
        impact_level: ImpactLevel,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            table: table.into(),
            definition: definition.into(),
            impact_level,
        }
    }
}

/// Every dependency of one column, grouped by kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyReport {
    pub table: String,
    pub column: String,
    pub dependencies: BTreeMap<ObjectKind, Vec<SchemaObject>>,
    pub analyzed_at: DateTime<Utc>,
}

impl DependencyReport {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            dependencies: BTreeMap::new(),
            analyzed_at: Utc::now(),
        }
    }

    /// Record the objects found for one kind. Empty lists are not stored.
    pub fn insert(&mut self, kind: ObjectKind, objects: Vec<SchemaObject>) {
        if !objects.is_empty() {
            self.dependencies.entry(kind).or_default().extend(objects);
        }
    }

    pub fn of_kind(&self, kind: ObjectKind) -> &[SchemaObject] {
        self.dependencies.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all(&self) -> impl Iterator<Item = &SchemaObject> {
        self.dependencies.values().flatten()
    }

    pub fn total_count(&self) -> usize {
        self.dependencies.values().map(Vec::len).sum()
    }

    pub fn has_dependencies(&self) -> bool {
        self.total_count() > 0
    }

    pub fn critical_dependencies(&self) -> Vec<&SchemaObject> {
        self.all()
            .filter(|o| o.impact_level == ImpactLevel::Critical)
            .collect()
    }

    pub fn overall_risk(&self) -> RiskLevel {
        RiskLevel::from_impacts(self.all().map(|o| o.impact_level))
    }

    /// Binary gate: any critical dependency makes removal dangerous.
    pub fn get_removal_recommendation(&self) -> RemovalRecommendation {
        if self.critical_dependencies().is_empty() {
            RemovalRecommendation::Safe
        } else {
            RemovalRecommendation::Dangerous
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemovalRecommendation {
    Safe,
    Dangerous,
}

impl RemovalRecommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalRecommendation::Safe => "SAFE",
            RemovalRecommendation::Dangerous => "DANGEROUS",
        }
    }
}

impl fmt::Display for RemovalRecommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq<&str> for RemovalRecommendation {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn obj(name: &str, kind: ObjectKind, level: ImpactLevel) -> SchemaObject {
        SchemaObject::new(name, kind, "users", "", level)
    }

    #[test]
    fn test_empty_report_is_safe() {
        let report = DependencyReport::new("users", "nickname");
        assert!(!report.has_dependencies());
        assert_eq!(report.total_count(), 0);
        assert_eq!(report.overall_risk(), RiskLevel::Safe);
        assert!(report.get_removal_recommendation() == "SAFE");
    }

    #[test]
    fn test_total_count_sums_every_kind() {
        let mut report = DependencyReport::new("users", "id");
        report.insert(ObjectKind::View, vec![obj("v1", ObjectKind::View, ImpactLevel::High)]);
        report.insert(
            ObjectKind::Index,
            vec![
                obj("i1", ObjectKind::Index, ImpactLevel::Medium),
                obj("i2", ObjectKind::Index, ImpactLevel::Medium),
            ],
        );
        report.insert(ObjectKind::Trigger, vec![]);

        let by_kind: usize = ObjectKind::ALL.iter().map(|k| report.of_kind(*k).len()).sum();
        assert_eq!(report.total_count(), 3);
        assert_eq!(report.total_count(), by_kind);
        assert!(!report.dependencies.contains_key(&ObjectKind::Trigger));
    }

    #[test]
    fn test_critical_iff_any_critical_dependency() {
        let mut report = DependencyReport::new("users", "id");
        report.insert(ObjectKind::View, vec![obj("v1", ObjectKind::View, ImpactLevel::High)]);
        assert_eq!(report.overall_risk(), RiskLevel::High);
        assert_eq!(report.get_removal_recommendation(), RemovalRecommendation::Safe);

        report.insert(
            ObjectKind::ForeignKey,
            vec![obj("fk", ObjectKind::ForeignKey, ImpactLevel::Critical)],
        );
        assert_eq!(report.overall_risk(), RiskLevel::Critical);
        assert_eq!(report.get_removal_recommendation(), RemovalRecommendation::Dangerous);
    }

    #[test]
    fn test_risk_ordering() {
        assert!(RiskLevel::Safe < RiskLevel::Low);
        assert!(ImpactLevel::Medium < ImpactLevel::Critical);
        assert_eq!(RiskLevel::from_impacts([]), RiskLevel::Safe);
        assert_eq!(
            RiskLevel::from_impacts([ImpactLevel::Low, ImpactLevel::High, ImpactLevel::Medium]),
            RiskLevel::High
        );
    }
}
