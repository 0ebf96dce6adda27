use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Progress document as served by the portal. Only the fields the absence
/// extraction needs are modelled; everything else is ignored.
#[derive(Debug, Default, Deserialize)]
pub struct ProgressDocument {
    #[serde(default)]
    pub modules: Vec<ProgressModule>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressModule {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    study_period_module: Option<StudyPeriodModule>,
    #[serde(default)]
    absences: Option<ModuleAbsences>,
}

#[derive(Debug, Default, Deserialize)]
struct StudyPeriodModule {
    #[serde(default)]
    module: Option<ModuleInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct ModuleInfo {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ModuleAbsences {
    #[serde(default)]
    absences: f64,
}

impl ProgressModule {
    /// The module's display name, falling back to the catalogue title.
    fn course_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or_else(|| {
                self.study_period_module
                    .as_ref()?
                    .module
                    .as_ref()?
                    .title
                    .as_deref()
            })
    }

    fn absence_count(&self) -> f64 {
        self.absences.as_ref().map_or(0.0, |a| a.absences)
    }
}

/// One course's absences as pulled from a single progress module.
#[derive(Debug, Clone, PartialEq)]
pub struct CourseAbsence {
    pub course: String,
    pub used: f64,
}

/// Pulls per-course absence counts out of a progress document. Modules with a
/// zero or missing count are skipped, as are modules with no resolvable name.
pub fn extract_absences(progress: &ProgressDocument) -> Vec<CourseAbsence> {
    let mut results = Vec::new();
    for module in &progress.modules {
        let used = module.absence_count();
        if used <= 0.0 {
            continue;
        }
        match module.course_name() {
            Some(course) => results.push(CourseAbsence {
                course: course.to_string(),
                used,
            }),
            None => warn!("Skipping module with absences but no resolvable name"),
        }
    }
    results
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseUsage {
    pub used: f64,
}

/// Response body of the absences endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsenceReport {
    pub total_used: f64,
    pub per_course: BTreeMap<String, CourseUsage>,
    pub last_updated: String,
}

/// Sums absences per course (duplicate course names merge) and rounds the
/// per-course values and the total to 2 decimal places.
pub fn summarize(absences: &[CourseAbsence], now: DateTime<Utc>) -> AbsenceReport {
    let mut used: BTreeMap<String, f64> = BTreeMap::new();
    for entry in absences {
        *used.entry(entry.course.clone()).or_insert(0.0) += entry.used;
    }

    let total: f64 = used.values().sum();
    let per_course = used
        .into_iter()
        .map(|(course, value)| (course, CourseUsage { used: round2(value) }))
        .collect();

    AbsenceReport {
        total_used: round2(total),
        per_course,
        last_updated: now.to_rfc3339_opts(SecondsFormat::Micros, true),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
