//! Traceability matrix
//!
//! A read-only cross tabulation of requirement IDs against objective,
//! decision, design, task and test IDs. It is computed from a run's
//! canonical artifacts and written as a report; it is never fed back into
//! generation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use specrun_artifact::types::{TraceGap, TraceabilityMatrixContent};
use specrun_artifact::{Artifact, ArtifactType, StableIds};

/// Prefixes that form the matrix columns
pub const COLUMN_PREFIXES: [&str; 5] = ["OBJ", "ADR", "DES", "TASK", "TEST"];

/// Row prefix
pub const ROW_PREFIX: &str = "REQ";

/// Report file name under `audits/`
pub const REPORT_FILE: &str = "traceability_matrix.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceabilityMatrix {
    rows: Vec<String>,
    columns: Vec<String>,
    /// row -> linked columns
    links: BTreeMap<String, BTreeSet<String>>,
    gaps: Vec<TraceGap>,
}

impl TraceabilityMatrix {
    /// Build from canonical artifacts
    ///
    /// Rows come from the ImplementableSpec, or from BusinessRequirements
    /// when no spec exists yet. A cell links a row and a column when both
    /// are mentioned by the same artifact.
    #[must_use]
    pub fn build(artifacts: &[Artifact]) -> Self {
        let considered: Vec<(&Artifact, StableIds)> = artifacts
            .iter()
            .filter(|a| a.is_canonical())
            .filter(|a| {
                !matches!(
                    a.artifact_type(),
                    ArtifactType::TraceabilityMatrix
                        | ArtifactType::InfoSufficiencyAssessment
                        | ArtifactType::Amendment
                )
            })
            .map(|a| (a, StableIds::extract(&a.content)))
            .collect();

        let rows_from = |t: ArtifactType| -> Option<BTreeSet<String>> {
            considered
                .iter()
                .find(|(a, _)| a.artifact_type() == t)
                .map(|(_, ids)| ids.with_prefix(ROW_PREFIX).into_iter().map(str::to_string).collect())
        };
        let rows: Vec<String> = rows_from(ArtifactType::ImplementableSpec)
            .or_else(|| rows_from(ArtifactType::BusinessRequirements))
            .unwrap_or_default()
            .into_iter()
            .collect();

        let columns: BTreeSet<String> = considered
            .iter()
            .flat_map(|(_, ids)| {
                COLUMN_PREFIXES
                    .iter()
                    .flat_map(|p| ids.with_prefix(p).into_iter().map(str::to_string).collect::<Vec<_>>())
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut links: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut gaps = Vec::new();
        for row in &rows {
            let linked: BTreeSet<String> = columns
                .iter()
                .filter(|col| {
                    considered
                        .iter()
                        .any(|(_, ids)| ids.mentions(row) && ids.mentions(col))
                })
                .cloned()
                .collect();
            if linked.is_empty() {
                gaps.push(TraceGap {
                    row_id: row.clone(),
                    severity: "high".to_string(),
                });
            }
            links.insert(row.clone(), linked);
        }

        Self {
            rows,
            columns: columns.into_iter().collect(),
            links,
            gaps,
        }
    }

    #[inline]
    #[must_use]
    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    #[inline]
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[inline]
    #[must_use]
    pub fn gaps(&self) -> &[TraceGap] {
        &self.gaps
    }

    /// Columns linked to `row`
    #[must_use]
    pub fn linked(&self, row: &str) -> Vec<&str> {
        self.links
            .get(row)
            .map(|cols| cols.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_linked(&self, row: &str, column: &str) -> bool {
        self.links.get(row).is_some_and(|cols| cols.contains(column))
    }

    /// Artifact-content form, with cells keyed `"<row>|<column>"`
    #[must_use]
    pub fn to_content(&self) -> TraceabilityMatrixContent {
        let cells = self
            .links
            .iter()
            .flat_map(|(row, cols)| {
                cols.iter()
                    .map(move |col| (format!("{row}|{col}"), vec![row.clone(), col.clone()]))
            })
            .collect();
        TraceabilityMatrixContent {
            rows: self.rows.clone(),
            columns: self.columns.clone(),
            cells,
            gaps: self.gaps.clone(),
            raw_response: None,
        }
    }

    /// Plain-text table for terminals
    #[must_use]
    pub fn render_table(&self) -> String {
        let width = self.rows.iter().map(String::len).max().unwrap_or(3).max(3);
        let mut out = format!("{:width$}  linked\n", "req");
        for row in &self.rows {
            let linked = self.linked(row);
            let cell = if linked.is_empty() {
                "(gap)".to_string()
            } else {
                linked.join(", ")
            };
            out.push_str(&format!("{row:width$}  {cell}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use specrun_artifact::RunId;

    fn artifact(t: ArtifactType, content: Value) -> Artifact {
        Artifact::builder(t, RunId::generate())
            .created_by("tester", "tester#0")
            .build(content)
    }

    fn sample() -> Vec<Artifact> {
        vec![
            artifact(ArtifactType::ProblemBrief, json!({"goals": [{"id": "OBJ-0001"}]})),
            artifact(
                ArtifactType::ImplementableSpec,
                json!({"requirements": [
                    {"id": "REQ-0001", "objective": "OBJ-0001"},
                    {"id": "REQ-0002"}
                ]}),
            ),
            artifact(
                ArtifactType::WorkBreakdown,
                json!({"tasks": [{"id": "TASK-0001", "requirement": "REQ-0001"}]}),
            ),
        ]
    }

    #[test]
    fn links_rows_and_columns_by_co_occurrence() {
        let matrix = TraceabilityMatrix::build(&sample());
        assert_eq!(matrix.rows(), ["REQ-0001".to_string(), "REQ-0002".to_string()]);
        assert_eq!(matrix.columns(), ["OBJ-0001".to_string(), "TASK-0001".to_string()]);
        assert_eq!(matrix.linked("REQ-0001"), vec!["OBJ-0001", "TASK-0001"]);
        // REQ-0002 shares the spec with OBJ-0001, so it links too.
        assert!(matrix.is_linked("REQ-0002", "OBJ-0001"));
        assert!(matrix.gaps().is_empty());
    }

    #[test]
    fn isolated_requirement_is_gap() {
        let artifacts = vec![artifact(
            ArtifactType::ImplementableSpec,
            json!({"requirements": [{"id": "REQ-0009"}]}),
        )];
        let matrix = TraceabilityMatrix::build(&artifacts);
        assert_eq!(
            matrix.gaps(),
            [TraceGap {
                row_id: "REQ-0009".into(),
                severity: "high".into()
            }]
        );
        assert!(matrix.render_table().contains("(gap)"));
    }

    #[test]
    fn falls_back_to_business_requirements() {
        let artifacts = vec![artifact(
            ArtifactType::BusinessRequirements,
            json!({"functional_requirements": [{"id": "REQ-0003", "goal": "OBJ-0002"}]}),
        )];
        let matrix = TraceabilityMatrix::build(&artifacts);
        assert_eq!(matrix.rows(), ["REQ-0003".to_string()]);
    }

    #[test]
    fn content_form_validates() {
        let content = TraceabilityMatrix::build(&sample()).to_content();
        assert!(content.cells.contains_key("REQ-0001|TASK-0001"));
        let value = serde_json::to_value(&content).unwrap();
        assert!(ArtifactType::TraceabilityMatrix.validate_content(&value).is_ok());
    }
}
