//! Evaluation records and the aggregate report.
//!
//! Reports are saved as pretty-printed JSON so they can be diffed between runs
//! and reloaded with `retrieval-eval show`. The records can also be flattened
//! to CSV for spreadsheets.

use crate::context::{ContextBlock, ContextStatus};
use crate::error::{EvalError, Result};
use crate::judge::JudgeVerdict;
use crate::retriever::RetrievedDocument;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// Default filename for saved reports.
pub const DEFAULT_REPORT_FILENAME: &str = "evaluation_results.json";

/// Column order of CSV exports.
pub const CSV_COLUMNS: [&str; 12] = [
    "query",
    "score",
    "reason",
    "retrieved_context_preview",
    "full_retrieved_context",
    "retrieved_chunks",
    "position",
    "outcome",
    "context_status",
    "failure_kind",
    "failure_stage",
    "error",
];

/// Why a query ended without a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    #[serde(rename = "RetrievalError")]
    Retrieval,
    #[serde(rename = "SanitizationError")]
    Sanitization,
    #[serde(rename = "JudgeInvocationError")]
    JudgeInvocation,
    /// The run deadline passed before the query finished.
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Retrieval => "RetrievalError",
            FailureKind::Sanitization => "SanitizationError",
            FailureKind::JudgeInvocation => "JudgeInvocationError",
            FailureKind::Timeout => "Timeout",
        };
        f.write_str(name)
    }
}

/// Where a query is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStage {
    Pending,
    Retrieved,
    Assembled,
    Judged,
    Recorded,
    Error,
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryStage::Pending => "pending",
            QueryStage::Retrieved => "retrieved",
            QueryStage::Assembled => "assembled",
            QueryStage::Judged => "judged",
            QueryStage::Recorded => "recorded",
            QueryStage::Error => "error",
        };
        f.write_str(name)
    }
}

/// Metadata of one retrieved document, kept for the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub rank: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_score: Option<f64>,
    /// Length of the raw content in characters.
    pub content_chars: usize,
}

impl From<&RetrievedDocument> for DocumentSummary {
    fn from(doc: &RetrievedDocument) -> Self {
        Self {
            rank: doc.rank,
            source_id: doc.source_id.clone(),
            title: doc.title.clone(),
            url: doc.url.clone(),
            filepath: doc.filepath.clone(),
            search_score: doc.search_score,
            content_chars: doc.content.chars().count(),
        }
    }
}

/// How one query ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Judged {
        status: ContextStatus,
        context_preview: String,
        context: ContextBlock,
        documents: Vec<DocumentSummary>,
        verdict: JudgeVerdict,
    },
    /// Nothing was retrieved, so there was nothing to judge.
    NoDocuments,
    Failed {
        kind: FailureKind,
        /// Last stage the query completed before failing.
        stage: QueryStage,
        message: String,
    },
}

impl RecordOutcome {
    pub fn judged(
        context: ContextBlock,
        documents: &[RetrievedDocument],
        verdict: JudgeVerdict,
    ) -> Self {
        RecordOutcome::Judged {
            status: context.status(),
            context_preview: context.preview(),
            documents: documents.iter().map(DocumentSummary::from).collect(),
            context,
            verdict,
        }
    }

    pub fn failed(kind: FailureKind, stage: QueryStage, message: impl Into<String>) -> Self {
        RecordOutcome::Failed {
            kind,
            stage,
            message: message.into(),
        }
    }
}

/// Result for a single query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    /// 0-based position in the query set.
    pub position: usize,
    pub query: String,
    #[serde(flatten)]
    pub outcome: RecordOutcome,
}

impl EvaluationRecord {
    pub fn new(position: usize, query: impl Into<String>, outcome: RecordOutcome) -> Self {
        Self {
            position,
            query: query.into(),
            outcome,
        }
    }

    pub fn verdict(&self) -> Option<&JudgeVerdict> {
        match &self.outcome {
            RecordOutcome::Judged { verdict, .. } => Some(verdict),
            _ => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            RecordOutcome::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.verdict().is_some()
    }

    /// One CSV row in [`CSV_COLUMNS`] order. Documents are written as a JSON array.
    fn csv_row(&self) -> Result<[String; 12]> {
        let mut row: [String; 12] = Default::default();
        row[0] = self.query.clone();
        row[6] = self.position.to_string();

        match &self.outcome {
            RecordOutcome::Judged {
                status,
                context_preview,
                context,
                documents,
                verdict,
            } => {
                row[1] = verdict.score.to_string();
                row[2] = verdict.rationale.clone().unwrap_or_default();
                row[3] = context_preview.clone();
                row[4] = context.text().to_string();
                row[5] = serde_json::to_string(documents)?;
                row[7] = "judged".to_string();
                row[8] = match status {
                    ContextStatus::NoDocuments => "no_documents",
                    ContextStatus::Blank => "blank",
                    ContextStatus::Informative => "informative",
                }
                .to_string();
            }
            RecordOutcome::NoDocuments => {
                row[5] = "[]".to_string();
                row[7] = "no_documents".to_string();
                row[8] = "no_documents".to_string();
            }
            RecordOutcome::Failed {
                kind,
                stage,
                message,
            } => {
                row[7] = "failed".to_string();
                row[9] = kind.to_string();
                row[10] = stage.to_string();
                row[11] = message.clone();
            }
        }

        Ok(row)
    }
}

/// A query left out of the records by the retrieval skip policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedQuery {
    pub position: usize,
    pub query: String,
    pub reason: String,
}

/// Aggregate statistics over the records of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Records in the report (skipped queries are not records).
    pub total: usize,
    /// Records with a verdict.
    pub succeeded: usize,
    pub failed: usize,
    pub no_documents: usize,
    pub skipped: usize,
    /// Mean score over successful records.
    pub mean_score: Option<f64>,
    pub median_score: Option<f64>,
    /// Count of verdicts per score, 1 through 5.
    pub distribution: BTreeMap<u8, usize>,
    pub failures_by_kind: BTreeMap<FailureKind, usize>,
    /// Wall-clock duration of the run in seconds.
    pub elapsed_secs: f64,
}

impl Default for ReportSummary {
    fn default() -> Self {
        Self {
            total: 0,
            succeeded: 0,
            failed: 0,
            no_documents: 0,
            skipped: 0,
            mean_score: None,
            median_score: None,
            distribution: empty_distribution(),
            failures_by_kind: BTreeMap::new(),
            elapsed_secs: 0.0,
        }
    }
}

fn empty_distribution() -> BTreeMap<u8, usize> {
    (1..=5).map(|score| (score, 0)).collect()
}

/// Records of one run, in original query order, plus summary statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Name of the query set.
    pub name: String,
    pub records: Vec<EvaluationRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedQuery>,
    pub summary: ReportSummary,
}

impl EvaluationReport {
    /// Create an empty report.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: Vec::new(),
            skipped: Vec::new(),
            summary: ReportSummary::default(),
        }
    }

    /// Recompute summary statistics from the records. Keeps `elapsed_secs`.
    pub fn calculate_summary(&mut self) {
        let mut summary = ReportSummary {
            total: self.records.len(),
            skipped: self.skipped.len(),
            elapsed_secs: self.summary.elapsed_secs,
            ..ReportSummary::default()
        };

        let mut scores = Vec::new();

        for record in &self.records {
            match &record.outcome {
                RecordOutcome::Judged { verdict, .. } => {
                    let score = verdict.score.value();
                    scores.push(score);
                    *summary.distribution.entry(score).or_insert(0) += 1;
                }
                RecordOutcome::NoDocuments => summary.no_documents += 1,
                RecordOutcome::Failed { kind, .. } => {
                    *summary.failures_by_kind.entry(*kind).or_insert(0) += 1;
                }
            }
        }

        summary.succeeded = scores.len();
        summary.failed = summary.failures_by_kind.values().sum();

        if !scores.is_empty() {
            let sum: f64 = scores.iter().map(|s| f64::from(*s)).sum();
            summary.mean_score = Some(sum / scores.len() as f64);

            scores.sort_unstable();
            let mid = scores.len() / 2;
            let median = if scores.len() % 2 == 0 {
                (f64::from(scores[mid - 1]) + f64::from(scores[mid])) / 2.0
            } else {
                f64::from(scores[mid])
            };
            summary.median_score = Some(median);
        }

        self.summary = summary;
    }

    /// True when at least one query received a verdict.
    pub fn has_successes(&self) -> bool {
        self.records.iter().any(EvaluationRecord::is_success)
    }

    pub fn failed_records(&self) -> impl Iterator<Item = &EvaluationRecord> {
        self.records.iter().filter(|r| r.failure_kind().is_some())
    }

    /// Print each record to stdout.
    pub fn print_records(&self) {
        for record in &self.records {
            println!("\n[{}] {}", record.position + 1, record.query);
            match &record.outcome {
                RecordOutcome::Judged {
                    status,
                    context_preview,
                    documents,
                    verdict,
                    ..
                } => {
                    println!("  Score: {}/5", verdict.score);
                    if let Some(ref rationale) = verdict.rationale {
                        println!("  Rationale: {}", rationale);
                    }
                    println!("  Documents: {}", documents.len());
                    if *status == ContextStatus::Informative {
                        println!("  Context: {}", context_preview.replace('\n', " "));
                    } else {
                        println!("  Context: (blank after sanitization)");
                    }
                }
                RecordOutcome::NoDocuments => println!("  No documents retrieved"),
                RecordOutcome::Failed {
                    kind,
                    stage,
                    message,
                } => println!("  FAILED ({} after {}): {}", kind, stage, message),
            }
        }
    }

    /// Print summary to stdout.
    pub fn print_summary(&self) {
        let summary = &self.summary;

        println!("\n========== Evaluation Results ==========");
        println!("Query set: {}", self.name);
        println!("Total queries: {}", summary.total + summary.skipped);
        println!("----------------------------------------");
        println!("Judged:       {}", summary.succeeded);
        println!("No documents: {}", summary.no_documents);
        println!("Failed:       {}", summary.failed);
        println!("Skipped:      {}", summary.skipped);
        println!("----------------------------------------");
        match (summary.mean_score, summary.median_score) {
            (Some(mean), Some(median)) => {
                println!("Mean score:   {:.2}/5", mean);
                println!("Median score: {:.1}/5", median);
            }
            _ => println!("Mean score:   n/a"),
        }
        for (score, count) in &summary.distribution {
            println!("  {} | {}", score, count);
        }

        if !summary.failures_by_kind.is_empty() {
            println!("----------------------------------------");
            println!("Failures by kind:");
            for (kind, count) in &summary.failures_by_kind {
                println!("  {}: {}", kind, count);
            }
            println!("Failed queries:");
            for record in self.failed_records() {
                if let RecordOutcome::Failed { kind, message, .. } = &record.outcome {
                    println!("  [{}] {} ({}): {}", record.position + 1, record.query, kind, message);
                }
            }
        }

        if !self.skipped.is_empty() {
            println!("Skipped queries:");
            for skipped in &self.skipped {
                println!("  [{}] {}: {}", skipped.position + 1, skipped.query, skipped.reason);
            }
        }

        println!("----------------------------------------");
        println!("Total time: {:.1}s", summary.elapsed_secs);
        println!("========================================\n");
    }

    /// Save the report as pretty JSON, creating the parent directory if needed.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| EvalError::io(parent, e))?;
            }
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|e| EvalError::io(path, e))?;

        Ok(())
    }

    /// Write the records as CSV with a header row, creating the parent directory if needed.
    pub fn save_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| EvalError::io(parent, e))?;
            }
        }

        let file = fs::File::create(path).map_err(|e| EvalError::io(path, e))?;
        let mut writer = csv::Writer::from_writer(file);
        let csv_error = |e: csv::Error| EvalError::Serialization(format!("{}: {}", path.display(), e));

        writer.write_record(CSV_COLUMNS).map_err(csv_error)?;
        for record in &self.records {
            writer.write_record(record.csv_row()?).map_err(csv_error)?;
        }
        writer.flush().map_err(|e| EvalError::io(path, e))?;

        Ok(())
    }

    /// Load a report saved by [`EvaluationReport::save_json`].
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;
        serde_json::from_str(&content)
            .map_err(|e| EvalError::Serialization(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SanitizerConfig;
    use crate::context::ContextAssembler;
    use crate::judge::Score;
    use crate::sanitize::Sanitizer;
    use tempfile::tempdir;

    fn judged(position: usize, score: u8) -> EvaluationRecord {
        let docs = vec![
            RetrievedDocument::new(1, "SharePoint sites organise content.").with_source_id("a"),
            RetrievedDocument::new(2, "Hubs connect sites."),
        ];
        let assembler =
            ContextAssembler::new(Sanitizer::new(&SanitizerConfig::default()).unwrap(), "\n\n");
        let context = assembler.assemble(&docs).unwrap();
        let verdict = JudgeVerdict::new(Score::new(score).unwrap(), Some("fine".to_string()));

        EvaluationRecord::new(
            position,
            format!("query {}", position),
            RecordOutcome::judged(context, &docs, verdict),
        )
    }

    fn failed(position: usize, kind: FailureKind) -> EvaluationRecord {
        EvaluationRecord::new(
            position,
            format!("query {}", position),
            RecordOutcome::failed(kind, QueryStage::Pending, "boom"),
        )
    }

    #[test]
    fn test_summary_statistics() {
        let mut report = EvaluationReport::new("test");
        report.records.push(judged(0, 4));
        report.records.push(judged(1, 2));
        report.records.push(judged(2, 5));
        report.records.push(judged(3, 5));
        report.records.push(failed(4, FailureKind::Retrieval));
        report.records.push(EvaluationRecord::new(5, "q", RecordOutcome::NoDocuments));
        report.summary.elapsed_secs = 1.5;

        report.calculate_summary();
        let summary = &report.summary;

        assert_eq!(summary.total, 6);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.no_documents, 1);
        assert_eq!(summary.mean_score, Some(4.0));
        assert_eq!(summary.median_score, Some(4.5));
        assert_eq!(summary.distribution[&5], 2);
        assert_eq!(summary.distribution[&1], 0);
        assert_eq!(summary.distribution.len(), 5);
        assert_eq!(summary.failures_by_kind[&FailureKind::Retrieval], 1);
        assert_eq!(summary.elapsed_secs, 1.5);
        assert!(report.has_successes());
    }

    #[test]
    fn test_summary_without_successes() {
        let mut report = EvaluationReport::new("test");
        report.records.push(failed(0, FailureKind::JudgeInvocation));
        report.records.push(failed(1, FailureKind::Timeout));
        report.calculate_summary();

        assert_eq!(report.summary.failed, 2);
        assert_eq!(report.summary.mean_score, None);
        assert_eq!(report.summary.median_score, None);
        assert!(!report.has_successes());
        assert_eq!(report.failed_records().count(), 2);
    }

    #[test]
    fn test_failure_kind_names() {
        assert_eq!(
            serde_json::to_string(&FailureKind::Retrieval).unwrap(),
            "\"RetrievalError\""
        );
        assert_eq!(FailureKind::JudgeInvocation.to_string(), "JudgeInvocationError");
    }

    #[test]
    fn test_record_json_shape() {
        let value = serde_json::to_value(failed(2, FailureKind::Sanitization)).unwrap();
        assert_eq!(value["outcome"], "failed");
        assert_eq!(value["kind"], "SanitizationError");
        assert_eq!(value["stage"], "pending");
        assert_eq!(value["position"], 2);

        let value = serde_json::to_value(judged(0, 3)).unwrap();
        assert_eq!(value["outcome"], "judged");
        assert_eq!(value["verdict"]["score"], 3);
        assert_eq!(value["status"], "informative");
        assert_eq!(value["documents"][0]["source_id"], "a");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(DEFAULT_REPORT_FILENAME);

        let mut report = EvaluationReport::new("sample");
        report.records.push(judged(0, 4));
        report.records.push(failed(1, FailureKind::Retrieval));
        report.skipped.push(SkippedQuery {
            position: 2,
            query: "q".to_string(),
            reason: "index not found".to_string(),
        });
        report.calculate_summary();

        report.save_json(&path).unwrap();
        let loaded = EvaluationReport::load_json(&path).unwrap();

        assert_eq!(loaded, report);
        assert_eq!(loaded.summary.skipped, 1);
    }

    #[test]
    fn test_save_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("evaluation_results.csv");

        let mut report = EvaluationReport::new("sample");
        report.records.push(judged(0, 4));
        report.records.push(EvaluationRecord::new(1, "q, with comma", RecordOutcome::NoDocuments));
        report.records.push(failed(2, FailureKind::Retrieval));
        report.save_csv(&path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, CSV_COLUMNS);

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);

        assert_eq!(&rows[0][0], "query 0");
        assert_eq!(&rows[0][1], "4");
        assert_eq!(&rows[0][2], "fine");
        assert_eq!(
            &rows[0][4],
            "SharePoint sites organise content.\n\nHubs connect sites."
        );
        let chunks: serde_json::Value = serde_json::from_str(&rows[0][5]).unwrap();
        assert_eq!(chunks[0]["source_id"], "a");
        assert_eq!(chunks.as_array().unwrap().len(), 2);
        assert_eq!(&rows[0][8], "informative");

        assert_eq!(&rows[1][0], "q, with comma");
        assert_eq!(&rows[1][1], "");
        assert_eq!(&rows[1][7], "no_documents");

        assert_eq!(&rows[2][7], "failed");
        assert_eq!(&rows[2][9], "RetrievalError");
        assert_eq!(&rows[2][10], "pending");
        assert_eq!(&rows[2][11], "boom");
    }

    #[test]
    fn test_load_missing_report() {
        let dir = tempdir().unwrap();
        let err = EvaluationReport::load_json(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, EvalError::Io { .. }));
    }
}
