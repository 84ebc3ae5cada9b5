//! Evaluation runner: drives each query through retrieval, assembly and
//! judging, and collects the records into a report.

use crate::config::{EvaluationConfig, RetrievalFailurePolicy};
use crate::context::ContextAssembler;
use crate::error::{JudgeInvocationError, Result, RetrievalError, SanitizationError};
use crate::judge::Judge;
use crate::query::{Query, QuerySet};
use crate::report::{
    EvaluationRecord, EvaluationReport, FailureKind, QueryStage, RecordOutcome, SkippedQuery,
};
use crate::retriever::Retriever;
use futures_util::{StreamExt, stream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a single query failed.
#[derive(Error, Debug)]
enum QueryFailure {
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Sanitization(#[from] SanitizationError),

    #[error(transparent)]
    Judge(#[from] JudgeInvocationError),

    #[error("run timeout of {0}s reached")]
    Timeout(u64),
}

impl QueryFailure {
    fn kind(&self) -> FailureKind {
        match self {
            QueryFailure::Retrieval(_) => FailureKind::Retrieval,
            QueryFailure::Sanitization(_) => FailureKind::Sanitization,
            QueryFailure::Judge(_) => FailureKind::JudgeInvocation,
            QueryFailure::Timeout(_) => FailureKind::Timeout,
        }
    }
}

enum QueryOutcome {
    Recorded(EvaluationRecord),
    Skipped(SkippedQuery),
}

/// Runs a query set against a retriever and a judge.
pub struct EvaluationRunner {
    retriever: Arc<dyn Retriever>,
    judge: Arc<dyn Judge>,
    assembler: ContextAssembler,
    settings: EvaluationConfig,
}

impl EvaluationRunner {
    /// Create a runner. Fails if the evaluation settings are invalid.
    pub fn new(
        retriever: Arc<dyn Retriever>,
        judge: Arc<dyn Judge>,
        assembler: ContextAssembler,
        settings: EvaluationConfig,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            retriever,
            judge,
            assembler,
            settings,
        })
    }

    /// Evaluate every query and build the report.
    ///
    /// Up to `concurrency` queries are in flight at once; records come back in
    /// query order. A failing query becomes a failed record and the run goes on.
    pub async fn run(&self, queries: &QuerySet) -> EvaluationReport {
        let start = Instant::now();
        let deadline = self
            .settings
            .run_timeout_secs
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

        info!(
            queries = queries.len(),
            top_k = self.settings.top_k,
            concurrency = self.settings.concurrency,
            "starting evaluation of '{}'",
            queries.name
        );

        let outcomes: Vec<QueryOutcome> = stream::iter(queries.iter())
            .map(|query| self.evaluate_query(query, deadline))
            .buffered(self.settings.concurrency)
            .collect()
            .await;

        let mut report = EvaluationReport::new(&queries.name);
        for outcome in outcomes {
            match outcome {
                QueryOutcome::Recorded(record) => report.records.push(record),
                QueryOutcome::Skipped(skipped) => report.skipped.push(skipped),
            }
        }

        report.summary.elapsed_secs = start.elapsed().as_secs_f64();
        report.calculate_summary();

        info!(
            succeeded = report.summary.succeeded,
            failed = report.summary.failed,
            skipped = report.summary.skipped,
            "evaluation finished in {:.1}s",
            report.summary.elapsed_secs
        );

        report
    }

    async fn evaluate_query(
        &self,
        query: &Query,
        deadline: Option<tokio::time::Instant>,
    ) -> QueryOutcome {
        let mut stage = QueryStage::Pending;

        let result = match deadline {
            Some(deadline) if tokio::time::Instant::now() >= deadline => {
                Err(QueryFailure::Timeout(self.timeout_secs()))
            }
            Some(deadline) => {
                let timed = tokio::time::timeout_at(deadline, self.evaluate(query, &mut stage)).await;
                timed.unwrap_or_else(|_| Err(QueryFailure::Timeout(self.timeout_secs())))
            }
            None => self.evaluate(query, &mut stage).await,
        };

        match result {
            Ok(outcome) => {
                match &outcome {
                    RecordOutcome::Judged { verdict, .. } => {
                        info!(query = query.position, score = %verdict.score, "query judged")
                    }
                    _ => info!(query = query.position, "no documents retrieved"),
                }
                debug!(query = query.position, from = %stage, to = %QueryStage::Recorded, "state change");
                QueryOutcome::Recorded(EvaluationRecord::new(
                    query.position,
                    query.text.clone(),
                    outcome,
                ))
            }
            Err(QueryFailure::Retrieval(err))
                if self.settings.on_retrieval_error == RetrievalFailurePolicy::Skip =>
            {
                warn!(query = query.position, error = %err, "retrieval failed, skipping query");
                QueryOutcome::Skipped(SkippedQuery {
                    position: query.position,
                    query: query.text.clone(),
                    reason: err.to_string(),
                })
            }
            Err(failure) => {
                warn!(
                    query = query.position,
                    kind = %failure.kind(),
                    stage = %stage,
                    error = %failure,
                    "query failed"
                );
                debug!(query = query.position, from = %stage, to = %QueryStage::Error, "state change");
                QueryOutcome::Recorded(EvaluationRecord::new(
                    query.position,
                    query.text.clone(),
                    RecordOutcome::failed(failure.kind(), stage, failure.to_string()),
                ))
            }
        }
    }

    /// Take one query through the pipeline, advancing `stage` as each step completes.
    async fn evaluate(
        &self,
        query: &Query,
        stage: &mut QueryStage,
    ) -> std::result::Result<RecordOutcome, QueryFailure> {
        let documents = self.retriever.retrieve(query, self.settings.top_k).await?;
        *stage = QueryStage::Retrieved;
        debug!(query = query.position, documents = documents.len(), "retrieved");

        let context = self.assembler.assemble(&documents)?;
        *stage = QueryStage::Assembled;
        if self.assembler.sanitizer().has_image_reference(context.text()) {
            warn!(
                query = query.position,
                "image reference spans document boundaries in assembled context"
            );
        }
        debug!(
            query = query.position,
            context_bytes = context.text().len(),
            status = ?context.status(),
            "assembled context"
        );

        if context.is_empty() && !self.settings.judge_empty_context {
            return Ok(RecordOutcome::NoDocuments);
        }

        let verdict = self.judge.judge(query, &context).await?;
        *stage = QueryStage::Judged;

        Ok(RecordOutcome::judged(context, &documents, verdict))
    }

    fn timeout_secs(&self) -> u64 {
        self.settings.run_timeout_secs.unwrap_or_default()
    }
}
