//! Retrieval evaluation harness.
//!
//! Measures how relevant a search index's results are for a set of test
//! queries, using an LLM as the judge.
//!
//! # Overview
//!
//! For each query the harness:
//! 1. Retrieves the top-k documents from the search index
//! 2. Strips image references and other artifacts from their text
//! 3. Joins the sanitized documents into one context block
//! 4. Asks the judge to rate the context on a 1-5 relevance scale
//! 5. Records the verdict, or the failure and the stage it happened at
//!
//! # Quick Start
//!
//! ```no_run
//! use retrieval_eval::{
//!     config::Config,
//!     context::ContextAssembler,
//!     judge::{JudgeWithBackoff, LlmJudge},
//!     query::sample_queries,
//!     retriever::SearchIndexClient,
//!     runner::EvaluationRunner,
//!     sanitize::Sanitizer,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Load configuration
//!     let config = Config::load(None)?;
//!     config.validate()?;
//!
//!     let retriever = SearchIndexClient::new(config.search.clone())?;
//!     let judge = JudgeWithBackoff::new(LlmJudge::from_config(config.judge.clone())?, config.retry);
//!     let assembler = ContextAssembler::new(
//!         Sanitizer::new(&config.sanitizer)?,
//!         config.evaluation.separator.clone(),
//!     );
//!
//!     let runner = EvaluationRunner::new(
//!         Arc::new(retriever),
//!         Arc::new(judge),
//!         assembler,
//!         config.evaluation.clone(),
//!     )?;
//!
//!     let report = runner.run(&sample_queries()).await;
//!     report.print_summary();
//!     report.save_json(Path::new("evaluation_results.json"))?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Retriever**: search index client returning ranked documents
//! - **Sanitizer**: removes image references from document text
//! - **ContextAssembler**: builds the context block handed to the judge
//! - **Judge**: LLM judge with bounded retry on transient failures
//! - **EvaluationRunner**: drives queries concurrently and builds the report

pub mod config;
pub mod context;
pub mod error;
pub mod judge;
pub mod query;
pub mod report;
pub mod retriever;
pub mod runner;
pub mod sanitize;

// Re-export commonly used types
pub use config::Config;
pub use context::{ContextAssembler, ContextBlock};
pub use error::{EvalError, Result};
pub use judge::{Judge, JudgeVerdict, JudgeWithBackoff, LlmJudge, Score};
pub use query::{Query, QuerySet};
pub use report::{EvaluationRecord, EvaluationReport};
pub use retriever::{RetrievedDocument, Retriever, SearchIndexClient};
pub use runner::EvaluationRunner;
pub use sanitize::Sanitizer;
