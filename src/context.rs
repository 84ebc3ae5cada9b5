//! Assembly of retrieved documents into the context handed to the judge.

use crate::error::SanitizationError;
use crate::retriever::RetrievedDocument;
use crate::sanitize::Sanitizer;
use serde::{Deserialize, Serialize};

/// Characters of context kept in report previews.
pub const PREVIEW_CHARS: usize = 200;

/// Sanitized text of one retrieved document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSegment {
    pub rank: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub text: String,
}

/// What a context block says about retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    /// The retriever returned nothing.
    NoDocuments,
    /// Documents came back, but nothing but whitespace survived sanitization.
    Blank,
    Informative,
}

/// The sanitized documents of one query, in rank order.
///
/// Segments are kept alongside the joined text so document boundaries stay
/// recoverable even when a document's text contains the separator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBlock {
    segments: Vec<ContextSegment>,
    separator: String,
    text: String,
}

impl ContextBlock {
    /// A block for a query that retrieved nothing.
    pub fn empty() -> Self {
        Self {
            segments: Vec::new(),
            separator: String::new(),
            text: String::new(),
        }
    }

    fn from_segments(segments: Vec<ContextSegment>, separator: &str) -> Self {
        let text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(separator);

        Self {
            segments,
            separator: separator.to_string(),
            text,
        }
    }

    /// The joined context as sent to the judge.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn segments(&self) -> &[ContextSegment] {
        &self.segments
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn document_count(&self) -> usize {
        self.segments.len()
    }

    /// True only when no documents were retrieved.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn status(&self) -> ContextStatus {
        if self.segments.is_empty() {
            ContextStatus::NoDocuments
        } else if self.text.trim().is_empty() {
            ContextStatus::Blank
        } else {
            ContextStatus::Informative
        }
    }

    /// First characters of the context, with an ellipsis when cut.
    pub fn preview(&self) -> String {
        let mut chars = self.text.chars();
        let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
        if chars.next().is_some() {
            format!("{}...", head)
        } else {
            head
        }
    }
}

/// Sanitizes documents and joins them into a [`ContextBlock`].
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    sanitizer: Sanitizer,
    separator: String,
}

impl ContextAssembler {
    pub fn new(sanitizer: Sanitizer, separator: impl Into<String>) -> Self {
        Self {
            sanitizer,
            separator: separator.into(),
        }
    }

    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    /// Build the context for one query's documents.
    ///
    /// Documents are taken in the order given, which is the retriever's rank
    /// order; the original documents are left untouched.
    pub fn assemble(
        &self,
        documents: &[RetrievedDocument],
    ) -> Result<ContextBlock, SanitizationError> {
        if documents.is_empty() {
            return Ok(ContextBlock::empty());
        }

        let segments = documents
            .iter()
            .map(|doc| -> Result<ContextSegment, SanitizationError> {
                Ok(ContextSegment {
                    rank: doc.rank,
                    source_id: doc.source_id.clone(),
                    text: self.sanitizer.sanitize(&doc.content)?,
                })
            })
            .collect::<Result<Vec<_>, SanitizationError>>()?;

        Ok(ContextBlock::from_segments(segments, &self.separator))
    }
}
