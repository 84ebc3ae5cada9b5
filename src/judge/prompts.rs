//! Prompts sent to the judge.

/// Collection of prompts used for judging retrieval.
pub struct Prompts;

impl Prompts {
    /// System prompt establishing the judge role.
    pub fn system_retrieval_judge() -> &'static str {
        r#"You are an impartial evaluator of search systems. You rate how well a set of retrieved passages supports answering a user's question. You never answer the question yourself and you judge only the passages you are given."#
    }

    /// Rating prompt for one query and its assembled context.
    ///
    /// Query and context are inserted verbatim.
    pub fn retrieval_judge(query: &str, context: &str) -> String {
        format!(
            r#"Rate the retrieved context for the question below.

Scale:
1 - The context is irrelevant to the question.
2 - The context touches the topic but does not help answer the question.
3 - The context is partially relevant; key information is missing.
4 - The context is relevant and mostly sufficient to answer the question.
5 - The context is highly relevant and fully sufficient to answer the question.

Question:
{query}

Retrieved context:
<context>
{context}
</context>

Respond in JSON format:
{{
    "score": <integer 1-5>,
    "rationale": "<one or two sentences explaining the score>"
}}

Respond with only the JSON, no other text."#
        )
    }

    /// Minimal prompt used to verify the judge deployment answers.
    pub fn connection_check() -> &'static str {
        "Say 'hello' and nothing else."
    }
}
