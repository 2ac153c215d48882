pub mod fallback;
pub mod gemini;
pub mod heuristic;
pub mod response;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use fallback::FallbackEvaluator;
pub use gemini::{GeminiConfig, GeminiEvaluator};
pub use heuristic::HeuristicEvaluator;
pub use response::parse_evaluation;

/// What the evaluator recommends. The evaluator never approves an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorAction {
    AutoReject,
    ManualReview,
}

impl EvaluatorAction {
    /// Accepts both the Spanish labels the prompt asks for and the English aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "RECHAZAR_AUTO" | "AUTO_REJECT" => Some(EvaluatorAction::AutoReject),
            "REVISION_MANUAL" | "MANUAL_REVIEW" => Some(EvaluatorAction::ManualReview),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluatorAction::AutoReject => "RECHAZAR_AUTO",
            EvaluatorAction::ManualReview => "REVISION_MANUAL",
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, EvaluatorAction::AutoReject)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub action: EvaluatorAction,
    /// 0..=100
    pub score: i32,
    pub short_reason: String,
    pub flags: Vec<String>,
}

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("evaluator request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("evaluator returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("evaluator response has no text content")]
    MissingContent,
    #[error("evaluator response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid evaluation: {0}")]
    Invalid(String),
    #[error("evaluator unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Score one application from its raw form answers.
    async fn evaluate(&self, form_responses: &Value) -> Result<Evaluation, EvaluationError>;

    fn name(&self) -> &'static str;
}
