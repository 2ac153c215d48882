use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::{Evaluation, EvaluationError, Evaluator};

/// Tries `primary` and answers from `secondary` when it fails, so a model outage still
/// yields a scored manual-review verdict.
pub struct FallbackEvaluator {
    primary: Arc<dyn Evaluator>,
    secondary: Arc<dyn Evaluator>,
}

impl FallbackEvaluator {
    pub fn new(primary: Arc<dyn Evaluator>, secondary: Arc<dyn Evaluator>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl Evaluator for FallbackEvaluator {
    async fn evaluate(&self, form_responses: &Value) -> Result<Evaluation, EvaluationError> {
        match self.primary.evaluate(form_responses).await {
            Ok(evaluation) => Ok(evaluation),
            Err(err) => {
                warn!(
                    primary = self.primary.name(),
                    secondary = self.secondary.name(),
                    error = %err,
                    "primary evaluator failed; using secondary"
                );
                self.secondary.evaluate(form_responses).await
            }
        }
    }

    fn name(&self) -> &'static str {
        self.primary.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::heuristic::{self, HeuristicEvaluator};
    use crate::evaluator::{EvaluatorAction, GeminiConfig, GeminiEvaluator};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixed {
        result: fn() -> Result<Evaluation, EvaluationError>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(result: fn() -> Result<Evaluation, EvaluationError>) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Evaluator for Fixed {
        async fn evaluate(&self, _: &Value) -> Result<Evaluation, EvaluationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn rejection() -> Result<Evaluation, EvaluationError> {
        Ok(Evaluation {
            action: EvaluatorAction::AutoReject,
            score: 12,
            short_reason: "Intención de venta".into(),
            flags: vec!["Riesgo Venta".into()],
        })
    }

    fn overloaded() -> Result<Evaluation, EvaluationError> {
        Err(EvaluationError::Upstream {
            status: 503,
            body: "overloaded".into(),
        })
    }

    fn positive_form() -> Value {
        json!({
            "whyAdopt": "Queremos darle amor y un hogar responsable, con la compañía de toda la familia",
            "acceptsSterilization": true,
            "hasSpace": true,
            "hasTime": true,
            "hasExperience": true,
        })
    }

    #[tokio::test]
    async fn primary_answer_is_returned_untouched() {
        let primary = Fixed::new(rejection);
        let secondary = Fixed::new(overloaded);
        let chain = FallbackEvaluator::new(primary.clone(), secondary.clone());

        let evaluation = chain.evaluate(&json!({})).await.unwrap();
        assert_eq!(evaluation.action, EvaluatorAction::AutoReject);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn primary_failure_is_answered_by_secondary() {
        let primary = Fixed::new(overloaded);
        let chain = FallbackEvaluator::new(primary.clone(), Arc::new(HeuristicEvaluator));

        let form = positive_form();
        let evaluation = chain.evaluate(&form).await.unwrap();
        assert_eq!(evaluation, heuristic::analyze(&form));
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn secondary_error_is_propagated() {
        let chain = FallbackEvaluator::new(Fixed::new(overloaded), Fixed::new(overloaded));
        let err = chain.evaluate(&json!({})).await.unwrap_err();
        assert!(matches!(err, EvaluationError::Upstream { status: 503, .. }));
    }

    #[tokio::test]
    async fn unreachable_gemini_falls_back_to_heuristic_score() {
        let gemini = GeminiEvaluator::new(GeminiConfig {
            api_key: "test-key".into(),
            model: "gemini-1.5-flash".into(),
            endpoint: "http://127.0.0.1:1/v1beta".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let chain = FallbackEvaluator::new(Arc::new(gemini), Arc::new(HeuristicEvaluator));

        let form = positive_form();
        let evaluation = chain.evaluate(&form).await.unwrap();
        assert_eq!(evaluation.action, EvaluatorAction::ManualReview);
        assert_eq!(evaluation.score, heuristic::analyze(&form).score);
        assert!(evaluation.flags.contains(&"Pro-Esterilización".to_string()));
        assert_eq!(chain.name(), "gemini");
    }
}
