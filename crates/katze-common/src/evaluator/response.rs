use serde_json::{Map, Value};

use super::{Evaluation, EvaluationError, EvaluatorAction};

/// Cut the outermost `{...}` out of model output that may be wrapped in markdown or prose.
fn extract_json_object(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text,
    }
}

/// Spanish key first, English alias second.
fn pick<'a>(object: &'a Map<String, Value>, spanish: &str, english: &str) -> Option<&'a Value> {
    object
        .get(spanish)
        .filter(|value| !value.is_null())
        .or_else(|| object.get(english).filter(|value| !value.is_null()))
}

/// Normalise and validate the evaluator's raw text into an [`Evaluation`].
pub fn parse_evaluation(text: &str) -> Result<Evaluation, EvaluationError> {
    let value: Value = serde_json::from_str(extract_json_object(text))?;
    let object = value
        .as_object()
        .ok_or_else(|| EvaluationError::Invalid("response is not a JSON object".into()))?;

    let action = pick(object, "accion", "action")
        .and_then(Value::as_str)
        .and_then(EvaluatorAction::parse)
        .ok_or_else(|| EvaluationError::Invalid("missing or unknown action".into()))?;

    let score = pick(object, "puntaje", "score")
        .and_then(Value::as_f64)
        .filter(|score| (0.0..=100.0).contains(score))
        .ok_or_else(|| EvaluationError::Invalid("score must be a number in 0..=100".into()))?;

    let short_reason = pick(object, "razon_corta", "short_reason")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|reason| !reason.is_empty())
        .ok_or_else(|| EvaluationError::Invalid("short_reason must be a non-empty string".into()))?
        .to_string();

    let flags = pick(object, "banderas", "flags")
        .and_then(Value::as_array)
        .ok_or_else(|| EvaluationError::Invalid("flags must be an array".into()))?
        .iter()
        .map(|flag| {
            flag.as_str()
                .map(str::to_string)
                .ok_or_else(|| EvaluationError::Invalid("flags must contain strings".into()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Evaluation {
        action,
        score: score.round() as i32,
        short_reason,
        flags,
    })
}
