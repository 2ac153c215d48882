use async_trait::async_trait;
use serde_json::Value;

use super::gemini::motivation_text;
use super::{Evaluation, EvaluationError, Evaluator, EvaluatorAction};

const BASE_SCORE: i32 = 50;
const MIN_MOTIVATION_CHARS: usize = 50;

const POSITIVE_WORDS: &[&str] = &[
    "amor",
    "cuidar",
    "familia",
    "compañía",
    "rescate",
    "hogar",
    "responsable",
    "cariño",
    "adoptar",
];
const COMMERCIAL_WORDS: &[&str] = &["criar", "vender", "regalar", "crías", "negocio", "dinero"];

/// Offline keyword analysis used when no model API key is configured.
///
/// Always routes to manual review; it only orders the review queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicEvaluator;

fn is_true(form: &Value, key: &str) -> bool {
    form.get(key).and_then(Value::as_bool) == Some(true)
}

fn is_false(form: &Value, key: &str) -> bool {
    form.get(key).and_then(Value::as_bool) == Some(false)
}

pub fn analyze(form: &Value) -> Evaluation {
    let mut score = BASE_SCORE;
    let mut flags: Vec<String> = Vec::new();
    let mut issues: Vec<&str> = Vec::new();
    let mut positives: Vec<&str> = Vec::new();

    let motivation = motivation_text(form, &["whyAdopt", "reason"])
        .unwrap_or_default()
        .to_lowercase();
    if motivation.chars().count() > MIN_MOTIVATION_CHARS {
        let motivation_score: i32 = POSITIVE_WORDS
            .iter()
            .filter(|word| motivation.contains(*word))
            .map(|_| 3)
            .sum();

        if COMMERCIAL_WORDS.iter().any(|word| motivation.contains(word)) {
            score = 15;
            issues.push("intención comercial detectada");
            flags.push("Riesgo Venta".into());
        }

        if motivation_score > 6 {
            score += 15;
            flags.push("Motivación Genuina".into());
            positives.push("motivación clara y positiva");
        } else if motivation_score > 0 {
            score += 8;
            positives.push("motivación presente");
        }
    }

    if is_true(form, "acceptsSterilization") {
        score += 20;
        flags.push("Pro-Esterilización".into());
        positives.push("acepta esterilización");
    } else if is_false(form, "acceptsSterilization") {
        score = 20;
        flags.push("Rechaza Esterilización".into());
        issues.push("no acepta esterilización obligatoria");
    }

    if is_true(form, "hasSpace") {
        score += 10;
        flags.push("Espacio Adecuado".into());
        positives.push("espacio suficiente");
    }

    if is_true(form, "hasTime") {
        score += 5;
        positives.push("disponibilidad de tiempo");
    }

    if is_true(form, "hasExperience") {
        score += 10;
        flags.push("Experiencia Previa".into());
        positives.push("experiencia con gatos");
    } else {
        flags.push("Primer Gato".into());
    }

    match form.get("livingSpace").and_then(Value::as_str) {
        Some("casa") => {
            flags.push("Casa".into());
            score += 5;
        }
        Some("apartamento") => flags.push("Apartamento".into()),
        _ => {}
    }

    // The sentence carries the raw total; only the stored score is clamped.
    let short_reason = if !issues.is_empty() {
        format!("Alerta: {}. Score {score}/100.", issues.join(", "))
    } else if !positives.is_empty() {
        let top = positives.iter().take(2).copied().collect::<Vec<_>>().join(", ");
        format!("Candidato con {top}. Score {score}/100. Requiere revisión.")
    } else {
        format!("Información incompleta. Score {score}/100. Revisión necesaria.")
    };

    Evaluation {
        action: EvaluatorAction::ManualReview,
        score: score.clamp(0, 100),
        short_reason,
        flags,
    }
}

#[async_trait]
impl Evaluator for HeuristicEvaluator {
    async fn evaluate(&self, form_responses: &Value) -> Result<Evaluation, EvaluationError> {
        Ok(analyze(form_responses))
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}
