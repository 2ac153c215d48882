use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::{Evaluation, EvaluationError, Evaluator, parse_evaluation};

const SYSTEM_PROMPT: &str = r#"Eres evaluador de adopciones de gatos. Analiza RÁPIDAMENTE y devuelve JSON.

NUNCA apruebas. Solo: RECHAZAR_AUTO o REVISION_MANUAL

RECHAZAR_AUTO (0-40 puntos):
- No acepta esterilización
- Intención de criar/vender
- Lenguaje violento/negligente
- Riesgo evidente

REVISION_MANUAL (41-100):
- Acepta esterilización: +20 puntos
- Motivación genuina (LEE whyAdopt/reason): +15 puntos
- Espacio adecuado: +10 puntos
- Experiencia previa: +10 puntos
- Disponibilidad de tiempo: +5 puntos
- Vivienda segura: +5 puntos

ANALIZA EL TEXTO DE MOTIVACIÓN:
- ¿Menciona amor/cuidado genuino? → más puntos
- ¿Habla de compañía/familia? → más puntos
- ¿Es vago o poco serio? → menos puntos
- ¿Menciona crianza/venta? → RECHAZAR_AUTO

FLAGS: "Pro-Esterilización", "Experiencia Previa", "Primer Gato", "Casa Segura", "Motivación Genuina", "Riesgo Venta", "Riesgo Negligencia"

JSON:
{
  "accion": "RECHAZAR_AUTO" | "REVISION_MANUAL",
  "puntaje": 0-100,
  "razon_corta": "1 oración con razón principal y score",
  "banderas": ["strings"]
}"#;

const NOT_PROVIDED: &str = "No proporcionado";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    /// Base URL up to and including the API version, e.g. `.../v1beta`.
    pub endpoint: String,
    pub timeout: Duration,
}

impl GeminiConfig {
    pub fn generate_content_url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.endpoint.trim_end_matches('/'),
            self.model
        )
    }
}

pub struct GeminiEvaluator {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiEvaluator {
    pub fn new(config: GeminiConfig) -> Result<Self, EvaluationError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

fn render_field(form: &Value, key: &str) -> String {
    match form.get(key) {
        None | Some(Value::Null) => NOT_PROVIDED.to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

/// First non-empty text among `keys`.
pub(crate) fn motivation_text<'a>(form: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| form.get(*key).and_then(Value::as_str))
        .find(|text| !text.trim().is_empty())
}

pub(crate) fn build_user_prompt(form: &Value) -> String {
    let motivation = motivation_text(form, &["whyAdopt", "reason"]).unwrap_or(NOT_PROVIDED);

    format!(
        "SOLICITUD:\n\n\
         MOTIVACIÓN (LEE ESTO PRIMERO): \"{motivation}\"\n\n\
         Acepta esterilización: {}\n\
         Experiencia con gatos: {}\n\
         Espacio suficiente: {}\n\
         Tiempo disponible: {}\n\
         Vivienda: {}\n\n\
         Responde SOLO JSON.",
        render_field(form, "acceptsSterilization"),
        render_field(form, "hasExperience"),
        render_field(form, "hasSpace"),
        render_field(form, "hasTime"),
        render_field(form, "livingSpace"),
    )
}

fn request_body(form: &Value) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [
                { "text": SYSTEM_PROMPT },
                { "text": build_user_prompt(form) },
            ],
        }],
        "generationConfig": {
            "temperature": 0.1,
            "topP": 0.8,
            "topK": 20,
            "maxOutputTokens": 300,
            "responseMimeType": "application/json",
        },
    })
}

fn candidate_text(response: &Value) -> Result<&str, EvaluationError> {
    response
        .pointer("/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
        .ok_or(EvaluationError::MissingContent)
}

#[async_trait]
impl Evaluator for GeminiEvaluator {
    async fn evaluate(&self, form_responses: &Value) -> Result<Evaluation, EvaluationError> {
        let url = self.config.generate_content_url();
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request_body(form_responses))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EvaluationError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = resp.json().await?;
        let text = candidate_text(&payload)?;
        debug!(model = %self.config.model, response_len = text.len(), "gemini evaluation received");

        parse_evaluation(text)
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}
