//! Capped, most-recent-first history of completed generations.

use serde::{Deserialize, Serialize};

use crate::events::{CompletionMessage, ImageField};
use crate::types::{first_non_blank, lenient_id, parse_timestamp, Timestamp};

/// Hard upper bound on the history limit.
pub const MAX_RESULTS: usize = 100;

/// History limit used when none (or an invalid one) is configured.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// A completed generation. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub id: String,
    pub job_id: String,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub steps: Option<u32>,
    pub seed: Option<i64>,
    pub image_url: Option<String>,
    pub created_at: Timestamp,
}

/// Loosely-typed result payload, e.g. from the recent-results endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultInput {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(default, alias = "jobId", deserialize_with = "lenient_id")]
    pub job_id: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, alias = "negativePrompt")]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default, alias = "imageUrl", alias = "image", alias = "images")]
    pub image_url: Option<ImageField>,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<String>,
}

impl ResultInput {
    /// Normalise into a stored record. The id falls back to the job id;
    /// a payload with neither is rejected.
    pub fn normalize(self) -> Option<GenerationResult> {
        let id = first_non_blank([self.id.as_deref(), self.job_id.as_deref()])?;
        let job_id = first_non_blank([self.job_id.as_deref()]).unwrap_or_else(|| id.clone());
        Some(GenerationResult {
            id,
            job_id,
            prompt: self.prompt,
            negative_prompt: self.negative_prompt,
            width: self.width,
            height: self.height,
            steps: self.steps,
            seed: self.seed,
            image_url: self.image_url.as_ref().and_then(ImageField::first).map(String::from),
            created_at: self
                .created_at
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(chrono::Utc::now),
        })
    }
}

/// Clamp a requested history limit into `1..=MAX_RESULTS`.
///
/// Non-positive requests fall back to [`DEFAULT_HISTORY_LIMIT`].
pub fn clamp_history_limit(requested: i64) -> usize {
    if requested <= 0 {
        return DEFAULT_HISTORY_LIMIT;
    }
    usize::try_from(requested).unwrap_or(MAX_RESULTS).clamp(1, MAX_RESULTS)
}

/// Map a completion event to a result record.
///
/// Uses the first image when the backend returns several. Returns
/// `None` when the event names neither a result nor a job.
pub fn create_result_from_completion(message: &CompletionMessage) -> Option<GenerationResult> {
    let job_id = message.identifier();
    let id = first_non_blank([message.result_id.as_deref(), job_id.as_deref()])?;
    Some(GenerationResult {
        job_id: job_id.unwrap_or_else(|| id.clone()),
        id,
        prompt: message.params.prompt.clone(),
        negative_prompt: message.params.negative_prompt.clone(),
        width: message.params.width,
        height: message.params.height,
        steps: message.params.steps,
        seed: message.params.seed,
        image_url: message
            .images
            .as_ref()
            .and_then(ImageField::first)
            .map(String::from),
        created_at: message
            .created_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(chrono::Utc::now),
    })
}

/// Most-recent-first result list bounded by the history limit.
#[derive(Debug)]
pub struct ResultHistory {
    results: Vec<GenerationResult>,
    history_limit: usize,
}

impl Default for ResultHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl ResultHistory {
    pub fn new(history_limit: usize) -> Self {
        Self {
            results: Vec::new(),
            history_limit: history_limit.clamp(1, MAX_RESULTS),
        }
    }

    pub fn results(&self) -> &[GenerationResult] {
        &self.results
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Normalise and prepend a result. Returns the stored record.
    pub fn add_result(&mut self, input: ResultInput) -> Option<GenerationResult> {
        let Some(result) = input.normalize() else {
            tracing::debug!("Result without id or job id ignored");
            return None;
        };
        self.insert(result.clone());
        Some(result)
    }

    /// Prepend an already-normalised result. A result reusing an id
    /// replaces the older entry.
    pub fn insert(&mut self, result: GenerationResult) {
        self.results.retain(|r| r.id != result.id);
        self.results.insert(0, result);
        self.truncate();
    }

    /// Replace the history. The list is taken as most-recent-first.
    pub fn set_results(&mut self, inputs: Vec<ResultInput>) {
        let mut seen = std::collections::HashSet::new();
        self.results = inputs
            .into_iter()
            .filter_map(ResultInput::normalize)
            .filter(|r| seen.insert(r.id.clone()))
            .collect();
        self.truncate();
    }

    /// Remove a result by id. Returns `true` if one was removed.
    pub fn remove_result(&mut self, id: &str) -> bool {
        let before = self.results.len();
        self.results.retain(|r| r.id != id);
        self.results.len() != before
    }

    /// Change the limit and truncate immediately. Returns the effective limit.
    pub fn set_history_limit(&mut self, requested: i64) -> usize {
        self.history_limit = clamp_history_limit(requested);
        self.truncate();
        self.history_limit
    }

    /// Float variant for limits coming from untyped sources. Non-finite
    /// values fall back to the default; fractions are floored.
    pub fn set_history_limit_f64(&mut self, requested: f64) -> usize {
        if !requested.is_finite() {
            return self.set_history_limit(0);
        }
        self.set_history_limit(requested.floor() as i64)
    }

    fn truncate(&mut self) {
        self.results.truncate(self.history_limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str) -> ResultInput {
        ResultInput {
            id: Some(id.into()),
            job_id: Some(format!("job-{id}")),
            ..Default::default()
        }
    }

    #[test]
    fn history_cap_keeps_most_recent() {
        let mut history = ResultHistory::default();
        history.set_history_limit(3);
        for id in ["1", "2", "3", "4", "5"] {
            history.add_result(result(id));
        }
        let ids: Vec<&str> = history.results().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["5", "4", "3"]);
    }

    #[test]
    fn lowering_limit_truncates_retroactively() {
        let mut history = ResultHistory::new(10);
        for id in ["a", "b", "c", "d"] {
            history.add_result(result(id));
        }
        assert_eq!(history.set_history_limit(2), 2);
        assert_eq!(history.results().len(), 2);
        assert_eq!(history.results()[0].id, "d");
    }

    #[test]
    fn limit_is_clamped() {
        let mut history = ResultHistory::default();
        assert_eq!(history.set_history_limit(0), DEFAULT_HISTORY_LIMIT);
        assert_eq!(history.set_history_limit(-7), DEFAULT_HISTORY_LIMIT);
        assert_eq!(history.set_history_limit(5_000), MAX_RESULTS);
        assert_eq!(history.set_history_limit_f64(f64::INFINITY), DEFAULT_HISTORY_LIMIT);
        assert_eq!(history.set_history_limit_f64(f64::NAN), DEFAULT_HISTORY_LIMIT);
        assert_eq!(history.set_history_limit_f64(4.9), 4);
    }

    #[test]
    fn missing_created_at_defaults_to_now() {
        let before = chrono::Utc::now();
        let stored = ResultHistory::default().add_result(result("x")).unwrap();
        assert!(stored.created_at >= before);
    }

    #[test]
    fn duplicate_ids_replace_older_entry() {
        let mut history = ResultHistory::default();
        history.add_result(result("a"));
        history.add_result(result("b"));
        history.add_result(result("a"));
        let ids: Vec<&str> = history.results().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn set_results_normalises_and_truncates() {
        let mut history = ResultHistory::new(2);
        history.set_results(vec![
            result("1"),
            ResultInput::default(),
            result("2"),
            result("3"),
        ]);
        let ids: Vec<&str> = history.results().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn remove_result_by_id() {
        let mut history = ResultHistory::default();
        history.add_result(result("a"));
        assert!(history.remove_result("a"));
        assert!(!history.remove_result("a"));
        assert!(history.results().is_empty());
    }

    #[test]
    fn completion_picks_first_image() {
        let message: CompletionMessage = serde_json::from_str(
            r#"{"jobId":"b-1","images":["first.png","second.png"],"prompt":"a lighthouse","seed":7}"#,
        )
        .unwrap();
        let result = create_result_from_completion(&message).unwrap();
        assert_eq!(result.id, "b-1");
        assert_eq!(result.job_id, "b-1");
        assert_eq!(result.image_url.as_deref(), Some("first.png"));
        assert_eq!(result.prompt.as_deref(), Some("a lighthouse"));
        assert_eq!(result.seed, Some(7));
    }

    #[test]
    fn completion_without_ids_yields_nothing() {
        assert!(create_result_from_completion(&CompletionMessage::default()).is_none());
    }
}
