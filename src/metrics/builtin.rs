//! Builtin metrics.
//!
//! The static provider list the registry is bootstrapped from at process
//! start. Judge-style metrics (LLM-scored) live behind the same registry
//! contract but are registered by the embedding application.

use super::{MetricError, MetricInput, MetricOutcome, MetricRegistry};

/// Registers every builtin metric.
pub fn register_all(registry: &mut MetricRegistry) {
    registry.register(
        "exact_match",
        "1 when the output matches the expected answer exactly (after trimming), else 0",
        &["output", "output_true"],
        exact_match,
    );
    registry.register(
        "output_length",
        "Number of words of the output",
        &["output"],
        output_length,
    );
    registry.register(
        "generation_time",
        "The time in seconds taken to generate the output",
        &["output"],
        generation_time,
    );
    registry.register(
        "nb_tokens_completion",
        "Number of tokens in the completion",
        &["output"],
        nb_tokens_completion,
    );
}

fn required_output(input: &MetricInput) -> Result<&str, MetricError> {
    input
        .output
        .as_deref()
        .ok_or_else(|| MetricError::MissingRequire("output".to_string()))
}

fn exact_match(input: &MetricInput) -> Result<MetricOutcome, MetricError> {
    let output = required_output(input)?;
    let expected = input
        .output_true
        .as_deref()
        .ok_or_else(|| MetricError::MissingRequire("output_true".to_string()))?;

    let candidate = output.trim_matches(|c: char| c.is_whitespace() || "\"'.".contains(c));
    let score = if candidate == expected.trim() { 1.0 } else { 0.0 };

    Ok(MetricOutcome::with_observation(
        score,
        format!("candidate: {}", candidate),
    ))
}

fn output_length(input: &MetricInput) -> Result<MetricOutcome, MetricError> {
    let output = required_output(input)?;
    Ok(MetricOutcome::score(
        output.split_whitespace().count() as f64
    ))
}

fn generation_time(input: &MetricInput) -> Result<MetricOutcome, MetricError> {
    // Telemetry may be absent (e.g. outputs supplied by the dataset); a
    // scoreless outcome is not an error.
    Ok(match input.metadata.generation_ms {
        Some(ms) => MetricOutcome::score(ms as f64 / 1000.0),
        None => MetricOutcome::empty(),
    })
}

fn nb_tokens_completion(input: &MetricInput) -> Result<MetricOutcome, MetricError> {
    Ok(match input.metadata.completion_tokens {
        Some(tokens) => MetricOutcome::score(tokens as f64),
        None => MetricOutcome::empty(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::GenerationMetadata;

    fn input(output: &str, output_true: Option<&str>) -> MetricInput {
        MetricInput {
            output: Some(output.to_string()),
            output_true: output_true.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_exact_match_scores() {
        let outcome = exact_match(&input("Paris", Some("Paris"))).unwrap();
        assert_eq!(outcome.score, Some(1.0));

        let outcome = exact_match(&input(" \"Paris\". ", Some("Paris"))).unwrap();
        assert_eq!(outcome.score, Some(1.0));

        let outcome = exact_match(&input("London", Some("Paris"))).unwrap();
        assert_eq!(outcome.score, Some(0.0));
    }

    #[test]
    fn test_exact_match_requires_ground_truth() {
        let err = exact_match(&input("Paris", None)).unwrap_err();
        assert!(matches!(err, MetricError::MissingRequire(ref f) if f == "output_true"));
    }

    #[test]
    fn test_output_length_counts_words() {
        let outcome = output_length(&input("one two  three", None)).unwrap();
        assert_eq!(outcome.score, Some(3.0));
    }

    #[test]
    fn test_telemetry_metrics_without_metadata() {
        let outcome = generation_time(&input("x", None)).unwrap();
        assert_eq!(outcome.score, None);

        let outcome = nb_tokens_completion(&input("x", None)).unwrap();
        assert_eq!(outcome.score, None);
    }

    #[test]
    fn test_telemetry_metrics_with_metadata() {
        let mut metric_input = input("x", None);
        metric_input.metadata = GenerationMetadata {
            generation_ms: Some(2500),
            prompt_tokens: Some(10),
            completion_tokens: Some(42),
            tool_calls: Some(0),
        };

        let outcome = generation_time(&metric_input).unwrap();
        assert_eq!(outcome.score, Some(2.5));

        let outcome = nb_tokens_completion(&metric_input).unwrap();
        assert_eq!(outcome.score, Some(42.0));
    }
}
