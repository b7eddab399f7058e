use serde::{Deserialize, Serialize};

/// Batched request for Ollama's `/api/embed` endpoint.
#[derive(Debug, Serialize)]
pub(crate) struct EmbeddingRequest<'a> {
    pub model: &'a str,
    pub input: Vec<String>,
    pub truncate: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddingResponse {
    pub embeddings: Vec<Vec<f32>>,
}

/// Clip `text` to at most `max_chars` characters, warning when anything is
/// dropped. Oversized inputs must never fail the embedding call.
pub fn truncate_for_embedding(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            tracing::warn!(
                "Embedding input truncated from {} to {} characters",
                text.chars().count(),
                max_chars
            );
            text[..cut].to_string()
        }
        None => text.to_string(),
    }
}

/// Cosine similarity between two embedding vectors.
///
/// Returns 0 when either vector has zero magnitude. Callers are expected to
/// have checked that the lengths agree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}
