use super::error::TranscribeError;

/// Outcome of transcribing one chunk
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub index: usize,
    pub outcome: Result<String, TranscribeError>,
}

impl ChunkResult {
    pub fn text(&self) -> Option<&str> {
        self.outcome.as_deref().ok()
    }

    pub fn error(&self) -> Option<&TranscribeError> {
        self.outcome.as_ref().err()
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Join chunk texts in index order.
///
/// Every index in `0..chunk_count` contributes a segment; missing or failed
/// chunks contribute an empty one so the surrounding text keeps its place.
/// Returns `None` when no chunk produced any text.
pub fn reassemble(chunk_count: usize, results: &[ChunkResult]) -> Option<String> {
    let mut segments = vec![""; chunk_count];
    for result in results {
        if let (Some(slot), Some(text)) = (segments.get_mut(result.index), result.text()) {
            *slot = text.trim();
        }
    }

    if segments.iter().all(|s| s.is_empty()) {
        return None;
    }

    Some(segments.join(" ").trim().to_string())
}

/// Indices in `0..chunk_count` without a successful result
pub fn missing_indices(chunk_count: usize, results: &[ChunkResult]) -> Vec<usize> {
    let mut ok = vec![false; chunk_count];
    for result in results.iter().filter(|r| r.is_success()) {
        if let Some(slot) = ok.get_mut(result.index) {
            *slot = true;
        }
    }
    ok.iter()
        .enumerate()
        .filter(|(_, done)| !**done)
        .map(|(i, _)| i)
        .collect()
}
