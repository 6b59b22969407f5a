use crate::constants::TRUNCATION_MARKER;
use crate::domain::ResourcePolicy;
use crate::runner::traits::RunResult;

/// Applies the output-size ceiling to both streams of a finished run.
pub fn finalize(mut result: RunResult, policy: &ResourcePolicy) -> RunResult {
    let max = policy.max_output_bytes as usize;
    result.stdout = truncate_stream(result.stdout, max);
    result.stderr = truncate_stream(result.stderr, max);
    result
}

/// Keeps the first `max` bytes of a stream and appends the truncation
/// marker. Never cuts inside a multi-byte character. A stream that fits, or
/// that already carries the marker, is returned unchanged.
pub fn truncate_stream(stream: String, max: usize) -> String {
    if stream.len() <= max || stream.ends_with(TRUNCATION_MARKER) {
        return stream;
    }

    let mut cut = max;
    while cut > 0 && !stream.is_char_boundary(cut) {
        cut -= 1;
    }

    let mut truncated = String::with_capacity(cut + TRUNCATION_MARKER.len());
    truncated.push_str(&stream[..cut]);
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}
