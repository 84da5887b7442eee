use crate::config::SchemaPolicy;

/// Cosine similarity in `[-1, 1]`.
///
/// Returns 0 for empty or zero-magnitude vectors, for mismatched lengths and
/// for any non-finite intermediate. Never NaN.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    finish(dot, norm_a, norm_b)
}

/// Cosine similarity honoring the cross-schema comparison policy.
pub fn compare(query: &[f64], stored: &[f64], policy: SchemaPolicy) -> f64 {
    if query.len() == stored.len() {
        return cosine_similarity(query, stored);
    }
    match policy {
        SchemaPolicy::Strict => 0.0,
        SchemaPolicy::PadShorter => {
            // Positions past the shorter vector contribute only to the norm
            // of the longer one.
            let mut dot = 0.0;
            let mut norm_a = 0.0;
            let mut norm_b = 0.0;
            for i in 0..query.len().max(stored.len()) {
                let x = query.get(i).copied().unwrap_or(0.0);
                let y = stored.get(i).copied().unwrap_or(0.0);
                dot += x * y;
                norm_a += x * x;
                norm_b += y * y;
            }
            finish(dot, norm_a, norm_b)
        }
    }
}

fn finish(dot: f64, norm_a: f64, norm_b: f64) -> f64 {
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON || !denom.is_finite() {
        return 0.0;
    }
    let sim = dot / denom;
    if sim.is_finite() {
        sim.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}
