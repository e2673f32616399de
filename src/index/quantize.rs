//! Scalar int8 quantization for persisted vectors
//!
//! Each vector is mapped per component through `(v - min) * scale - 128`,
//! rounded to the nearest integer, where `scale = 255 / (max - min)`. The pair
//! `(min, scale)` is stored next to the codes. Reconstruction is lossy: the
//! error per component is at most `(max - min) / 510`.

/// A quantized vector with its reconstruction parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Quantized {
    pub min: f32,
    pub scale: f32,
    pub codes: Vec<i8>,
}

/// Compress a float vector to int8 codes
pub fn quantize(vector: &[f32]) -> Quantized {
    let (min, max) = vector
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });

    if vector.is_empty() {
        return Quantized {
            min: 0.0,
            scale: 1.0,
            codes: Vec::new(),
        };
    }

    let range = max - min;
    // A constant vector maps every component to -128 and reconstructs to min.
    // Any nonzero spread keeps its codes, however small the magnitudes.
    let spread = 255.0 / range;
    let scale = if range > 0.0 && spread.is_finite() { spread } else { 1.0 };

    let codes = vector
        .iter()
        .map(|&v| ((v - min) * scale - 128.0).round().clamp(-128.0, 127.0) as i8)
        .collect();

    Quantized { min, scale, codes }
}

/// Reconstruct an approximate float vector
pub fn dequantize(q: &Quantized) -> Vec<f32> {
    q.codes
        .iter()
        .map(|&c| (c as f32 + 128.0) / q.scale + q.min)
        .collect()
}
