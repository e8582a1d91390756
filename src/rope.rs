//! RoPE frequency tables (§3): precomputed `cos`/`sin` tables sized
//! `[max_seq_len, head_dim/2]`, uploaded once and referenced by every
//! layer's attention stage. A second table exists when `rope_local_theta`
//! is set; layers tagged `sliding_attention` read it instead.

use crate::config::{RopeConfig, RopeScaling};

pub struct RopeTable {
    pub cos: wgpu::Buffer,
    pub sin: wgpu::Buffer,
    pub head_dim: u32,
    pub max_seq_len: u32,
}

fn yarn_correction_range(beta_fast: f32, beta_slow: f32, dim: u32, theta: f32, original_max_pos: u32) -> (f32, f32) {
    let find_dim = |num_rotations: f32| -> f32 {
        (dim as f32 * (original_max_pos as f32 / (num_rotations * 2.0 * std::f32::consts::PI)).ln())
            / (2.0 * theta.ln())
    };
    let low = find_dim(beta_fast).floor().max(0.0);
    let high = find_dim(beta_slow).ceil().min(dim as f32 - 1.0);
    (low, high)
}

/// Computes inverse frequencies for each of the `head_dim/2` rotation
/// pairs, applying linear or YaRN scaling per `rope.rope_scaling_type`.
fn inv_frequencies(cfg: &RopeConfig, theta: f32, head_dim: u32) -> Vec<f32> {
    let half = (head_dim / 2) as usize;
    let base: Vec<f32> = (0..half)
        .map(|i| 1.0 / theta.powf((2 * i) as f32 / head_dim as f32))
        .collect();

    match cfg.scaling {
        None => base,
        Some(RopeScaling::Linear { factor }) => base.into_iter().map(|f| f / factor).collect(),
        Some(RopeScaling::Yarn { factor, beta_fast, beta_slow, original_max_pos }) => {
            let (low, high) = yarn_correction_range(beta_fast, beta_slow, head_dim, theta, original_max_pos);
            let denom = (high - low).max(1e-3);
            base.iter()
                .enumerate()
                .map(|(i, &f)| {
                    // Linear ramp between "extrapolate" (full freq) and
                    // "interpolate" (scaled freq) across the correction range.
                    let ramp = ((i as f32 - low) / denom).clamp(0.0, 1.0);
                    let interp = f / factor;
                    interp * ramp + f * (1.0 - ramp)
                })
                .collect()
        }
    }
}

/// Builds the `[max_seq_len, head_dim/2]` cos/sin tables on the host and
/// uploads them once. `local` selects `rope_local_theta` over `rope_theta`
/// when both are requested for the same model (Gemma-style interleaved
/// global/local attention).
pub fn build_table(device: &wgpu::Device, queue: &wgpu::Queue, cfg: &RopeConfig, head_dim: u32, max_seq_len: u32, local: bool) -> RopeTable {
    let theta = if local { cfg.local_theta.unwrap_or(cfg.theta) } else { cfg.theta };
    let inv_freq = inv_frequencies(cfg, theta, head_dim);
    let half = inv_freq.len();

    let mut cos = vec![0f32; max_seq_len as usize * half];
    let mut sin = vec![0f32; max_seq_len as usize * half];
    for pos in 0..max_seq_len as usize {
        for (i, &f) in inv_freq.iter().enumerate() {
            let angle = pos as f32 * f;
            cos[pos * half + i] = angle.cos();
            sin[pos * half + i] = angle.sin();
        }
    }

    let mk = |data: &[f32], tag: &str| {
        let buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("rope-{tag}")),
            size: (data.len() * 4) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(&buf, 0, bytemuck::cast_slice(data));
        buf
    };

    RopeTable { cos: mk(&cos, "cos"), sin: mk(&sin, "sin"), head_dim, max_seq_len }
}

/// Host-side reference rotation of one `(x0, x1)` pair by `(cos, sin)`,
/// matching what the GPU RoPE kernel does per dimension-pair. Exposed so
/// the round-trip property test (§8) can exercise the exact math without
/// a GPU.
pub fn rotate_pair(x0: f32, x1: f32, cos: f32, sin: f32) -> (f32, f32) {
    (x0 * cos - x1 * sin, x0 * sin + x1 * cos)
}

pub fn rotate_pair_inverse(y0: f32, y1: f32, cos: f32, sin: f32) -> (f32, f32) {
    // Inverse rotation is rotation by `-angle`: cos is even, sin is odd.
    rotate_pair(y0, y1, cos, -sin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rope_round_trip_f32() {
        let angles = [0.0f32, 0.3, 1.2, 2.7, std::f32::consts::PI];
        for &angle in &angles {
            let (cos, sin) = (angle.cos(), angle.sin());
            let (x0, x1) = (1.7f32, -0.4f32);
            let (y0, y1) = rotate_pair(x0, x1, cos, sin);
            let (rx0, rx1) = rotate_pair_inverse(y0, y1, cos, sin);
            assert!((rx0 - x0).abs() < 1e-3, "x0 round trip: {rx0} vs {x0}");
            assert!((rx1 - x1).abs() < 1e-3, "x1 round trip: {rx1} vs {x1}");
        }
    }

    #[test]
    fn linear_scaling_divides_frequency() {
        let base_cfg = RopeConfig { theta: 10000.0, local_theta: None, scaling: None };
        let scaled_cfg = RopeConfig { theta: 10000.0, local_theta: None, scaling: Some(RopeScaling::Linear { factor: 2.0 }) };
        let base = inv_frequencies(&base_cfg, base_cfg.theta, 8);
        let scaled = inv_frequencies(&scaled_cfg, scaled_cfg.theta, 8);
        for (b, s) in base.iter().zip(scaled.iter()) {
            assert!((s - b / 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn yarn_interpolates_between_extremes() {
        let cfg = RopeConfig {
            theta: 10000.0,
            local_theta: None,
            scaling: Some(RopeScaling::Yarn { factor: 4.0, beta_fast: 32.0, beta_slow: 1.0, original_max_pos: 4096 }),
        };
        let freqs = inv_frequencies(&cfg, cfg.theta, 64);
        assert_eq!(freqs.len(), 32);
        assert!(freqs.iter().all(|f| f.is_finite() && *f >= 0.0));
    }
}
