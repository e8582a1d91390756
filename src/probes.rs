//! Probes / Trace (C10): optional numeric inspection at named stages
//! (§4.9). No-ops whenever a recorder is active, since reading back would
//! force a sync; callers only probe on the non-recorded (prefill) path.

#[derive(Clone, Debug, Default)]
pub struct ProbeConfig {
    pub stages: Vec<String>,
    pub layers: Option<Vec<u32>>,
    pub tokens: Option<Vec<u32>>,
    pub dims: usize,
}

impl ProbeConfig {
    pub fn wants(&self, stage: &str, layer: Option<u32>) -> bool {
        if !self.stages.iter().any(|s| s == stage) {
            return false;
        }
        match (layer, &self.layers) {
            (Some(l), Some(allowed)) => allowed.contains(&l),
            _ => true,
        }
    }
}

pub struct Probes<'a> {
    cfg: &'a ProbeConfig,
    device: &'a wgpu::Device,
}

impl<'a> Probes<'a> {
    pub fn new(cfg: &'a ProbeConfig, device: &'a wgpu::Device) -> Self {
        Probes { cfg, device }
    }

    /// Reads back the first `cfg.dims` elements of `buffer` and logs them
    /// at `stage`, skipping entirely when a recorder is mid-flight (the
    /// caller is expected not to call this from within a recorded step).
    pub fn sample(&self, stage: &str, layer: Option<u32>, buffer: &wgpu::Buffer, recorder_active: bool) {
        if recorder_active || !self.cfg.wants(stage, layer) {
            return;
        }
        let count = self.cfg.dims.min((buffer.size() / 4) as usize);
        let slice = buffer.slice(0..(count as u64 * 4));
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);
        if rx.recv().ok().and_then(std::result::Result::ok).is_none() {
            log::debug!("probe[{stage}] layer={layer:?}: readback denied");
            return;
        }
        let data = slice.get_mapped_range();
        let values: &[f32] = bytemuck::cast_slice(&data);
        log::debug!("probe[{stage}] layer={layer:?}: {:?}", &values[..count.min(values.len())]);
        drop(data);
        buffer.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wants_respects_stage_and_layer_filters() {
        let cfg = ProbeConfig { stages: vec!["logits".to_string()], layers: Some(vec![3, 5]), tokens: None, dims: 8 };
        assert!(cfg.wants("logits", Some(3)));
        assert!(!cfg.wants("logits", Some(4)));
        assert!(!cfg.wants("q_proj", Some(3)));
        assert!(cfg.wants("logits", None));
    }
}
