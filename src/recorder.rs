//! Command Recorder (C2): accumulates compute/copy commands into one
//! `wgpu::CommandEncoder`, submits once, and releases every transient
//! buffer only after the device signals the submission is complete.
//!
//! Grounded on `webgpu::CommandEncoder`/`PassEncoder` for the
//! builder shape, and on `webgpu::TimingQueryPool` for the optional
//! per-pass timestamp queries.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pool::BufferPool;

/// A point in the device queue's submission order. Waiting on it
/// guarantees every command recorded before the matching `submit()`
/// has finished executing.
#[derive(Clone, Debug)]
pub struct SyncPoint {
    index: wgpu::SubmissionIndex,
}

enum RecorderState {
    Recording { encoder: wgpu::CommandEncoder },
    Finalized,
}

pub struct CommandRecorder {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pool: Arc<BufferPool>,
    state: RecorderState,
    deferred: Vec<wgpu::Buffer>,
    name: String,
    timing: Option<TimingScope>,
}

struct TimingScope {
    query_set: wgpu::QuerySet,
    resolve_buffer: wgpu::Buffer,
    readback_buffer: wgpu::Buffer,
    pass_names: Vec<String>,
    pass_count: u32,
    max_passes: u32,
}

impl CommandRecorder {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, pool: Arc<BufferPool>, name: impl Into<String>) -> Self {
        let name = name.into();
        let encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(&name) });
        CommandRecorder {
            device,
            queue,
            pool,
            state: RecorderState::Recording { encoder },
            deferred: Vec::new(),
            name,
            timing: None,
        }
    }

    /// Enables per-pass timestamp queries for this recorder's lifetime.
    /// `max_passes` bounds the query set size (mirrors `MAX_TIMING_PASSES`
    /// in `webgpu::TimingQueryPool`).
    pub fn enable_profiling(&mut self, max_passes: u32) {
        let query_set = self.device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("recorder-timing"),
            ty: wgpu::QueryType::Timestamp,
            count: max_passes * 2,
        });
        let buffer_size = (max_passes * 2 * 8) as u64;
        let resolve_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("recorder-timing-resolve"),
            size: buffer_size,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("recorder-timing-readback"),
            size: buffer_size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        self.timing = Some(TimingScope {
            query_set,
            resolve_buffer,
            readback_buffer,
            pass_names: Vec::new(),
            pass_count: 0,
            max_passes,
        });
    }

    fn encoder_mut(&mut self) -> Result<&mut wgpu::CommandEncoder> {
        match &mut self.state {
            RecorderState::Recording { encoder } => Ok(encoder),
            RecorderState::Finalized => Err(Error::RecorderFinalized),
        }
    }

    /// Begins a compute pass, optionally wrapped with a timestamp-write
    /// pair when profiling is enabled.
    pub fn begin_compute_pass(&mut self, label: &str) -> Result<wgpu::ComputePass<'_>> {
        let query_index = if let Some(timing) = &mut self.timing {
            if timing.pass_count >= timing.max_passes {
                log::warn!("recorder '{}': exceeded max timing passes, pass '{}' unrecorded", self.name, label);
                None
            } else {
                let query_index = timing.pass_count * 2;
                timing.pass_names.push(label.to_string());
                timing.pass_count += 1;
                Some(query_index)
            }
        } else {
            None
        };

        let writes = query_index.map(|index| wgpu::ComputePassTimestampWrites {
            query_set: &self.timing.as_ref().unwrap().query_set,
            beginning_of_pass_write_index: Some(index),
            end_of_pass_write_index: Some(index + 1),
        });

        let encoder = match &mut self.state {
            RecorderState::Recording { encoder } => encoder,
            RecorderState::Finalized => return Err(Error::RecorderFinalized),
        };
        Ok(encoder.begin_compute_pass(&wgpu::ComputePassDescriptor { label: Some(label), timestamp_writes: writes }))
    }

    pub fn copy_buffer_to_buffer(
        &mut self,
        src: &wgpu::Buffer,
        src_offset: u64,
        dst: &wgpu::Buffer,
        dst_offset: u64,
        bytes: u64,
    ) -> Result<()> {
        let encoder = self.encoder_mut()?;
        encoder.copy_buffer_to_buffer(src, src_offset, dst, dst_offset, bytes);
        Ok(())
    }

    /// Creates a small uniform buffer from `data` and tracks it for
    /// deferred release; callers never need to release uniforms manually.
    pub fn create_uniform(&mut self, data: &[u8], label: &str) -> wgpu::Buffer {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: data.len().max(16) as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.queue.write_buffer(&buffer, 0, data);
        self.track_temporary(buffer.clone());
        buffer
    }

    /// Adds `buffer` to the deferred-release list: it will be returned
    /// to the pool only after this recorder's `submit()` has completed
    /// on the device (§4.2 invariant I1).
    pub fn track_temporary(&mut self, buffer: wgpu::Buffer) {
        self.deferred.push(buffer);
    }

    fn resolve_timing_queries(&mut self) {
        if let (RecorderState::Recording { encoder }, Some(timing)) = (&mut self.state, &self.timing) {
            if timing.pass_count > 0 {
                let count = timing.pass_count * 2;
                encoder.resolve_query_set(&timing.query_set, 0..count, &timing.resolve_buffer, 0);
                encoder.copy_buffer_to_buffer(&timing.resolve_buffer, 0, &timing.readback_buffer, 0, (count * 8) as u64);
            }
        }
    }

    /// Finishes the encoder and enqueues the work on the device queue.
    /// The deferred-release list is only drained after the device
    /// signals completion via `queue.on_submitted_work_done` — never
    /// eagerly (§4.2 I3, §5 buffer-lifetime rule).
    pub fn submit(&mut self) -> Result<SyncPoint> {
        self.resolve_timing_queries();
        let encoder = match std::mem::replace(&mut self.state, RecorderState::Finalized) {
            RecorderState::Recording { encoder } => encoder,
            RecorderState::Finalized => return Err(Error::RecorderFinalized),
        };
        let index = self.queue.submit(Some(encoder.finish()));

        let pool = self.pool.clone();
        let deferred = std::mem::take(&mut self.deferred);
        let device = self.device.clone();
        self.queue.on_submitted_work_done(move || {
            for buffer in deferred {
                pool.release(buffer);
            }
            // Keep the device alive until the callback fires; dropping it
            // early is harmless here since `device` is ref-counted, but
            // holding it documents the dependency explicitly.
            drop(device);
        });

        Ok(SyncPoint { index })
    }

    /// As `submit`, but blocks the calling thread until the submission
    /// has completed (used by the single-token decode path, which needs
    /// the result before it can issue the next step).
    pub fn submit_and_wait(&mut self) -> Result<SyncPoint> {
        let sync = self.submit()?;
        self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(sync.index.clone()));
        Ok(sync)
    }

    /// Submits pending work, blocks until it completes, then opens a
    /// fresh encoder so the same recorder keeps accumulating commands.
    /// Needed wherever a later command depends on reading back an
    /// earlier one's output mid-recording (the MoE overflow-reschedule
    /// loop's token-count check, §4.5 step 4).
    pub fn submit_wait_and_reopen(&mut self) -> Result<()> {
        self.submit_and_wait()?;
        let encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(&self.name) });
        self.state = RecorderState::Recording { encoder };
        Ok(())
    }

    /// Reads back resolved timestamp-query durations in milliseconds,
    /// keyed by the label passed to `begin_compute_pass`. Empty if
    /// profiling was never enabled or no passes were recorded.
    pub fn resolve_timings(&self, timestamp_period_ns: f32) -> Vec<(String, f64)> {
        let Some(timing) = &self.timing else { return Vec::new() };
        if timing.pass_count == 0 {
            return Vec::new();
        }
        let slice = timing.readback_buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);
        if rx.recv().ok().and_then(std::result::Result::ok).is_none() {
            return Vec::new();
        }
        let data = slice.get_mapped_range();
        let stamps: &[u64] = bytemuck::cast_slice(&data);
        let mut out = Vec::with_capacity(timing.pass_names.len());
        for (i, name) in timing.pass_names.iter().enumerate() {
            let (begin, end) = (stamps[i * 2], stamps[i * 2 + 1]);
            let ns = (end.saturating_sub(begin)) as f64 * timestamp_period_ns as f64;
            out.push((name.clone(), ns / 1.0e6));
        }
        drop(data);
        timing.readback_buffer.unmap();
        out
    }
}

pub fn wait_for(device: &wgpu::Device, sync: &SyncPoint) {
    device.poll(wgpu::Maintain::WaitForSubmissionIndex(sync.index.clone()));
}
