//! Simulated compute engine.
//!
//! No kernel math is modelled. A job fills its output tile with a marker
//! byte derived from its stage and tile index, honouring the output channel
//! pitch, so tests can tell which job produced which bytes after the data
//! went through the store path.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::device::trace::Event;
use crate::device::SimDevice;
use crate::schedule::compute::{ComputeEngine, ComputeError, ComputeJob, JobHandle};
use crate::schedule::index::TileIndex;
use crate::schedule::role::{Role, Stage};

/// Marker byte a job of `stage` writes for the tile at `index`.
pub fn tile_marker(stage: Stage, index: TileIndex) -> u8 {
    let stage = match stage {
        Stage::Single => 1u8,
        Stage::Expand => 2,
        Stage::Spatial => 3,
        Stage::Project => 4,
    };
    stage
        .wrapping_mul(61)
        .wrapping_add((index.height as u8).wrapping_mul(17))
        .wrapping_add((index.width as u8).wrapping_mul(5))
        .wrapping_add(index.output_channel as u8)
}

/// Compute engine backed by a [`SimDevice`].
pub struct SimCompute<'d> {
    device: &'d SimDevice,
    next_handle: AtomicU64,
    issued: Mutex<HashSet<JobHandle>>,
    /// Job number whose wait reports a failure
    fail_job: Option<u64>,
    element_bytes: u32,
}

impl<'d> SimCompute<'d> {
    pub fn new(device: &'d SimDevice) -> Self {
        Self {
            device,
            next_handle: AtomicU64::new(0),
            issued: Mutex::new(HashSet::new()),
            fail_job: None,
            element_bytes: 1,
        }
    }

    /// Make the wait on the `nth` issued job (0-based) fail.
    pub fn with_failing_job(mut self, nth: u64) -> Self {
        self.fail_job = Some(nth);
        self
    }

    pub fn with_element_bytes(mut self, bytes: u32) -> Self {
        self.element_bytes = bytes.max(1);
        self
    }

    fn reject(job: &ComputeJob, reason: String) -> ComputeError {
        ComputeError::Rejected {
            stage: job.stage,
            index: job.index,
            reason,
        }
    }

    fn execute(&self, job: &ComputeJob) -> Result<(), ComputeError> {
        let mut scratch = self.device.lock_scratch();
        let elem = self.element_bytes as u64;

        let output = job
            .output_addr()
            .ok_or_else(|| Self::reject(job, "no output buffer".into()))?;

        if let (true, Some(input_addr)) = (log::log_enabled!(log::Level::Trace), job.addr[Role::Input]) {
            let mut input = vec![0u8; job.input.bytes(self.element_bytes) as usize];
            scratch
                .read(input_addr, &mut input)
                .map_err(|e| Self::reject(job, e.to_string()))?;
            let checksum = input.iter().fold(0u32, |acc, &b| acc.rotate_left(5) ^ b as u32);
            log::trace!("{} {} input checksum 0x{:08x}", job.stage, job.index, checksum);
        }

        let marker = tile_marker(job.stage, job.index);
        let run = vec![marker; (job.output.channel as u64 * elem) as usize];
        let pitch = job.output_pitch as u64;
        for y in 0..job.output.height as u64 {
            for x in 0..job.output.width as u64 {
                let pixel = y * job.output.width as u64 + x;
                let addr = output + pixel * pitch * elem;
                scratch
                    .write(addr, &run)
                    .map_err(|e| Self::reject(job, e.to_string()))?;
            }
        }
        Ok(())
    }
}

impl ComputeEngine for SimCompute<'_> {
    fn run_async(&self, job: &ComputeJob) -> Result<JobHandle, ComputeError> {
        self.execute(job)?;
        let handle = JobHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle);
        self.device.events().push(Event::ComputeStart {
            handle,
            stage: job.stage,
            index: job.index,
        });
        log::debug!("{} {} {} -> {}", handle, job.stage, job.index, job.output);
        Ok(handle)
    }

    fn wait(&self, handle: JobHandle) -> Result<(), ComputeError> {
        let known = self
            .issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&handle);
        if !known {
            return Err(ComputeError::UnknownHandle(handle));
        }
        self.device.events().push(Event::ComputeWait { handle });
        if self.fail_job == Some(handle.0) {
            log::warn!("Injected compute fault on {}", handle);
            return Err(ComputeError::Failed {
                handle,
                reason: "injected fault".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::geometry::{Dims, Kernel};
    use crate::schedule::role::RoleTable;

    fn job(output: Dims, pitch: u32, out_addr: u64) -> ComputeJob {
        let mut addr = RoleTable::splat(None);
        addr[Role::Output] = Some(out_addr);
        ComputeJob {
            stage: Stage::Spatial,
            index: TileIndex::new(0, 1, 1),
            kernel: Kernel::pointwise(),
            input: Dims::new(1, 1, 1),
            output,
            addr,
            output_pitch: pitch,
        }
    }

    #[test]
    fn test_output_written_as_channel_slice() {
        let device = SimDevice::new(0, 64);
        let compute = SimCompute::new(&device);
        // 1x2 pixels x 2 channels into a 4-channel-wide buffer at channel 2
        compute.run_blocking(&job(Dims::new(1, 2, 2), 4, 2)).unwrap();

        let marker = tile_marker(Stage::Spatial, TileIndex::new(0, 1, 1));
        let mut buf = [0u8; 8];
        device.lock_scratch().read(0, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, marker, marker, 0, 0, marker, marker]);
    }

    #[test]
    fn test_markers_differ_between_tiles() {
        let a = tile_marker(Stage::Single, TileIndex::new(0, 0, 0));
        let b = tile_marker(Stage::Single, TileIndex::new(0, 1, 0));
        let c = tile_marker(Stage::Project, TileIndex::new(0, 0, 0));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_output_outside_scratchpad_rejected() {
        let device = SimDevice::new(0, 3);
        let compute = SimCompute::new(&device);
        let err = compute.run_async(&job(Dims::new(1, 2, 2), 2, 0)).unwrap_err();
        assert!(matches!(err, ComputeError::Rejected { .. }));
        assert!(device.events().is_empty());
    }

    #[test]
    fn test_job_without_output_buffer_rejected() {
        let device = SimDevice::new(0, 64);
        let compute = SimCompute::new(&device);
        let mut j = job(Dims::new(1, 1, 1), 1, 0);
        j.addr[Role::Output] = None;

        let err = compute.run_async(&j).unwrap_err();
        assert!(matches!(err, ComputeError::Rejected { ref reason, .. } if reason == "no output buffer"));
        assert!(device.events().is_empty());
    }

    #[test]
    fn test_injected_failure_on_wait() {
        let device = SimDevice::new(0, 64);
        let compute = SimCompute::new(&device).with_failing_job(1);
        let j = job(Dims::new(1, 1, 1), 1, 0);

        compute.run_blocking(&j).unwrap();
        let handle = compute.run_async(&j).unwrap();
        assert!(matches!(compute.wait(handle), Err(ComputeError::Failed { .. })));
        assert_eq!(compute.wait(JobHandle(9)), Err(ComputeError::UnknownHandle(JobHandle(9))));
    }
}
