//! Multi-dimensional address generation for strided tile copies.
//!
//! A strided copy moves `copies_2d` rows of `copies_1d` pixels, each pixel
//! a contiguous run of `length_1d` bytes. The bulk side walks the tensor with
//! `stride_1d` between pixels and `stride_2d` between rows; the scratchpad
//! side is densely packed.
//!
//! The generator yields the start address of every contiguous run:
//!
//! ```text
//! base = 0x1000, D0: size=3 stride=16, D1: size=2 stride=128
//!
//! Row 0: 0x1000, 0x1010, 0x1020
//! Row 1: 0x1080, 0x1090, 0x10A0
//! ```
//!
//! When `stride_1d == length_1d` the pixels of a row are adjacent and each
//! row collapses into one run.

use crate::schedule::transfer::{CopyShape, TransferDescriptor};

/// One dimension of an address pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DimensionConfig {
    /// Iteration count; 0 is treated as 1
    pub size: u32,
    /// Address increment in bytes per iteration
    pub stride: u64,
}

impl DimensionConfig {
    pub fn new(size: u32, stride: u64) -> Self {
        Self { size, stride }
    }

    #[inline]
    pub fn effective_size(&self) -> u32 {
        self.size.max(1)
    }
}

/// Address generator over up to 3 dimensions, D0 innermost.
///
/// `address = base + c0 * d0.stride + c1 * d1.stride + c2 * d2.stride`
#[derive(Debug, Clone)]
pub struct AddressGenerator {
    base: u64,
    dimensions: [DimensionConfig; 3],
    counters: [u32; 3],
    total: u64,
    generated: u64,
}

impl AddressGenerator {
    pub fn new(base: u64, dimensions: [DimensionConfig; 3]) -> Self {
        let total = dimensions
            .iter()
            .map(|d| d.effective_size() as u64)
            .product();
        Self {
            base,
            dimensions,
            counters: [0; 3],
            total,
            generated: 0,
        }
    }

    pub fn new_1d(base: u64, size: u32, stride: u64) -> Self {
        Self::new(
            base,
            [DimensionConfig::new(size, stride), DimensionConfig::default(), DimensionConfig::default()],
        )
    }

    pub fn new_2d(base: u64, d0_size: u32, d0_stride: u64, d1_size: u32, d1_stride: u64) -> Self {
        Self::new(
            base,
            [
                DimensionConfig::new(d0_size, d0_stride),
                DimensionConfig::new(d1_size, d1_stride),
                DimensionConfig::default(),
            ],
        )
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.total - self.generated
    }

    fn current(&self) -> u64 {
        self.dimensions
            .iter()
            .zip(self.counters)
            .fold(self.base, |addr, (dim, counter)| addr + counter as u64 * dim.stride)
    }

    fn advance(&mut self) {
        for (counter, dim) in self.counters.iter_mut().zip(&self.dimensions) {
            *counter += 1;
            if *counter < dim.effective_size() {
                return;
            }
            *counter = 0;
        }
    }

    pub fn reset(&mut self) {
        self.counters = [0; 3];
        self.generated = 0;
    }
}

impl Iterator for AddressGenerator {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.generated >= self.total {
            return None;
        }
        let addr = self.current();
        self.generated += 1;
        self.advance();
        Some(addr)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining() as usize;
        (remaining, Some(remaining))
    }
}

/// Contiguous `(address, len)` runs a descriptor touches in bulk memory.
pub fn bulk_runs(desc: &TransferDescriptor) -> Vec<(u64, u64)> {
    match desc.shape {
        CopyShape::Linear { len } => vec![(desc.bulk, len)],
        CopyShape::Strided {
            copies_2d,
            copies_1d,
            length_1d,
            stride_2d,
            stride_1d,
        } => {
            if stride_1d == length_1d {
                // Pixels of a row are adjacent
                let row = copies_1d as u64 * length_1d as u64;
                AddressGenerator::new_1d(desc.bulk, copies_2d, stride_2d as u64)
                    .map(|addr| (addr, row))
                    .collect()
            } else {
                AddressGenerator::new_2d(desc.bulk, copies_1d, stride_1d as u64, copies_2d, stride_2d as u64)
                    .map(|addr| (addr, length_1d as u64))
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::geometry::Dims;
    use crate::schedule::role::Role;
    use crate::schedule::transfer::Direction;

    #[test]
    fn test_2d_pattern() {
        let addrs: Vec<u64> = AddressGenerator::new_2d(0x1000, 3, 16, 2, 128).collect();
        assert_eq!(addrs, vec![0x1000, 0x1010, 0x1020, 0x1080, 0x1090, 0x10A0]);
    }

    #[test]
    fn test_zero_size_is_one_iteration() {
        let gen = AddressGenerator::new(0x40, [DimensionConfig::default(); 3]);
        assert_eq!(gen.total(), 1);
        assert_eq!(gen.collect::<Vec<_>>(), vec![0x40]);
    }

    #[test]
    fn test_reset() {
        let mut gen = AddressGenerator::new_1d(0, 4, 8);
        assert_eq!(gen.by_ref().count(), 4);
        assert_eq!(gen.remaining(), 0);
        gen.reset();
        assert_eq!(gen.next(), Some(0));
    }

    #[test]
    fn test_channel_slice_runs_per_pixel() {
        // 2x2 tile of 4 channels out of an 8x8x16 tensor
        let desc = TransferDescriptor::tile(
            Role::Output,
            Direction::Store,
            0,
            0,
            Dims::new(2, 2, 4),
            Dims::new(8, 8, 16),
            1,
        );
        assert_eq!(bulk_runs(&desc), vec![(0, 4), (16, 4), (128, 4), (144, 4)]);
    }

    #[test]
    fn test_full_depth_rows_collapse() {
        let desc = TransferDescriptor::tile(
            Role::Input,
            Direction::Load,
            0x100,
            0,
            Dims::new(2, 3, 4),
            Dims::new(8, 8, 4),
            1,
        );
        assert_eq!(bulk_runs(&desc), vec![(0x100, 12), (0x120, 12)]);
    }

    #[test]
    fn test_linear_single_run() {
        let desc = TransferDescriptor::linear(Role::Bias, Direction::Load, 0x300, 0, 64);
        assert_eq!(bulk_runs(&desc), vec![(0x300, 64)]);
    }
}
