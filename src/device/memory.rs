//! Simulated bulk memory (L2) and scratchpad (L1).
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │              Bulk memory              │  sparse, 4KB pages,
//! │  input │ input2 │ weights │ output    │  named regions
//! └───────────────────┬───────────────────┘
//!                     │ DMA
//!                     ▼
//!            ┌─────────────────┐
//!            │   Scratchpad    │  flat, bounded
//!            └─────────────────┘
//! ```
//!
//! Bulk memory reads of unwritten pages return zeros, so border tiles that
//! reach past a tensor never fault. The scratchpad is strict: any access
//! outside `[base, base + size)` is an error.

use std::collections::BTreeMap;

/// A named bulk-memory region, with DMA counters.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub name: String,
    pub base_address: u64,
    pub size: usize,
    /// Number of DMA reads touching this region
    pub dma_reads: u64,
    /// Number of DMA writes touching this region
    pub dma_writes: u64,
}

impl MemoryRegion {
    pub fn new(name: impl Into<String>, base_address: u64, size: usize) -> Self {
        Self {
            name: name.into(),
            base_address,
            size,
            dma_reads: 0,
            dma_writes: 0,
        }
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base_address && addr < self.base_address + self.size as u64
    }

    #[inline]
    pub fn overlaps(&self, addr: u64, len: usize) -> bool {
        let end = addr.saturating_add(len as u64);
        let region_end = self.base_address.saturating_add(self.size as u64);
        addr < region_end && end > self.base_address
    }
}

/// Memory access errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Access outside the scratchpad
    OutOfRange { address: u64, len: usize },
    /// Region overlap on allocation
    RegionOverlap { new_base: u64, existing_name: String },
    /// Region not found
    RegionNotFound(String),
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfRange { address, len } => {
                write!(f, "Access of {} bytes at 0x{:08x} outside scratchpad", len, address)
            }
            Self::RegionOverlap { new_base, existing_name } => {
                write!(f, "Region at 0x{:08x} overlaps with '{}'", new_base, existing_name)
            }
            Self::RegionNotFound(name) => write!(f, "Region '{}' not found", name),
        }
    }
}

impl std::error::Error for MemoryError {}

/// Sparse bulk memory.
pub struct BulkMemory {
    /// page_address -> page_data
    pages: BTreeMap<u64, Box<[u8; Self::PAGE_SIZE]>>,
    regions: Vec<MemoryRegion>,
    total_bytes_written: u64,
    total_bytes_read: u64,
}

impl BulkMemory {
    pub const PAGE_SIZE: usize = 4096;

    const PAGE_MASK: u64 = !(Self::PAGE_SIZE as u64 - 1);

    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
            regions: Vec::new(),
            total_bytes_written: 0,
            total_bytes_read: 0,
        }
    }

    /// Register a named region. Pages are still allocated on demand.
    pub fn allocate_region(&mut self, name: impl Into<String>, base_address: u64, size: usize) -> Result<(), MemoryError> {
        if let Some(existing) = self.regions.iter().find(|r| r.overlaps(base_address, size)) {
            return Err(MemoryError::RegionOverlap {
                new_base: base_address,
                existing_name: existing.name.clone(),
            });
        }
        self.regions.push(MemoryRegion::new(name, base_address, size));
        Ok(())
    }

    pub fn region(&self, name: &str) -> Result<&MemoryRegion, MemoryError> {
        self.regions
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| MemoryError::RegionNotFound(name.to_string()))
    }

    pub fn region_at(&self, addr: u64) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    fn get_or_create_page(&mut self, addr: u64) -> &mut [u8; Self::PAGE_SIZE] {
        self.pages
            .entry(addr & Self::PAGE_MASK)
            .or_insert_with(|| Box::new([0u8; Self::PAGE_SIZE]))
    }

    fn get_page(&self, addr: u64) -> Option<&[u8; Self::PAGE_SIZE]> {
        self.pages.get(&(addr & Self::PAGE_MASK)).map(|b| b.as_ref())
    }

    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        let mut current = addr;
        let mut remaining = data;

        while !remaining.is_empty() {
            let page = self.get_or_create_page(current);
            let offset = (current & !Self::PAGE_MASK) as usize;
            let n = remaining.len().min(Self::PAGE_SIZE - offset);
            page[offset..offset + n].copy_from_slice(&remaining[..n]);
            current += n as u64;
            remaining = &remaining[n..];
        }

        self.total_bytes_written += data.len() as u64;
    }

    pub fn read_bytes(&mut self, addr: u64, buf: &mut [u8]) {
        self.peek_bytes(addr, buf);
        self.total_bytes_read += buf.len() as u64;
    }

    /// Read without touching the statistics.
    pub fn peek_bytes(&self, addr: u64, buf: &mut [u8]) {
        let mut current = addr;
        let mut done = 0;

        while done < buf.len() {
            let offset = (current & !Self::PAGE_MASK) as usize;
            let n = (buf.len() - done).min(Self::PAGE_SIZE - offset);
            match self.get_page(current) {
                Some(page) => buf[done..done + n].copy_from_slice(&page[offset..offset + n]),
                None => buf[done..done + n].fill(0),
            }
            current += n as u64;
            done += n;
        }
    }

    /// Fill `len` bytes at `addr` with a position-dependent pattern.
    pub fn fill_pattern(&mut self, addr: u64, len: usize, seed: u8) {
        let data: Vec<u8> = (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect();
        self.write_bytes(addr, &data);
    }

    pub fn record_dma_read(&mut self, addr: u64, len: usize) {
        if let Some(region) = self.regions.iter_mut().find(|r| r.overlaps(addr, len)) {
            region.dma_reads += 1;
        }
    }

    pub fn record_dma_write(&mut self, addr: u64, len: usize) {
        if let Some(region) = self.regions.iter_mut().find(|r| r.overlaps(addr, len)) {
            region.dma_writes += 1;
        }
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.total_bytes_read
    }

    pub fn allocated_pages(&self) -> usize {
        self.pages.len()
    }

    /// Hexdump a range for debugging.
    pub fn hexdump(&self, addr: u64, len: usize) -> String {
        let mut buf = vec![0u8; len];
        self.peek_bytes(addr, &mut buf);

        let mut result = String::new();
        for (i, chunk) in buf.chunks(16).enumerate() {
            result.push_str(&format!("{:08x}: ", addr + (i * 16) as u64));
            for (j, byte) in chunk.iter().enumerate() {
                if j == 8 {
                    result.push(' ');
                }
                result.push_str(&format!("{:02x} ", byte));
            }
            result.push('\n');
        }
        result
    }
}

impl Default for BulkMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BulkMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkMemory")
            .field("allocated_pages", &self.pages.len())
            .field("regions", &self.regions.len())
            .field("total_bytes_written", &self.total_bytes_written)
            .field("total_bytes_read", &self.total_bytes_read)
            .finish()
    }
}

/// Bounded scratchpad.
#[derive(Debug, Clone)]
pub struct Scratchpad {
    base: u64,
    data: Vec<u8>,
}

impl Scratchpad {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            data: vec![0; size],
        }
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn range(&self, address: u64, len: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let err = MemoryError::OutOfRange { address, len };
        let start = address.checked_sub(self.base).ok_or_else(|| err.clone())? as usize;
        let end = start.checked_add(len).ok_or_else(|| err.clone())?;
        if end > self.data.len() {
            return Err(err);
        }
        Ok(start..end)
    }

    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let range = self.range(address, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let range = self.range(address, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&mut self, address: u64, len: usize, value: u8) -> Result<(), MemoryError> {
        let range = self.range(address, len)?;
        self.data[range].fill(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_page_write_read() {
        let mut mem = BulkMemory::new();
        let addr = BulkMemory::PAGE_SIZE as u64 - 2;
        mem.write_bytes(addr, &[1, 2, 3, 4]);

        let mut buf = [0u8; 4];
        mem.read_bytes(addr, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(mem.allocated_pages(), 2);
        assert_eq!(mem.total_bytes_read(), 4);
    }

    #[test]
    fn test_unwritten_reads_zero() {
        let mem = BulkMemory::new();
        let mut buf = [0xffu8; 8];
        mem.peek_bytes(0x9000_0000, &mut buf);
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn test_region_overlap_rejected() {
        let mut mem = BulkMemory::new();
        mem.allocate_region("input", 0x1000, 256).unwrap();
        let err = mem.allocate_region("output", 0x10f0, 64).unwrap_err();
        assert_eq!(
            err,
            MemoryError::RegionOverlap {
                new_base: 0x10f0,
                existing_name: "input".into()
            }
        );
        assert!(mem.region("weights").is_err());
    }

    #[test]
    fn test_dma_counters() {
        let mut mem = BulkMemory::new();
        mem.allocate_region("output", 0x2000, 64).unwrap();
        mem.record_dma_write(0x2010, 8);
        mem.record_dma_write(0x3000, 8);
        assert_eq!(mem.region("output").unwrap().dma_writes, 1);
        assert_eq!(mem.region_at(0x2020).map(|r| r.name.as_str()), Some("output"));
    }

    #[test]
    fn test_scratchpad_bounds() {
        let mut spm = Scratchpad::new(0x100, 16);
        spm.write(0x10c, &[7; 4]).unwrap();

        let mut buf = [0u8; 4];
        spm.read(0x10c, &mut buf).unwrap();
        assert_eq!(buf, [7; 4]);

        assert!(spm.write(0x10d, &[0; 4]).is_err());
        assert!(spm.read(0xff, &mut buf).is_err());
    }

    #[test]
    fn test_hexdump_format() {
        let mut mem = BulkMemory::new();
        mem.write_bytes(0x40, &[0xab; 4]);
        let dump = mem.hexdump(0x40, 4);
        assert!(dump.starts_with("00000040: ab ab ab ab"));
    }
}
