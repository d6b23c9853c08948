//! Caller buffers mapped for device access
//!
//! `map_buf` hands out page-aligned device addresses from a linear IO
//! window. Load and exec descriptors are checked against these mappings
//! before anything is sent to firmware. Buffers named by an outstanding exec
//! are pinned and cannot be unmapped until it finishes.

use crate::error::{NpuError, Result};
use crate::protocol::BufferSpan;
use std::collections::HashMap;
use tracing::debug;

/// Start of the device IO window
pub const IOVA_BASE: u64 = 0x1000_0000;

/// Mapping granularity
pub const IOVA_PAGE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mapping {
    address: u64,
    size: u32,
    pins: u32,
}

/// Handle → device address registry
#[derive(Debug)]
pub struct BufferMap {
    mappings: HashMap<i32, Mapping>,
    next_address: u64,
}

impl Default for BufferMap {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferMap {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            mappings: HashMap::new(),
            next_address: IOVA_BASE,
        }
    }

    /// Map `handle` for `size` bytes and return its device address
    ///
    /// Mapping the same handle again with the same size returns the existing
    /// address.
    ///
    /// # Errors
    ///
    /// `InvalidBuffer` for a zero size or a re-map with a different size.
    pub fn map(&mut self, handle: i32, size: u32) -> Result<u64> {
        if size == 0 {
            return Err(NpuError::invalid_buffer(format!(
                "buffer {handle}: zero size"
            )));
        }
        if let Some(existing) = self.mappings.get(&handle) {
            if existing.size == size {
                return Ok(existing.address);
            }
            return Err(NpuError::invalid_buffer(format!(
                "buffer {handle} already mapped with {} bytes",
                existing.size
            )));
        }

        let address = self.next_address;
        let span = u64::from(size).div_ceil(IOVA_PAGE) * IOVA_PAGE;
        self.next_address = address
            .checked_add(span)
            .ok_or_else(|| NpuError::invalid_buffer("IO window exhausted"))?;
        self.mappings.insert(
            handle,
            Mapping {
                address,
                size,
                pins: 0,
            },
        );

        debug!("Mapped buffer {handle}: {size} bytes at {address:#x}");
        Ok(address)
    }

    /// Forget the mapping for `handle`
    ///
    /// # Errors
    ///
    /// `InvalidBuffer` if `handle` is not mapped, `BufferInUse` while pinned.
    pub fn unmap(&mut self, handle: i32) -> Result<()> {
        if self.is_pinned(handle) {
            return Err(NpuError::BufferInUse { handle });
        }
        self.mappings
            .remove(&handle)
            .map(|m| debug!("Unmapped buffer {handle} at {:#x}", m.address))
            .ok_or_else(|| NpuError::invalid_buffer(format!("buffer {handle} not mapped")))
    }

    /// Validate `span` and pin its buffer against `unmap`
    ///
    /// # Errors
    ///
    /// Same as [`BufferMap::validate`]; nothing is pinned on error.
    pub fn pin(&mut self, span: &BufferSpan) -> Result<()> {
        self.validate(span)?;
        if let Some(m) = self.mappings.get_mut(&span.handle) {
            m.pins += 1;
        }
        Ok(())
    }

    /// Drop one pin taken by [`BufferMap::pin`]
    pub fn unpin(&mut self, handle: i32) {
        if let Some(m) = self.mappings.get_mut(&handle) {
            m.pins = m.pins.saturating_sub(1);
        }
    }

    /// Whether an outstanding exec holds `handle`
    pub fn is_pinned(&self, handle: i32) -> bool {
        self.mappings.get(&handle).is_some_and(|m| m.pins > 0)
    }

    /// Whether `handle` is mapped
    pub fn is_mapped(&self, handle: i32) -> bool {
        self.mappings.contains_key(&handle)
    }

    /// Number of live mappings
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Whether nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Check that `span` lies inside the mapping of its handle
    ///
    /// # Errors
    ///
    /// `InvalidBuffer` if the handle is unmapped, the span is empty, or the
    /// range leaves the mapping.
    pub fn validate(&self, span: &BufferSpan) -> Result<()> {
        let mapping = self.mappings.get(&span.handle).ok_or_else(|| {
            NpuError::invalid_buffer(format!("buffer {} not mapped", span.handle))
        })?;
        if span.size == 0 {
            return Err(NpuError::invalid_buffer(format!(
                "buffer {}: empty range",
                span.handle
            )));
        }

        let start = mapping.address;
        let end = start + u64::from(mapping.size);
        let span_end = span.physical_address.checked_add(u64::from(span.size));
        match span_end {
            Some(span_end) if span.physical_address >= start && span_end <= end => Ok(()),
            _ => Err(NpuError::invalid_buffer(format!(
                "range {:#x}+{} outside buffer {} ({start:#x}+{})",
                span.physical_address, span.size, span.handle, mapping.size
            ))),
        }
    }
}
