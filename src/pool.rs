//! Output view pool: a fixed set of decode surfaces addressed by index.
//!
//! The pool is created together with the hardware decoder and holds exactly
//! `dpb_size` surfaces. Each surface is handed out wrapped in an
//! [`OutputViewBuffer`], a cheaply clonable pipeline buffer. The slot is
//! returned to the pool when the last clone is dropped, from whichever thread
//! happens to drop it, so downstream consumers never call an explicit free.
//!
//! Allocation always picks the lowest free index. An exhausted pool is a
//! backpressure signal: the caller waits for downstream to drop a buffer and
//! retries, nothing here blocks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::backend::{DeviceId, SurfaceArray};
use crate::error::DecoderError;

/// Index domain of a view is `u8`
pub const MAX_POOL_SIZE: usize = u8::MAX as usize + 1;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Index handle of one surface in a specific pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputView {
    index: u8,
    pool_id: u64,
}

impl OutputView {
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }
}

/// Snapshot of pool usage
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub peak_in_use: usize,
}

struct SlotState {
    in_use: Vec<bool>,
    peak: usize,
}

struct PoolShared {
    id: u64,
    log_target: String,
    surfaces: Arc<dyn SurfaceArray>,
    slots: Mutex<SlotState>,
}

impl PoolShared {
    fn release(&self, index: u8) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.in_use.get_mut(index as usize) {
            *slot = false;
        }
    }
}

/// Fixed-capacity pool of decode surfaces
pub struct OutputViewPool {
    shared: Arc<PoolShared>,
}

impl OutputViewPool {
    /// Wrap every slice of `surfaces` as a pool slot.
    ///
    /// # Panics
    ///
    /// Panics if `surfaces` holds more than [`MAX_POOL_SIZE`] slices.
    pub fn new(surfaces: Arc<dyn SurfaceArray>) -> Self {
        Self::with_log_target(surfaces, crate::DEFAULT_LOG_TARGET)
    }

    /// Like [`OutputViewPool::new`], logging under `log_target`
    pub fn with_log_target(surfaces: Arc<dyn SurfaceArray>, log_target: &str) -> Self {
        let capacity = surfaces.len();
        assert!(capacity <= MAX_POOL_SIZE, "pool size must fit an 8-bit index");

        Self {
            shared: Arc::new(PoolShared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                log_target: log_target.to_string(),
                surfaces,
                slots: Mutex::new(SlotState {
                    in_use: vec![false; capacity],
                    peak: 0,
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn capacity(&self) -> usize {
        self.shared.surfaces.len()
    }

    pub fn device_id(&self) -> DeviceId {
        self.shared.surfaces.device_id()
    }

    pub fn surfaces(&self) -> &Arc<dyn SurfaceArray> {
        &self.shared.surfaces
    }

    /// Claim the lowest free surface.
    ///
    /// Returns [`DecoderError::PoolExhausted`] when every surface is still
    /// referenced by a live buffer.
    pub fn acquire(&self) -> Result<OutputViewBuffer, DecoderError> {
        let mut slots = self.shared.slots.lock();
        let index = slots
            .in_use
            .iter()
            .position(|used| !used)
            .ok_or(DecoderError::PoolExhausted(slots.in_use.len()))?;

        slots.in_use[index] = true;
        let in_use = slots.in_use.iter().filter(|used| **used).count();
        slots.peak = slots.peak.max(in_use);

        Ok(OutputViewBuffer {
            lease: Arc::new(ViewLease {
                index: index as u8,
                pool: self.shared.clone(),
                exported: AtomicBool::new(false),
            }),
        })
    }

    /// Whether `buffer` was handed out by this pool
    pub fn owns(&self, buffer: &OutputViewBuffer) -> bool {
        Arc::ptr_eq(&self.shared, &buffer.lease.pool)
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.shared.slots.lock();
        PoolStats {
            capacity: slots.in_use.len(),
            in_use: slots.in_use.iter().filter(|used| **used).count(),
            peak_in_use: slots.peak,
        }
    }
}

impl std::fmt::Debug for OutputViewPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputViewPool")
            .field("id", &self.shared.id)
            .field("capacity", &self.capacity())
            .finish()
    }
}

struct ViewLease {
    index: u8,
    pool: Arc<PoolShared>,
    exported: AtomicBool,
}

impl Drop for ViewLease {
    fn drop(&mut self) {
        self.pool.release(self.index);
        log::trace!(
            target: self.pool.log_target.as_str(),
            "Output view {} returned to pool {}",
            self.index,
            self.pool.id
        );
    }
}

/// Pipeline buffer wrapping one pool surface.
///
/// Clones share the same surface. The surface memory stays valid for as
/// long as any clone is alive, even across a decoder reconfiguration.
#[derive(Clone)]
pub struct OutputViewBuffer {
    lease: Arc<ViewLease>,
}

impl OutputViewBuffer {
    pub fn view(&self) -> OutputView {
        OutputView {
            index: self.lease.index,
            pool_id: self.lease.pool.id,
        }
    }

    pub fn index(&self) -> u8 {
        self.lease.index
    }

    pub fn pool_id(&self) -> u64 {
        self.lease.pool.id
    }

    pub fn device_id(&self) -> DeviceId {
        self.lease.pool.surfaces.device_id()
    }

    pub(crate) fn surfaces(&self) -> &Arc<dyn SurfaceArray> {
        &self.lease.pool.surfaces
    }

    /// Number of live clones of this buffer
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.lease)
    }

    /// Whether a zero-copy export of this surface is outstanding
    pub fn is_exported(&self) -> bool {
        self.lease.exported.load(Ordering::Acquire)
    }

    /// Mark the surface as handed downstream without a copy.
    ///
    /// Only one export may be outstanding per surface; `None` means the
    /// surface is already being shown elsewhere and must be copied instead.
    pub fn export(&self) -> Option<ExportedView> {
        self.lease
            .exported
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ExportedView {
                buffer: self.clone(),
            })
    }
}

impl std::fmt::Debug for OutputViewBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputViewBuffer")
            .field("index", &self.lease.index)
            .field("pool", &self.lease.pool.id)
            .field("exported", &self.is_exported())
            .finish()
    }
}

/// Outstanding zero-copy export of a surface, cleared on drop
#[derive(Debug)]
pub struct ExportedView {
    buffer: OutputViewBuffer,
}

impl ExportedView {
    pub fn buffer(&self) -> &OutputViewBuffer {
        &self.buffer
    }
}

impl Drop for ExportedView {
    fn drop(&mut self) {
        self.buffer.lease.exported.store(false, Ordering::Release);
    }
}
