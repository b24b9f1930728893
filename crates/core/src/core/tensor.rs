//! Tensor handles and the ownership rules that govern them.
//!
//! Buffers live in a shared [`Backend`] arena and are addressed by id. A
//! [`Tensor`] is the single owning handle to one buffer: it is not `Clone`, so
//! duplicating a tensor always goes through [`Tensor::duplicate`], which
//! allocates a new buffer. Dropping a handle disposes its buffer; disposing an
//! already-disposed handle is a no-op.
//!
//! Two helpers sit on top of the raw handle:
//! - [`TensorSlot`]: a long-lived slot whose setter always releases the value
//!   it replaces (the canonical emotions tensor lives in one).
//! - [`FrameClone`]: a per-frame scratch copy lent to sinks and released when
//!   the frame ends, including on unwinding.

use hashbrown::HashMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub type TensorId = u64;

/// Row-major 2-D shape `[rows, cols]`.
pub type Shape = [usize; 2];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    #[error("tensor {0} has been disposed")]
    Disposed(TensorId),
    #[error("numeric backend is unavailable")]
    BackendUnavailable,
    #[error("shape {shape:?} does not hold {len} values")]
    ShapeMismatch { shape: Shape, len: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub allocated: u64,
    pub disposed: u64,
    pub live: usize,
}

#[derive(Debug)]
struct Arena {
    buffers: HashMap<TensorId, Vec<f32>>,
    next_id: TensorId,
    available: bool,
    stats: BackendStats,
}

impl Arena {
    fn alloc(&mut self, values: Vec<f32>) -> Result<TensorId, TensorError> {
        if !self.available {
            return Err(TensorError::BackendUnavailable);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.buffers.insert(id, values);
        self.stats.allocated = self.stats.allocated.saturating_add(1);
        self.stats.live = self.buffers.len();
        Ok(id)
    }

    fn release(&mut self, id: TensorId) -> bool {
        if self.buffers.remove(&id).is_none() {
            return false;
        }
        self.stats.disposed = self.stats.disposed.saturating_add(1);
        self.stats.live = self.buffers.len();
        true
    }
}

/// Shared numeric backend. Cheap to clone; all clones address the same arena.
#[derive(Clone)]
pub struct Backend {
    arena: Arc<Mutex<Arena>>,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("stats", &self.stats())
            .field("available", &self.is_available())
            .finish()
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend {
    pub fn new() -> Self {
        Self {
            arena: Arc::new(Mutex::new(Arena {
                buffers: HashMap::new(),
                next_id: 1,
                available: true,
                stats: BackendStats::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tensor(&self, shape: Shape, values: Vec<f32>) -> Result<Tensor, TensorError> {
        if shape[0].saturating_mul(shape[1]) != values.len() {
            return Err(TensorError::ShapeMismatch {
                shape,
                len: values.len(),
            });
        }
        let id = self.lock().alloc(values)?;
        Ok(Tensor {
            id,
            shape,
            backend: self.clone(),
        })
    }

    /// A `[1, n]` row tensor holding `values`.
    pub fn row(&self, values: &[f32]) -> Result<Tensor, TensorError> {
        self.tensor([1, values.len()], values.to_vec())
    }

    pub fn zeros(&self, shape: Shape) -> Result<Tensor, TensorError> {
        self.tensor(shape, vec![0.0; shape[0].saturating_mul(shape[1])])
    }

    pub fn is_available(&self) -> bool {
        self.lock().available
    }

    /// Mark the backend as lost (or restored). Allocation fails while lost;
    /// disposal keeps working so teardown can still release buffers.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn stats(&self) -> BackendStats {
        self.lock().stats
    }

    fn is_live(&self, id: TensorId) -> bool {
        self.lock().buffers.contains_key(&id)
    }

    fn read(&self, id: TensorId) -> Result<Vec<f32>, TensorError> {
        self.lock()
            .buffers
            .get(&id)
            .cloned()
            .ok_or(TensorError::Disposed(id))
    }

    fn release(&self, id: TensorId) -> bool {
        self.lock().release(id)
    }
}

/// Owning handle to one backend buffer.
///
/// Only the owner releases the buffer, by dropping the handle. A borrowed
/// `&Tensor` can be read or duplicated but not freed:
///
/// ```compile_fail
/// let backend = emosim::tensor::Backend::new();
/// let lent = backend.zeros([1, 3]).unwrap();
/// let borrowed: &emosim::tensor::Tensor = &lent;
/// borrowed.dispose();
/// ```
pub struct Tensor {
    id: TensorId,
    shape: Shape,
    backend: Backend,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Tensor {
    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.shape[0] * self.shape[1]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disposed(&self) -> bool {
        !self.backend.is_live(self.id)
    }

    /// Release the underlying buffer. Returns `true` only for the call that
    /// actually freed it.
    pub(crate) fn dispose(&self) -> bool {
        self.backend.release(self.id)
    }

    pub fn to_vec(&self) -> Result<Vec<f32>, TensorError> {
        self.backend.read(self.id)
    }

    /// Explicit clone into a new buffer with its own owner.
    pub fn duplicate(&self) -> Result<Tensor, TensorError> {
        let values = self.to_vec()?;
        self.backend.tensor(self.shape, values)
    }

    /// Euclidean norm of all values.
    pub fn norm(&self) -> Result<f32, TensorError> {
        Ok(self.to_vec()?.iter().map(|v| v * v).sum::<f32>().sqrt())
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlotStats {
    pub replaced: u64,
    pub disposed: u64,
}

/// Single long-lived tensor slot. Every write releases the previous occupant.
#[derive(Debug, Default)]
pub struct TensorSlot {
    current: Option<Tensor>,
    stats: SlotStats,
}

impl TensorSlot {
    pub fn new(initial: Tensor) -> Self {
        Self {
            current: Some(initial),
            stats: SlotStats::default(),
        }
    }

    pub fn get(&self) -> Option<&Tensor> {
        self.current.as_ref()
    }

    /// Occupied by a buffer that has not been disposed.
    pub fn is_live(&self) -> bool {
        self.current.as_ref().is_some_and(|t| !t.is_disposed())
    }

    pub fn replace(&mut self, next: Tensor) {
        if let Some(prev) = self.current.take() {
            if prev.dispose() {
                self.stats.disposed += 1;
            }
        }
        self.current = Some(next);
        self.stats.replaced += 1;
    }

    /// Release the occupant and leave the slot empty (teardown only).
    pub fn clear(&mut self) {
        if let Some(prev) = self.current.take() {
            if prev.dispose() {
                self.stats.disposed += 1;
            }
        }
    }

    pub fn stats(&self) -> SlotStats {
        self.stats
    }
}

#[derive(Debug, Default)]
pub struct FrameCounters {
    created: AtomicU64,
    disposed: AtomicU64,
}

impl FrameCounters {
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn disposed(&self) -> u64 {
        self.disposed.load(Ordering::Relaxed)
    }
}

/// Per-frame render copy. Lent by reference to sinks and released on drop.
#[derive(Debug)]
pub struct FrameClone {
    tensor: Tensor,
    counters: Arc<FrameCounters>,
}

impl FrameClone {
    pub fn of(source: &Tensor, counters: &Arc<FrameCounters>) -> Result<Self, TensorError> {
        let tensor = source.duplicate()?;
        counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(Self {
            tensor,
            counters: Arc::clone(counters),
        })
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }
}

impl Drop for FrameClone {
    fn drop(&mut self) {
        if self.tensor.dispose() {
            self.counters.disposed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispose_twice_is_a_noop() {
        let backend = Backend::new();
        let t = backend.zeros([1, 4]).unwrap();
        assert!(t.dispose());
        assert!(!t.dispose());
        assert!(t.is_disposed());
        assert_eq!(backend.stats().disposed, 1);
        drop(t);
        assert_eq!(backend.stats().disposed, 1);
    }

    #[test]
    fn drop_releases_buffer() {
        let backend = Backend::new();
        {
            let _t = backend.row(&[1.0, 2.0]).unwrap();
            assert_eq!(backend.stats().live, 1);
        }
        assert_eq!(backend.stats().live, 0);
    }

    #[test]
    fn duplicate_owns_a_separate_buffer() {
        let backend = Backend::new();
        let a = backend.row(&[3.0, 4.0]).unwrap();
        let b = a.duplicate().unwrap();
        assert_ne!(a.id(), b.id());
        a.dispose();
        assert_eq!(b.to_vec().unwrap(), vec![3.0, 4.0]);
        assert!((b.norm().unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn reading_disposed_tensor_fails() {
        let backend = Backend::new();
        let t = backend.zeros([1, 2]).unwrap();
        t.dispose();
        assert_eq!(t.to_vec(), Err(TensorError::Disposed(t.id())));
        assert!(t.duplicate().is_err());
    }

    #[test]
    fn unavailable_backend_refuses_allocation_but_still_frees() {
        let backend = Backend::new();
        let t = backend.zeros([1, 3]).unwrap();
        backend.set_available(false);
        assert_eq!(
            backend.zeros([1, 3]).unwrap_err(),
            TensorError::BackendUnavailable
        );
        assert!(t.dispose());
    }

    #[test]
    fn shape_must_match_values() {
        let backend = Backend::new();
        let err = backend.tensor([2, 2], vec![0.0; 3]).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { len: 3, .. }));
    }

    #[test]
    fn slot_releases_each_replaced_tensor_once() {
        let backend = Backend::new();
        let mut slot = TensorSlot::new(backend.zeros([1, 2]).unwrap());
        for _ in 0..5 {
            slot.replace(backend.row(&[1.0, 1.0]).unwrap());
        }
        assert_eq!(slot.stats(), SlotStats { replaced: 5, disposed: 5 });
        assert_eq!(backend.stats().live, 1);
        slot.clear();
        assert_eq!(slot.stats().disposed, 6);
        assert_eq!(backend.stats().live, 0);
        assert!(!slot.is_live());
    }

    #[test]
    fn slot_does_not_count_an_already_disposed_occupant() {
        let backend = Backend::new();
        let mut slot = TensorSlot::new(backend.zeros([1, 2]).unwrap());
        slot.get().unwrap().dispose();
        assert!(!slot.is_live());
        slot.replace(backend.zeros([1, 2]).unwrap());
        assert_eq!(slot.stats(), SlotStats { replaced: 1, disposed: 0 });
    }

    #[test]
    fn frame_clone_is_released_on_drop() {
        let backend = Backend::new();
        let counters = Arc::new(FrameCounters::default());
        let canonical = backend.row(&[0.5; 3]).unwrap();
        {
            let frame = FrameClone::of(&canonical, &counters).unwrap();
            assert_eq!(frame.tensor().to_vec().unwrap(), vec![0.5; 3]);
            assert_eq!(backend.stats().live, 2);
        }
        assert_eq!(counters.created(), 1);
        assert_eq!(counters.disposed(), 1);
        assert_eq!(backend.stats().live, 1);
    }

    #[test]
    fn frame_clone_is_released_when_a_sink_panics() {
        let backend = Backend::new();
        let counters = Arc::new(FrameCounters::default());
        let canonical = backend.row(&[1.0]).unwrap();
        let frame = FrameClone::of(&canonical, &counters).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _held = frame;
            panic!("sink failure");
        }));
        assert!(result.is_err());
        assert_eq!(counters.disposed(), 1);
        assert_eq!(backend.stats().live, 1);
    }
}
