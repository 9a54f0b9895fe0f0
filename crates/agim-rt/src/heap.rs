//! Per-block heap accounting.
//!
//! Value representation and collector internals are external to the core;
//! the runtime sees the heap through a narrow interface: charge an
//! allocation, credit a release, deep-copy across a block boundary, and
//! free wholesale on death. Each block owns exactly one heap, mutated only
//! by the worker currently running it.

use crate::stepper::{StepError, StepErrorKind};
use crate::value::Value;

/// Byte-accounted heap for a single block.
#[derive(Debug)]
pub struct BlockHeap {
    live_bytes: usize,
    peak_bytes: usize,
    max_bytes: usize,
}

impl BlockHeap {
    pub fn new(max_bytes: usize) -> Self {
        BlockHeap {
            live_bytes: 0,
            peak_bytes: 0,
            max_bytes,
        }
    }

    /// Account for an allocation of `bytes`.
    ///
    /// Exceeding the block's heap limit is a resource error that crashes
    /// the block.
    pub fn charge(&mut self, bytes: usize) -> Result<(), StepError> {
        let next = self.live_bytes.saturating_add(bytes);
        if next > self.max_bytes {
            return Err(StepError::new(
                StepErrorKind::HeapLimit,
                format!("heap limit exceeded: {} + {} > {}", self.live_bytes, bytes, self.max_bytes),
            ));
        }
        self.live_bytes = next;
        self.peak_bytes = self.peak_bytes.max(next);
        Ok(())
    }

    /// Account for a release of `bytes`.
    pub fn credit(&mut self, bytes: usize) {
        self.live_bytes = self.live_bytes.saturating_sub(bytes);
    }

    /// Charge for a value about to be retained by this block.
    pub fn charge_value(&mut self, value: &Value) -> Result<(), StepError> {
        self.charge(value.approx_bytes())
    }

    /// Copy a value into this heap, charging for it.
    pub fn adopt(&mut self, value: &Value) -> Result<Value, StepError> {
        self.charge_value(value)?;
        Ok(value.deep_copy())
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Release everything. Used on block termination.
    pub fn reset(&mut self) {
        self.live_bytes = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_and_credit() {
        let mut heap = BlockHeap::new(1024);
        heap.charge(100).unwrap();
        heap.charge(200).unwrap();
        assert_eq!(heap.live_bytes(), 300);
        assert_eq!(heap.peak_bytes(), 300);

        heap.credit(150);
        assert_eq!(heap.live_bytes(), 150);
        assert_eq!(heap.peak_bytes(), 300, "peak is sticky");
    }

    #[test]
    fn test_limit_enforced() {
        let mut heap = BlockHeap::new(256);
        heap.charge(200).unwrap();
        let err = heap.charge(100).unwrap_err();
        assert_eq!(err.kind, StepErrorKind::HeapLimit);
        // Failed charge leaves accounting untouched.
        assert_eq!(heap.live_bytes(), 200);
    }

    #[test]
    fn test_adopt_copies_and_charges() {
        let mut heap = BlockHeap::new(1 << 20);
        let v = Value::array(vec![Value::Int(1), Value::Int(2)]);
        let adopted = heap.adopt(&v).unwrap();
        assert_eq!(adopted, v);
        assert!(heap.live_bytes() > 0);
    }

    #[test]
    fn test_reset_releases_everything() {
        let mut heap = BlockHeap::new(1024);
        heap.charge(512).unwrap();
        heap.reset();
        assert_eq!(heap.live_bytes(), 0);
        heap.charge(1024).unwrap();
    }
}
