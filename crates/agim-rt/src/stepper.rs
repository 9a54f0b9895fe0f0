//! The stepper seam between the runtime core and the bytecode interpreter.
//!
//! The interpreter proper is an external collaborator; the core sees it as a
//! [`Program`] that is resumed for one reduction-budgeted slice at a time and
//! reports back through a small set of result codes ([`StepStatus`]). The
//! core owns the stepper's persistent state -- instruction offset, operand
//! stack, call frames, globals -- because checkpointing and hot upgrade need
//! to reach it.
//!
//! A block is never preempted mid-instruction: preemption happens only when
//! `resume` returns. The reduction budget enforces that -- a program charges
//! reductions as it makes progress and yields when the slice is exhausted.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::block::Limits;
use crate::sched::BlockRun;
use crate::value::{Value, ValueMap};

// ---------------------------------------------------------------------------
// StepStatus / StepError
// ---------------------------------------------------------------------------

/// Result of resuming a block's stepper for one slice.
#[derive(Debug)]
pub enum StepStatus {
    /// The program ran to completion.
    Ok,
    /// The program requested termination (exit code set via the context).
    Halt,
    /// Reduction budget exhausted or explicit yield; work remains.
    Yield,
    /// Suspended in a receive (or sleep); the scheduler wires the wake-up.
    Waiting,
    /// The program faulted; the block terminates with reason `crash`.
    Error(StepError),
}

/// Classification of stepper faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepErrorKind {
    StackOverflow,
    StackUnderflow,
    TypeMismatch,
    DivideByZero,
    OutOfBounds,
    UndefinedVariable,
    Arity,
    CapabilityDenied,
    SendFailed,
    HeapLimit,
}

/// A stepper fault with an attached message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        StepError {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            StepErrorKind::StackOverflow => "stack overflow",
            StepErrorKind::StackUnderflow => "stack underflow",
            StepErrorKind::TypeMismatch => "type mismatch",
            StepErrorKind::DivideByZero => "divide by zero",
            StepErrorKind::OutOfBounds => "out of bounds",
            StepErrorKind::UndefinedVariable => "undefined variable",
            StepErrorKind::Arity => "arity mismatch",
            StepErrorKind::CapabilityDenied => "capability denied",
            StepErrorKind::SendFailed => "send failed",
            StepErrorKind::HeapLimit => "heap limit exceeded",
        };
        write!(f, "{}: {}", kind, self.message)
    }
}

impl From<StepError> for StepStatus {
    fn from(err: StepError) -> Self {
        StepStatus::Error(err)
    }
}

// ---------------------------------------------------------------------------
// Call frames and stepper state
// ---------------------------------------------------------------------------

/// One call frame. The interpreter keeps richer frame data on its side of
/// the seam; the core only needs the return offset for checkpoint metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub return_ip: u64,
}

/// The persistent stepper state owned by a block.
#[derive(Debug)]
pub struct StepperState {
    /// Instruction offset into the bound program.
    pub ip: u64,
    /// Operand stack.
    pub stack: Vec<Value>,
    /// Call frames.
    pub frames: Vec<Frame>,
    /// Module-level globals.
    pub globals: ValueMap,
    /// Reductions remaining in the current slice. Reset by the scheduler
    /// before every resume.
    pub reductions_left: u32,
    /// Reductions charged past exhaustion this slice. A stepper that
    /// overdraws a whole extra budget without yielding is a runaway and
    /// is crashed at the slice boundary.
    pub overdraft: u32,
}

impl StepperState {
    pub fn new() -> Self {
        StepperState {
            ip: 0,
            stack: Vec::new(),
            frames: Vec::new(),
            globals: FxHashMap::default(),
            reductions_left: 0,
            overdraft: 0,
        }
    }

    /// Push onto the operand stack, honoring the block's stack limit.
    pub fn push(&mut self, value: Value, limits: &Limits) -> Result<(), StepError> {
        if self.stack.len() >= limits.max_stack {
            return Err(StepError::new(
                StepErrorKind::StackOverflow,
                format!("operand stack exceeds {} slots", limits.max_stack),
            ));
        }
        self.stack.push(value);
        Ok(())
    }

    /// Pop from the operand stack.
    pub fn pop(&mut self) -> Result<Value, StepError> {
        self.stack
            .pop()
            .ok_or_else(|| StepError::new(StepErrorKind::StackUnderflow, "operand stack empty"))
    }

    /// Enter a call frame, honoring the block's call-depth limit.
    pub fn enter_frame(&mut self, return_ip: u64, limits: &Limits) -> Result<(), StepError> {
        if self.frames.len() >= limits.max_call_depth {
            return Err(StepError::new(
                StepErrorKind::StackOverflow,
                format!("call depth exceeds {}", limits.max_call_depth),
            ));
        }
        self.frames.push(Frame { return_ip });
        Ok(())
    }

    /// Leave the innermost call frame, restoring its return offset.
    pub fn exit_frame(&mut self) -> Result<(), StepError> {
        let frame = self.frames.pop().ok_or_else(|| {
            StepError::new(StepErrorKind::StackUnderflow, "no call frame to return from")
        })?;
        self.ip = frame.return_ip;
        Ok(())
    }

    /// Read a global, faulting on absence.
    pub fn global(&self, name: &str) -> Result<&Value, StepError> {
        self.globals.get(name).ok_or_else(|| {
            StepError::new(StepErrorKind::UndefinedVariable, name.to_string())
        })
    }

    /// Write a global.
    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }
}

impl Default for StepperState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

/// A bound unit of executable code.
///
/// `resume` runs one slice: the program charges reductions through the
/// context as it works and returns when it completes, suspends, faults, or
/// exhausts its budget. All progress it wants to keep lives in the block's
/// [`StepperState`], reachable through the context -- `resume` will be
/// called again from whatever state it left behind.
pub trait Program: Send + Sync {
    fn resume(&self, cx: &mut BlockRun<'_>) -> StepStatus;
}

/// Adapter running a plain function as a [`Program`].
///
/// The workhorse for built-in programs and tests: the function drives its
/// own little state machine off `cx.stepper().ip`.
pub struct FnProgram<F>(pub F);

impl<F> Program for FnProgram<F>
where
    F: Fn(&mut BlockRun<'_>) -> StepStatus + Send + Sync,
{
    fn resume(&self, cx: &mut BlockRun<'_>) -> StepStatus {
        (self.0)(cx)
    }
}

/// Box a function into a shareable program.
pub fn program_fn<F>(f: F) -> Arc<dyn Program>
where
    F: Fn(&mut BlockRun<'_>) -> StepStatus + Send + Sync + 'static,
{
    Arc::new(FnProgram(f))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tight_limits() -> Limits {
        Limits {
            max_stack: 2,
            max_call_depth: 2,
            ..Limits::default()
        }
    }

    #[test]
    fn test_stack_limit() {
        let limits = tight_limits();
        let mut st = StepperState::new();
        st.push(Value::Int(1), &limits).unwrap();
        st.push(Value::Int(2), &limits).unwrap();
        let err = st.push(Value::Int(3), &limits).unwrap_err();
        assert_eq!(err.kind, StepErrorKind::StackOverflow);
    }

    #[test]
    fn test_stack_underflow() {
        let mut st = StepperState::new();
        let err = st.pop().unwrap_err();
        assert_eq!(err.kind, StepErrorKind::StackUnderflow);
    }

    #[test]
    fn test_frame_depth_limit() {
        let limits = tight_limits();
        let mut st = StepperState::new();
        st.enter_frame(10, &limits).unwrap();
        st.enter_frame(20, &limits).unwrap();
        let err = st.enter_frame(30, &limits).unwrap_err();
        assert_eq!(err.kind, StepErrorKind::StackOverflow);
    }

    #[test]
    fn test_exit_frame_restores_ip() {
        let limits = Limits::default();
        let mut st = StepperState::new();
        st.ip = 5;
        st.enter_frame(5, &limits).unwrap();
        st.ip = 99;
        st.exit_frame().unwrap();
        assert_eq!(st.ip, 5);
        assert!(st.exit_frame().is_err());
    }

    #[test]
    fn test_undefined_global() {
        let mut st = StepperState::new();
        let err = st.global("missing").unwrap_err();
        assert_eq!(err.kind, StepErrorKind::UndefinedVariable);

        st.set_global("n", Value::Int(1));
        assert_eq!(st.global("n").unwrap(), &Value::Int(1));
    }

    #[test]
    fn test_step_error_display() {
        let err = StepError::new(StepErrorKind::DivideByZero, "n / 0");
        assert_eq!(err.to_string(), "divide by zero: n / 0");
    }
}
