//! The block: one isolated Agim process.
//!
//! A block owns its stepper state, private heap, mailbox, link/monitor sets,
//! capability set, and resource counters. Blocks are multiplexed across OS
//! threads by the scheduler; the state word is atomic and every transition
//! goes through CAS, so two workers can never run the same block at once.
//!
//! Mutable per-block state that only the current runner (or the termination
//! protocol) touches lives behind the `core` mutex. Hot fields crossed by
//! senders and timers -- the state word, capability set, counters, the
//! pending-timer slot and the wake flags -- are kept outside it so message
//! delivery never contends with a running slice.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashSet;

use crate::heap::BlockHeap;
use crate::mailbox::{Mailbox, OverflowPolicy};
use crate::stepper::{Program, StepperState};
use crate::supervisor::SupervisorState;
use crate::telemetry::Counters;
use crate::timer::TimerEntry;
use crate::value::{Value, ValueMap};

// ---------------------------------------------------------------------------
// Pid
// ---------------------------------------------------------------------------

/// Unique identifier for a block.
///
/// PIDs are allocated from the scheduler's monotonic counter and are unique
/// for the scheduler's lifetime; they are never reused while any link,
/// monitor, or mailbox still references them. Zero is reserved as invalid.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u64);

impl Pid {
    /// The reserved invalid PID.
    pub const INVALID: Pid = Pid(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// A block's permission set: one bit per gated operation class.
pub type Caps = u64;

pub const CAP_NONE: Caps = 0;
pub const CAP_SEND: Caps = 1 << 0;
pub const CAP_SPAWN: Caps = 1 << 1;
pub const CAP_LINK: Caps = 1 << 2;
pub const CAP_MONITOR: Caps = 1 << 3;
pub const CAP_TIMER: Caps = 1 << 4;
/// Exit signals from linked blocks arrive as messages instead of killing
/// this block. Supervisors always hold it.
pub const CAP_TRAP_EXIT: Caps = 1 << 5;
pub const CAP_INFER: Caps = 1 << 6;
pub const CAP_SHELL: Caps = 1 << 7;
pub const CAP_FS: Caps = 1 << 8;
pub const CAP_NET: Caps = 1 << 9;
pub const CAP_CHECKPOINT: Caps = 1 << 10;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Per-block resource bounds, snapshotted at spawn.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Private heap bound in bytes.
    pub max_heap: usize,
    /// Operand stack bound in slots.
    pub max_stack: usize,
    /// Call frame depth bound.
    pub max_call_depth: usize,
    /// Reduction budget per scheduling slice.
    pub max_reductions_per_slice: u32,
    /// Mailbox bound in messages.
    pub max_mailbox_msgs: usize,
    /// Mailbox bound in payload bytes.
    pub max_mailbox_bytes: usize,
    /// What happens when a push would exceed the mailbox bounds.
    pub overflow: OverflowPolicy,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_heap: 16 * 1024 * 1024,
            max_stack: 1024,
            max_call_depth: 256,
            max_reductions_per_slice: 4000,
            max_mailbox_msgs: 10_000,
            max_mailbox_bytes: 16 * 1024 * 1024,
            overflow: OverflowPolicy::DropNew,
        }
    }
}

// ---------------------------------------------------------------------------
// ExitReason / ExitStatus
// ---------------------------------------------------------------------------

/// Why a block terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The program completed.
    Normal,
    /// Runtime error; carries the fault message.
    Crash(String),
    /// Externally killed.
    Killed,
    /// Supervisor-initiated stop (or supervisor escalation).
    Shutdown,
    /// A deadline expired.
    Timeout,
}

impl ExitReason {
    /// Abnormal exits propagate death over links; normal and shutdown
    /// exits are delivered to linked blocks as messages only.
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, ExitReason::Normal | ExitReason::Shutdown)
    }

    /// Stable one-word label used on the wire and in checkpoints.
    pub fn label(&self) -> &'static str {
        match self {
            ExitReason::Normal => "normal",
            ExitReason::Crash(_) => "crash",
            ExitReason::Killed => "killed",
            ExitReason::Shutdown => "shutdown",
            ExitReason::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Crash(msg) => write!(f, "crash: {}", msg),
            other => f.write_str(other.label()),
        }
    }
}

/// A DEAD block's populated exit slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
    pub reason: ExitReason,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Classification of a mailbox message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageTag {
    /// Ordinary user payload.
    User,
    /// Synthetic exit signal from a linked block that terminated.
    Exit(ExitReason),
    /// Monitor notification for a watched block that terminated.
    Down(ExitReason),
    /// A monitored peer node disconnected.
    NodeDown(String),
}

/// One mailbox message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub sender: Pid,
    pub tag: MessageTag,
    pub payload: Value,
}

impl Message {
    pub fn user(sender: Pid, payload: Value) -> Self {
        Message {
            sender,
            tag: MessageTag::User,
            payload,
        }
    }

    pub fn exit(from: Pid, reason: ExitReason) -> Self {
        Message {
            sender: from,
            tag: MessageTag::Exit(reason),
            payload: Value::Nil,
        }
    }

    pub fn down(from: Pid, reason: ExitReason) -> Self {
        Message {
            sender: from,
            tag: MessageTag::Down(reason),
            payload: Value::Nil,
        }
    }

    pub fn node_down(node: String) -> Self {
        Message {
            sender: Pid::INVALID,
            tag: MessageTag::NodeDown(node),
            payload: Value::Nil,
        }
    }

    /// Approximate size for mailbox byte accounting.
    pub fn approx_bytes(&self) -> usize {
        const ENVELOPE: usize = 32;
        ENVELOPE + self.payload.approx_bytes()
    }
}

// ---------------------------------------------------------------------------
// BlockState
// ---------------------------------------------------------------------------

/// The atomic execution state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    /// On exactly one deque (or about to be), ready to run.
    Runnable = 0,
    /// Held by exactly one worker.
    Running = 1,
    /// Suspended in a receive; woken by a push or a timer.
    Waiting = 2,
    /// Terminated; never re-enqueued.
    Dead = 3,
}

impl BlockState {
    fn from_u8(v: u8) -> BlockState {
        match v {
            0 => BlockState::Runnable,
            1 => BlockState::Running,
            2 => BlockState::Waiting,
            _ => BlockState::Dead,
        }
    }
}

// ---------------------------------------------------------------------------
// BlockCore
// ---------------------------------------------------------------------------

/// State mutated only while holding the block (running it or terminating it).
pub struct BlockCore {
    pub stepper: StepperState,
    pub program: Option<Arc<dyn Program>>,
    pub heap: BlockHeap,
    /// Messages set aside by selective receive, replayed oldest-first.
    pub save_queue: std::collections::VecDeque<Message>,
    /// Module this block is registered against, for hot upgrade.
    pub module_name: Option<String>,
    /// Version the stepper is currently bound to. The Arc keeps old
    /// versions alive until their last binding migrates away.
    pub module: Option<Arc<crate::module::ModuleVersion>>,
    /// Present iff this block is a supervisor.
    pub supervisor: Option<SupervisorState>,
    pub tracer: Option<Arc<crate::telemetry::Tracer>>,
    /// Populated exactly once, when the block goes DEAD.
    pub exit: Option<ExitStatus>,
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// The process control block.
pub struct Block {
    pid: Pid,
    name: Option<String>,
    parent: AtomicU64,
    state: AtomicU8,
    mailbox: Mailbox,
    limits: Limits,
    caps: AtomicU64,
    counters: Counters,
    /// Set by an expired receive timer; consumed by the next receive.
    timeout_fired: AtomicBool,
    /// Set by the module registry; consumed at the upgrade safe point.
    pending_upgrade: AtomicBool,
    /// Externally requested termination, honored at the next slice boundary.
    exit_request: Mutex<Option<ExitReason>>,
    /// The receive timer currently armed for this block, if any.
    pending_timer: Mutex<Option<Arc<TimerEntry>>>,
    /// Scheduler-clock instant this block entered WAITING; 0 when not
    /// waiting. Feeds the wait_time counter.
    wait_since_ms: AtomicU64,
    /// Symmetric links: both sides die together on abnormal exit. Kept
    /// outside the core so link bookkeeping (including by other blocks'
    /// termination protocols) never contends with a running slice. Each
    /// set is locked on its own, one at a time.
    links: Mutex<FxHashSet<Pid>>,
    /// Blocks this block watches.
    monitors: Mutex<FxHashSet<Pid>>,
    /// Blocks watching this block; DOWN fan-out targets.
    monitored_by: Mutex<FxHashSet<Pid>>,
    core: Mutex<BlockCore>,
}

impl Block {
    /// Create a RUNNABLE block with an empty mailbox and no capabilities.
    pub fn new(pid: Pid, name: Option<String>, limits: Limits) -> Block {
        let heap = BlockHeap::new(limits.max_heap);
        Block {
            pid,
            name,
            parent: AtomicU64::new(Pid::INVALID.0),
            state: AtomicU8::new(BlockState::Runnable as u8),
            mailbox: Mailbox::new(),
            limits,
            caps: AtomicU64::new(CAP_NONE),
            counters: Counters::default(),
            timeout_fired: AtomicBool::new(false),
            pending_upgrade: AtomicBool::new(false),
            exit_request: Mutex::new(None),
            pending_timer: Mutex::new(None),
            wait_since_ms: AtomicU64::new(0),
            links: Mutex::new(FxHashSet::default()),
            monitors: Mutex::new(FxHashSet::default()),
            monitored_by: Mutex::new(FxHashSet::default()),
            core: Mutex::new(BlockCore {
                stepper: StepperState::new(),
                program: None,
                heap,
                save_queue: std::collections::VecDeque::new(),
                module_name: None,
                module: None,
                supervisor: None,
                tracer: None,
                exit: None,
            }),
        }
    }

    /// Bind a program. Must happen before the first run.
    pub fn load(&self, program: Arc<dyn Program>) {
        self.core.lock().program = Some(program);
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn parent(&self) -> Pid {
        Pid(self.parent.load(Ordering::Relaxed))
    }

    pub(crate) fn set_parent(&self, parent: Pid) {
        self.parent.store(parent.0, Ordering::Relaxed);
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    // -- state machine ------------------------------------------------------

    pub fn state(&self) -> BlockState {
        BlockState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// CAS a state transition. Every transition in the runtime goes through
    /// here; success means this caller owns the edge.
    pub fn try_transition(&self, from: BlockState, to: BlockState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally become DEAD. Returns the previous state so the
    /// caller can tell whether it won the termination edge.
    pub(crate) fn mark_dead(&self) -> BlockState {
        BlockState::from_u8(self.state.swap(BlockState::Dead as u8, Ordering::AcqRel))
    }

    pub fn is_alive(&self) -> bool {
        self.state() != BlockState::Dead
    }

    // -- capabilities -------------------------------------------------------

    pub fn has_cap(&self, cap: Caps) -> bool {
        self.caps.load(Ordering::Relaxed) & cap == cap
    }

    pub fn grant(&self, caps: Caps) {
        self.caps.fetch_or(caps, Ordering::Relaxed);
    }

    pub fn revoke(&self, caps: Caps) {
        self.caps.fetch_and(!caps, Ordering::Relaxed);
    }

    pub fn caps(&self) -> Caps {
        self.caps.load(Ordering::Relaxed)
    }

    // -- wake bookkeeping ---------------------------------------------------

    pub(crate) fn set_timeout_fired(&self) {
        self.timeout_fired.store(true, Ordering::Release);
    }

    pub(crate) fn take_timeout_fired(&self) -> bool {
        self.timeout_fired.swap(false, Ordering::AcqRel)
    }

    pub fn pending_upgrade(&self) -> bool {
        self.pending_upgrade.load(Ordering::Acquire)
    }

    pub(crate) fn set_pending_upgrade(&self) {
        self.pending_upgrade.store(true, Ordering::Release);
    }

    pub(crate) fn take_pending_upgrade(&self) -> bool {
        self.pending_upgrade.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn request_exit(&self, reason: ExitReason) {
        let mut slot = self.exit_request.lock();
        // First request wins; Killed overrides a softer pending reason.
        if slot.is_none() || matches!(reason, ExitReason::Killed) {
            *slot = Some(reason);
        }
    }

    pub(crate) fn take_exit_request(&self) -> Option<ExitReason> {
        self.exit_request.lock().take()
    }

    pub(crate) fn set_pending_timer(&self, entry: Arc<TimerEntry>) {
        *self.pending_timer.lock() = Some(entry);
    }

    /// Detach and return the armed receive timer, if any.
    pub(crate) fn take_pending_timer(&self) -> Option<Arc<TimerEntry>> {
        self.pending_timer.lock().take()
    }

    pub(crate) fn begin_wait(&self, now_ms: u64) {
        // 0 means "not waiting", so pin the clock to at least 1.
        self.wait_since_ms.store(now_ms.max(1), Ordering::Relaxed);
    }

    pub(crate) fn end_wait(&self, now_ms: u64) {
        let since = self.wait_since_ms.swap(0, Ordering::Relaxed);
        if since != 0 {
            self.counters
                .wait_time_ms
                .fetch_add(now_ms.saturating_sub(since), Ordering::Relaxed);
        }
    }

    // -- core access --------------------------------------------------------

    /// Lock the core. Held by the running worker for the duration of a
    /// slice, and briefly by the termination protocol.
    pub(crate) fn core(&self) -> MutexGuard<'_, BlockCore> {
        self.core.lock()
    }

    /// Populate the exit slot and become DEAD. Returns the previous state;
    /// the exit slot is written only by the first caller.
    pub fn set_exit(&self, code: i32, reason: ExitReason) -> BlockState {
        {
            let mut core = self.core.lock();
            if core.exit.is_none() {
                core.exit = Some(ExitStatus { code, reason });
            }
        }
        self.mark_dead()
    }

    /// Normal termination with an exit code.
    pub fn exit(&self, code: i32) -> BlockState {
        self.set_exit(code, ExitReason::Normal)
    }

    /// Faulting termination with an attached message.
    pub fn crash(&self, reason: impl Into<String>) -> BlockState {
        self.set_exit(1, ExitReason::Crash(reason.into()))
    }

    /// The exit slot, populated once the block is DEAD.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.core.lock().exit.clone()
    }

    /// Snapshot of the stepper globals. Introspection and tests.
    pub fn globals(&self) -> ValueMap {
        self.core.lock().stepper.globals.clone()
    }

    /// Snapshot of the link set.
    pub fn links(&self) -> Vec<Pid> {
        let mut links: Vec<Pid> = self.links.lock().iter().copied().collect();
        links.sort_unstable();
        links
    }

    /// Snapshot of the set of blocks this block monitors.
    pub fn monitors(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.monitors.lock().iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub(crate) fn links_mut(&self) -> MutexGuard<'_, FxHashSet<Pid>> {
        self.links.lock()
    }

    pub(crate) fn monitors_mut(&self) -> MutexGuard<'_, FxHashSet<Pid>> {
        self.monitors.lock()
    }

    pub(crate) fn monitored_by_mut(&self) -> MutexGuard<'_, FxHashSet<Pid>> {
        self.monitored_by.lock()
    }

    /// Attach a tracer. Events recorded from the next slice on.
    pub fn set_tracer(&self, tracer: Arc<crate::telemetry::Tracer>) {
        self.core.lock().tracer = Some(tracer);
    }

    pub fn tracer(&self) -> Option<Arc<crate::telemetry::Tracer>> {
        self.core.lock().tracer.clone()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("mailbox_len", &self.mailbox.len())
            .field("caps", &format_args!("{:#x}", self.caps()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
