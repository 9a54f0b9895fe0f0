//! Agim runtime core.
//!
//! This crate is the concurrent execution substrate for Agim agent
//! populations: lightweight isolated processes ("blocks") that communicate
//! only by asynchronous message passing, scheduled preemptively by
//! reduction budget across a pool of work-stealing OS threads, with
//! capability-gated access to the outside world and supervisor-based fault
//! tolerance.
//!
//! ## Modules
//!
//! - [`value`]: The tagged value sum with retain / copy-on-write /
//!   deep-copy send wrapping.
//! - [`mailbox`]: Lock-free MPSC mailbox with bounded size and overflow
//!   policies.
//! - [`timer`]: Hashed timer wheel driving receive timeouts and sleeps.
//! - [`block`]: The process control block -- state machine, capabilities,
//!   limits, counters, link and monitor sets.
//! - [`heap`]: The narrow per-block heap accounting interface.
//! - [`stepper`]: The seam to the bytecode interpreter -- a [`Program`]
//!   resumed in reduction-budgeted slices.
//! - [`registry`]: Sharded PID registry.
//! - [`sched`]: The work-stealing scheduler, worker loop, send/wake
//!   protocol, and termination protocol.
//! - [`link`]: Bidirectional links and one-way monitors.
//! - [`supervisor`]: Child specs, restart strategies, restart-rate windows.
//! - [`module`]: Versioned module registry and hot code upgrade.
//! - [`codec`]: Self-describing TLV value serialization.
//! - [`checkpoint`]: Block capture/restore and the on-disk store.
//! - [`dist`]: TCP node links -- handshake, heartbeat, framed messages,
//!   nodedown monitors.
//! - [`telemetry`]: Per-block counters and the ring-buffered tracer.
//!
//! ## A minimal population
//!
//! ```no_run
//! use std::sync::Arc;
//! use agim_rt::{
//!     program_fn, Receive, ReceiveTimeout, Scheduler, SchedulerConfig, StepStatus, Value,
//! };
//!
//! let sched = Scheduler::new(SchedulerConfig::default());
//!
//! let echo = sched
//!     .spawn(
//!         program_fn(|cx| match cx.receive(None, ReceiveTimeout::Infinite) {
//!             Receive::Message(msg) => {
//!                 let _ = cx.send(msg.sender, msg.payload.clone());
//!                 StepStatus::Ok
//!             }
//!             Receive::Suspended => StepStatus::Waiting,
//!             Receive::TimedOut => StepStatus::Ok,
//!         }),
//!         Some("echo"),
//!     )
//!     .unwrap();
//!
//! sched
//!     .spawn(
//!         program_fn(move |cx| {
//!             cx.send(echo, Value::str("ping")).unwrap();
//!             StepStatus::Ok
//!         }),
//!         None,
//!     )
//!     .unwrap();
//!
//! sched.run();
//! ```

pub mod block;
pub mod checkpoint;
pub mod codec;
pub mod dist;
pub mod heap;
pub mod link;
pub mod mailbox;
pub mod module;
pub mod registry;
pub mod sched;
pub mod stepper;
pub mod supervisor;
pub mod telemetry;
pub mod timer;
pub mod value;

pub use block::{
    Block, BlockState, Caps, ExitReason, ExitStatus, Limits, Message, MessageTag, Pid, CAP_CHECKPOINT,
    CAP_FS, CAP_INFER, CAP_LINK, CAP_MONITOR, CAP_NET, CAP_NONE, CAP_SEND, CAP_SHELL, CAP_SPAWN,
    CAP_TIMER, CAP_TRAP_EXIT,
};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointManager};
pub use codec::CodecError;
pub use dist::{DeliverFn, Node, NodeConfig, NodeError};
pub use mailbox::{Mailbox, OverflowPolicy, PushOutcome};
pub use module::{MigrateFn, ModuleError, ModuleRegistry, ModuleVersion};
pub use sched::{
    BlockRun, BlockStats, Matcher, Receive, ReceiveTimeout, Scheduler, SchedulerConfig,
    SchedulerStats, SendError, SpawnError,
};
pub use stepper::{program_fn, FnProgram, Program, StepError, StepErrorKind, StepStatus};
pub use supervisor::{
    ChildInfo, ChildSpec, RestartPolicy, Strategy, SupervisorInfo, SupervisorProgram,
    SupervisorSpec,
};
pub use telemetry::{CounterSnapshot, Counters, TraceEvent, TraceEventKind, Tracer};
pub use timer::{TimerEntry, TimerWheel};
pub use value::{Value, ValueMap};
