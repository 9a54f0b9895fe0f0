//! Work-stealing scheduler for Agim blocks.
//!
//! The scheduler multiplexes blocks across a fixed pool of OS worker
//! threads. Each worker owns a Chase-Lev deque (crossbeam-deque, whose
//! buffers are reclaimed through crossbeam's epoch scheme); newly spawned
//! and newly woken blocks land in a shared injector, and idle workers steal
//! from a random victim, rotating through the pool.
//!
//! ## Slices and preemption
//!
//! A worker claims a block with a CAS on its state word (RUNNABLE ->
//! RUNNING), so no two workers ever run the same block. It then resumes the
//! block's program for one reduction-budgeted slice and dispatches on the
//! result: YIELD re-enqueues locally, WAITING parks the block until a send
//! or timer wakes it, OK/HALT/ERROR enter the termination protocol.
//!
//! ## Wakeups
//!
//! Send is linearizable with the receive transition: a producer pushes,
//! then -- if it observes WAITING -- attempts the WAITING -> RUNNABLE CAS
//! itself and enqueues the block exactly once on success. A receiver
//! entering WAITING re-checks its mailbox once to close the race, so a
//! message pushed after the transition always produces a wakeup.
//!
//! ## Termination
//!
//! The scheduler stops when every spawned block has terminated and no
//! worker holds one: `total_spawned > 0 && total_terminated ==
//! total_spawned && blocks_in_flight == 0`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::Mutex;
use rand::Rng;

use crate::block::{
    Block, BlockState, Caps, ExitReason, ExitStatus, Limits, Message, Pid, CAP_LINK, CAP_MONITOR,
    CAP_SEND, CAP_SPAWN, CAP_TIMER, CAP_TRAP_EXIT,
};
use crate::link;
use crate::mailbox::PushOutcome;
use crate::module::{MigrateFn, ModuleRegistry};
use crate::registry::{BlockRegistry, DEFAULT_SHARDS};
use crate::stepper::{Program, StepError, StepErrorKind, StepStatus};
use crate::supervisor::{SupervisorProgram, SupervisorSpec};
use crate::telemetry::{CounterSnapshot, TraceEvent, TraceEventKind};
use crate::timer::{TimerWheel, DEFAULT_TICK_MS, DEFAULT_WHEEL_SIZE};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Scheduler construction parameters.
#[derive(Clone)]
pub struct SchedulerConfig {
    /// Worker thread count; 0 means one per available CPU core.
    pub workers: usize,
    /// Limits granted to blocks spawned without explicit overrides.
    pub default_limits: Limits,
    /// Capabilities granted by `spawn`. Blocks are born with none and the
    /// scheduler grants these on top.
    pub default_caps: Caps,
    /// Hard cap on concurrently live blocks.
    pub max_blocks: usize,
    /// Timer wheel geometry.
    pub wheel_size: usize,
    pub tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            workers: 0,
            default_limits: Limits::default(),
            default_caps: CAP_SEND | CAP_SPAWN | CAP_LINK | CAP_MONITOR | CAP_TIMER,
            max_blocks: 1_000_000,
            wheel_size: DEFAULT_WHEEL_SIZE,
            tick_ms: DEFAULT_TICK_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a spawn was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    /// The live-block cap was reached.
    LimitReached(usize),
    /// The named module is not loaded.
    UnknownModule(String),
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::LimitReached(max) => write!(f, "block limit reached ({})", max),
            SpawnError::UnknownModule(name) => write!(f, "unknown module '{}'", name),
        }
    }
}

/// Why a send did not take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The target is DEAD or was never registered.
    Dead,
    /// The target mailbox is full under `BlockSender`.
    WouldBlock,
    /// The sender lacks `CAP_SEND`.
    CapabilityDenied,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Dead => write!(f, "target block is dead"),
            SendError::WouldBlock => write!(f, "target mailbox is full"),
            SendError::CapabilityDenied => write!(f, "send capability denied"),
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_spawned: u64,
    pub total_terminated: u64,
    pub active: u64,
    pub blocks_in_flight: u64,
    pub context_switches: u64,
}

/// Point-in-time view of one block, for telemetry aggregation.
#[derive(Debug, Clone)]
pub struct BlockStats {
    pub pid: Pid,
    pub name: Option<String>,
    pub state: BlockState,
    pub mailbox_len: usize,
    pub mailbox_bytes: usize,
    pub counters: CounterSnapshot,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// The scheduler. Owns the PID registry, the timer wheel, the module
/// registry, and the worker pool. Registries are fields, not process-wide
/// singletons: their lifecycle is the scheduler's.
pub struct Scheduler {
    config: SchedulerConfig,
    registry: BlockRegistry,
    timers: TimerWheel,
    modules: ModuleRegistry,
    /// Shared queue for spawned and woken blocks.
    injector: Arc<Injector<Arc<Block>>>,
    /// Steal handles for every worker deque.
    stealers: Vec<Stealer<Arc<Block>>>,
    /// Worker deques, consumed by the threads at startup.
    workers: Mutex<Vec<Option<Worker<Arc<Block>>>>>,
    next_pid: AtomicU64,
    total_spawned: AtomicU64,
    total_terminated: AtomicU64,
    blocks_in_flight: AtomicU64,
    context_switches: AtomicU64,
    shutdown: AtomicBool,
    started: Instant,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let worker_count = if config.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            config.workers
        };

        let mut workers = Vec::with_capacity(worker_count);
        let mut stealers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let w = Worker::new_lifo();
            stealers.push(w.stealer());
            workers.push(Some(w));
        }

        Scheduler {
            timers: TimerWheel::new(config.wheel_size, config.tick_ms),
            config,
            registry: BlockRegistry::new(DEFAULT_SHARDS),
            modules: ModuleRegistry::new(),
            injector: Arc::new(Injector::new()),
            stealers,
            workers: Mutex::new(workers),
            next_pid: AtomicU64::new(1),
            total_spawned: AtomicU64::new(0),
            total_terminated: AtomicU64::new(0),
            blocks_in_flight: AtomicU64::new(0),
            context_switches: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            started: Instant::now(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Milliseconds on the scheduler clock. Drives timers and wait
    /// accounting.
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// Look up a live block.
    pub fn block(&self, pid: Pid) -> Option<Arc<Block>> {
        self.registry.get(pid)
    }

    // -- spawning -----------------------------------------------------------

    /// Spawn a block running `program` with the configured default caps and
    /// limits.
    pub fn spawn(
        &self,
        program: Arc<dyn Program>,
        name: Option<&str>,
    ) -> Result<Pid, SpawnError> {
        self.spawn_with(
            program,
            name,
            self.config.default_caps,
            self.config.default_limits.clone(),
            Pid::INVALID,
        )
    }

    /// Spawn with explicit capabilities, limits, and parent.
    pub fn spawn_with(
        &self,
        program: Arc<dyn Program>,
        name: Option<&str>,
        caps: Caps,
        limits: Limits,
        parent: Pid,
    ) -> Result<Pid, SpawnError> {
        let active = self.active();
        if active >= self.config.max_blocks as u64 {
            return Err(SpawnError::LimitReached(self.config.max_blocks));
        }

        let pid = self.allocate_pid();
        let block = Arc::new(Block::new(pid, name.map(String::from), limits));
        block.load(program);
        block.grant(caps);
        block.set_parent(parent);

        self.adopt_block(block);
        Ok(pid)
    }

    /// Spawn a block bound to the current version of a loaded module.
    ///
    /// The module binding is installed before the block is enqueued, so an
    /// upgrade trigger can never observe a half-bound block.
    pub fn spawn_from_module(
        &self,
        module_name: &str,
        name: Option<&str>,
    ) -> Result<Pid, SpawnError> {
        let version = self
            .modules
            .current(module_name)
            .ok_or_else(|| SpawnError::UnknownModule(module_name.to_string()))?;
        if self.active() >= self.config.max_blocks as u64 {
            return Err(SpawnError::LimitReached(self.config.max_blocks));
        }

        let pid = self.allocate_pid();
        let block = Arc::new(Block::new(
            pid,
            name.map(String::from),
            self.config.default_limits.clone(),
        ));
        block.load(Arc::clone(&version.program));
        block.grant(self.config.default_caps);
        {
            let mut core = block.core();
            core.module_name = Some(module_name.to_string());
            core.module = Some(version);
        }
        self.modules.register_block(module_name, pid);
        self.adopt_block(block);
        Ok(pid)
    }

    /// Spawn a supervisor block. Supervisors always trap exits.
    pub fn spawn_supervisor(
        &self,
        spec: SupervisorSpec,
        name: Option<&str>,
    ) -> Result<Pid, SpawnError> {
        let caps = self.config.default_caps | CAP_TRAP_EXIT | CAP_SPAWN | CAP_LINK | CAP_SEND;
        self.spawn_with(
            Arc::new(SupervisorProgram::new(spec)),
            name,
            caps,
            self.config.default_limits.clone(),
            Pid::INVALID,
        )
    }

    pub(crate) fn allocate_pid(&self) -> Pid {
        Pid(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn default_limits(&self) -> Limits {
        self.config.default_limits.clone()
    }

    /// Register a fully built block and make it runnable. Shared by spawn
    /// and checkpoint restore.
    pub(crate) fn adopt_block(&self, block: Arc<Block>) {
        self.registry.insert(Arc::clone(&block));
        self.total_spawned.fetch_add(1, Ordering::SeqCst);
        self.injector.push(block);
    }

    // -- linking / monitoring ----------------------------------------------

    /// Create a bidirectional link between two live blocks.
    pub fn link(&self, a: Pid, b: Pid) -> bool {
        match (self.registry.get(a), self.registry.get(b)) {
            (Some(a), Some(b)) => {
                link::link(&a, &b);
                true
            }
            _ => false,
        }
    }

    pub fn unlink(&self, a: Pid, b: Pid) -> bool {
        match (self.registry.get(a), self.registry.get(b)) {
            (Some(a), Some(b)) => {
                link::unlink(&a, &b);
                true
            }
            _ => false,
        }
    }

    /// Start monitoring `target` from `watcher`.
    pub fn monitor(&self, watcher: Pid, target: Pid) -> bool {
        match (self.registry.get(watcher), self.registry.get(target)) {
            (Some(w), Some(t)) => {
                link::monitor(&w, &t);
                true
            }
            _ => false,
        }
    }

    pub fn demonitor(&self, watcher: Pid, target: Pid) -> bool {
        match (self.registry.get(watcher), self.registry.get(target)) {
            (Some(w), Some(t)) => {
                link::demonitor(&w, &t);
                true
            }
            _ => false,
        }
    }

    // -- messaging ----------------------------------------------------------

    /// Send a value from `sender` to `target`, applying the send-wrapping
    /// rules and the target's overflow policy.
    pub fn send(&self, sender: Pid, target: Pid, value: Value) -> Result<(), SendError> {
        let sender_block = self.registry.get(sender);
        self.send_message(sender, sender_block.as_ref(), target, value)
    }

    pub(crate) fn send_message(
        &self,
        sender: Pid,
        sender_block: Option<&Arc<Block>>,
        target: Pid,
        value: Value,
    ) -> Result<(), SendError> {
        let target_block = match self.registry.get(target) {
            Some(b) if b.is_alive() => b,
            _ => return Err(SendError::Dead),
        };

        let wrapped = value.wrap_for_send();
        let msg = Message::user(sender, wrapped);

        match self.deliver(&target_block, msg) {
            PushOutcome::Pushed | PushOutcome::CrashReceiver => {
                if let Some(s) = sender_block {
                    s.counters().messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                target_block
                    .counters()
                    .messages_received
                    .fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            // Best-effort delivery: a dropped message is not a send failure.
            PushOutcome::Dropped => Ok(()),
            PushOutcome::WouldBlock => Err(SendError::WouldBlock),
        }
    }

    /// Push a message and perform the producer side of the wake protocol.
    pub(crate) fn deliver(&self, target: &Arc<Block>, msg: Message) -> PushOutcome {
        let outcome = target.mailbox().push(msg, target.limits());

        if matches!(outcome, PushOutcome::Pushed | PushOutcome::CrashReceiver) {
            self.wake(target);
        }
        if outcome == PushOutcome::CrashReceiver {
            self.kill(target.pid(), ExitReason::Crash("mailbox overflow".to_string()));
        }
        outcome
    }

    /// Producer side of the wake protocol: exactly one waker wins the
    /// WAITING -> RUNNABLE CAS and re-enqueues the block.
    pub(crate) fn wake(&self, target: &Arc<Block>) {
        if target.try_transition(BlockState::Waiting, BlockState::Runnable) {
            if let Some(timer) = target.take_pending_timer() {
                timer.cancel();
            }
            target.end_wait(self.now_ms());
            self.injector.push(Arc::clone(target));
        }
    }

    // -- kill / termination -------------------------------------------------

    /// Terminate a block externally.
    ///
    /// A RUNNING block is flagged and terminated at its next slice
    /// boundary; anything else is terminated immediately.
    pub fn kill(&self, pid: Pid, reason: ExitReason) -> bool {
        let Some(block) = self.registry.get(pid) else {
            return false;
        };
        match block.state() {
            BlockState::Dead => false,
            BlockState::Running => {
                block.request_exit(reason);
                true
            }
            _ => {
                self.terminate_block(&block, reason, 1);
                true
            }
        }
    }

    /// The termination protocol (runs exactly once per block).
    ///
    /// Order: mark DEAD, cancel timers, kill supervised children, fan out
    /// exit signals to links, DOWN to monitors, release resources,
    /// unregister.
    pub(crate) fn terminate_block(&self, block: &Arc<Block>, reason: ExitReason, code: i32) {
        let prev = block.mark_dead();
        if prev == BlockState::Dead {
            return;
        }
        if prev == BlockState::Waiting {
            block.end_wait(self.now_ms());
        }
        if let Some(timer) = block.take_pending_timer() {
            timer.cancel();
        }

        // Collect under the core lock. If a runner is mid-slice this waits
        // for the slice to end; the runner then observes DEAD and backs off.
        let (final_reason, module_name, sup_children, tracer) = {
            let mut core = block.core();
            if core.exit.is_none() {
                core.exit = Some(ExitStatus {
                    code,
                    reason: reason.clone(),
                });
            }
            let final_reason = core
                .exit
                .as_ref()
                .map(|e| e.reason.clone())
                .unwrap_or(reason);
            let module_name = core.module_name.take();
            core.module = None;
            let sup_children = core
                .supervisor
                .as_ref()
                .map(|s| s.live_children_reverse())
                .unwrap_or_default();
            core.heap.reset();
            core.save_queue.clear();
            core.program = None;
            (final_reason, module_name, sup_children, core.tracer.clone())
        };
        let links = std::mem::take(&mut *block.links_mut());
        let monitors = std::mem::take(&mut *block.monitors_mut());
        let monitored_by = std::mem::take(&mut *block.monitored_by_mut());

        if let Some(tracer) = &tracer {
            tracer.record(TraceEvent {
                kind: TraceEventKind::Exit,
                pid: block.pid(),
                other: Pid::INVALID,
                at_ms: self.now_ms(),
            });
        }

        // A dying supervisor takes its children down in reverse start
        // order; restarts are suppressed because the supervisor is gone.
        for child in sup_children {
            self.kill(child, ExitReason::Shutdown);
        }

        // Exit signals to linked blocks.
        for pid in links {
            let Some(linked) = self.registry.get(pid) else {
                continue;
            };
            if !linked.is_alive() {
                continue;
            }
            linked.links_mut().remove(&block.pid());

            if final_reason.is_abnormal() && !linked.has_cap(CAP_TRAP_EXIT) {
                // Propagation: the linked block dies with the same reason.
                if linked.state() == BlockState::Running {
                    linked.request_exit(final_reason.clone());
                } else {
                    self.terminate_block(&linked, final_reason.clone(), 1);
                }
            } else {
                let _ = self.deliver(&linked, Message::exit(block.pid(), final_reason.clone()));
            }
        }

        // DOWN messages to watchers. DOWN never propagates exit.
        for pid in monitored_by {
            let Some(watcher) = self.registry.get(pid) else {
                continue;
            };
            if !watcher.is_alive() {
                continue;
            }
            watcher.monitors_mut().remove(&block.pid());
            let _ = self.deliver(&watcher, Message::down(block.pid(), final_reason.clone()));
        }

        // Withdraw our watcher entries from targets that outlive us.
        for pid in monitors {
            if let Some(target) = self.registry.get(pid) {
                target.monitored_by_mut().remove(&block.pid());
            }
        }

        if let Some(name) = module_name {
            self.modules.unregister_block(&name, block.pid());
        }

        // The block is DEAD and unreachable from any deque pop, so the
        // terminating thread is the sole consumer left.
        while block.mailbox().pop().is_some() {}

        self.registry.remove(block.pid());
        self.total_terminated.fetch_add(1, Ordering::SeqCst);
    }

    // -- hot upgrade --------------------------------------------------------

    /// Load a module version; see [`ModuleRegistry::load`].
    pub fn load_module(
        &self,
        name: &str,
        program: Arc<dyn Program>,
        migrate: Option<MigrateFn>,
    ) -> u32 {
        self.modules.load(name, program, migrate)
    }

    /// Flag every block registered against `name` for upgrade at its next
    /// safe point, waking parked ones so they reach it.
    pub fn trigger_upgrade(&self, name: &str) {
        for pid in self.modules.registered(name) {
            if let Some(block) = self.registry.get(pid) {
                block.set_pending_upgrade();
                self.wake(&block);
            }
        }
    }

    /// Re-promote the previous version and re-flag registered blocks.
    pub fn rollback_module(&self, name: &str) -> Result<u32, crate::module::ModuleError> {
        let version = self.modules.rollback(name)?;
        self.trigger_upgrade(name);
        Ok(version)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Run worker threads and block until the termination predicate holds
    /// (or shutdown is signaled and the queues drain).
    pub fn run(&self) {
        let count = self.worker_count();
        crossbeam_utils::thread::scope(|scope| {
            for i in 0..count {
                let local = self.workers.lock()[i].take().expect("worker already consumed");
                let stealers = self.stealers_for(i);
                scope.spawn(move |_| self.worker_loop(local, stealers));
            }
        })
        .expect("scheduler worker panicked");
    }

    /// Start worker threads in the background. Pair with [`Scheduler::wait`].
    pub fn start(self: &Arc<Self>) {
        let count = self.worker_count();
        let mut handles = self.handles.lock();
        for i in 0..count {
            let local = self.workers.lock()[i].take().expect("worker already consumed");
            let stealers = self.stealers_for(i);
            let sched = Arc::clone(self);
            handles.push(std::thread::spawn(move || {
                sched.worker_loop(local, stealers)
            }));
        }
    }

    /// Join background workers started with [`Scheduler::start`].
    pub fn wait(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    fn stealers_for(&self, idx: usize) -> Vec<Stealer<Arc<Block>>> {
        self.stealers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, s)| s.clone())
            .collect()
    }

    // -- stats --------------------------------------------------------------

    pub fn active(&self) -> u64 {
        self.total_spawned
            .load(Ordering::SeqCst)
            .saturating_sub(self.total_terminated.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> SchedulerStats {
        let spawned = self.total_spawned.load(Ordering::SeqCst);
        let terminated = self.total_terminated.load(Ordering::SeqCst);
        SchedulerStats {
            total_spawned: spawned,
            total_terminated: terminated,
            active: spawned.saturating_sub(terminated),
            blocks_in_flight: self.blocks_in_flight.load(Ordering::SeqCst),
            context_switches: self.context_switches.load(Ordering::Relaxed),
        }
    }

    /// Install a tracer sink that forwards every recorded event into
    /// `target`'s mailbox as a user message:
    /// `{"event", "pid", "other", "at_ms"}`.
    pub fn forward_trace(self: &Arc<Self>, tracer: &crate::telemetry::Tracer, target: Pid) {
        let sched = Arc::clone(self);
        tracer.set_sink(Arc::new(move |event| {
            let Some(block) = sched.block(target) else {
                return;
            };
            let mut fields = crate::value::ValueMap::default();
            fields.insert("event".to_string(), Value::str(event.kind.name()));
            fields.insert("pid".to_string(), Value::Int(event.pid.as_u64() as i64));
            fields.insert("other".to_string(), Value::Int(event.other.as_u64() as i64));
            fields.insert("at_ms".to_string(), Value::Int(event.at_ms as i64));
            let _ = sched.deliver(&block, Message::user(event.pid, Value::map(fields)));
        }));
    }

    /// Per-block statistics, one registry shard locked at a time.
    pub fn block_stats(&self) -> Vec<BlockStats> {
        let mut out = Vec::new();
        self.registry.for_each(|block| {
            out.push(BlockStats {
                pid: block.pid(),
                name: block.name().map(String::from),
                state: block.state(),
                mailbox_len: block.mailbox().len(),
                mailbox_bytes: block.mailbox().bytes_used(),
                counters: block.counters().snapshot(),
            });
        });
        out
    }

    // -- worker loop --------------------------------------------------------

    fn worker_loop(&self, local: Worker<Arc<Block>>, stealers: Vec<Stealer<Arc<Block>>>) {
        let mut rng = rand::rng();
        let mut spin: u32 = 0;

        loop {
            if let Some(block) = self.next_block(&local, &stealers, &mut rng) {
                spin = 0;
                self.run_block(&local, block);
                continue;
            }

            // Idle: drive the timer wheel (one worker at a time).
            if let Some(fired) = self.timers.try_tick(self.now_ms()) {
                if !fired.is_empty() {
                    for entry in &fired {
                        entry.fire();
                    }
                    spin = 0;
                    continue;
                }
            }

            if self.should_stop(&local) {
                break;
            }

            // Exponential backoff, 10us doubling to a 1ms cap.
            spin = spin.saturating_add(1);
            if spin <= 50 {
                std::hint::spin_loop();
            } else {
                let exp = (spin - 50).min(7);
                let mut sleep_us = (10u64 << exp).min(1000);
                // Never sleep past the next timer deadline.
                if let Some(deadline) = self.timers.next_deadline() {
                    let until = deadline.saturating_sub(self.now_ms()) * 1000;
                    sleep_us = sleep_us.min(until.max(10));
                }
                std::thread::sleep(Duration::from_micros(sleep_us));
            }
        }
    }

    fn should_stop(&self, local: &Worker<Arc<Block>>) -> bool {
        let spawned = self.total_spawned.load(Ordering::SeqCst);
        let terminated = self.total_terminated.load(Ordering::SeqCst);
        let in_flight = self.blocks_in_flight.load(Ordering::SeqCst);

        // The termination predicate.
        if spawned > 0 && terminated == spawned && in_flight == 0 {
            return true;
        }
        // Explicit shutdown: stop once nothing is queued or held.
        self.shutdown.load(Ordering::SeqCst)
            && in_flight == 0
            && local.is_empty()
            && self.injector.is_empty()
    }

    /// Local pop, then injector, then steal from a random victim rotating
    /// through the pool.
    fn next_block(
        &self,
        local: &Worker<Arc<Block>>,
        stealers: &[Stealer<Arc<Block>>],
        rng: &mut impl Rng,
    ) -> Option<Arc<Block>> {
        if let Some(block) = local.pop() {
            return Some(block);
        }

        loop {
            match self.injector.steal_batch_and_pop(local) {
                Steal::Success(block) => return Some(block),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        if stealers.is_empty() {
            return None;
        }
        let start = rng.random_range(0..stealers.len());
        for i in 0..stealers.len() {
            let stealer = &stealers[(start + i) % stealers.len()];
            loop {
                match stealer.steal() {
                    Steal::Success(block) => return Some(block),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }
        None
    }

    /// Claim and run one block for one reduction slice.
    fn run_block(&self, local: &Worker<Arc<Block>>, block: Arc<Block>) {
        // A DEAD block in a deque is stale; drop the reference.
        if !block.try_transition(BlockState::Runnable, BlockState::Running) {
            return;
        }
        self.blocks_in_flight.fetch_add(1, Ordering::SeqCst);
        self.context_switches.fetch_add(1, Ordering::Relaxed);

        if let Some(reason) = block.take_exit_request() {
            self.terminate_block(&block, reason, 1);
            self.blocks_in_flight.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let budget = block.limits().max_reductions_per_slice;
        let (resumed, overdraft): (Result<StepStatus, String>, u32) = {
            let mut core = block.core();
            core.stepper.reductions_left = budget;
            core.stepper.overdraft = 0;
            let resumed = match core.program.clone() {
                Some(program) => {
                    let mut cx = BlockRun {
                        sched: self,
                        block: &block,
                        core: &mut core,
                    };
                    // A panic must never cross the worker boundary: catch
                    // it, crash the block, keep the worker alive.
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        program.resume(&mut cx)
                    }))
                    .map_err(panic_message)
                }
                None => Ok(StepStatus::Error(StepError::new(
                    StepErrorKind::UndefinedVariable,
                    "no program loaded",
                ))),
            };
            let overdraft = core.stepper.overdraft;
            (resumed, overdraft)
        };

        let status = match resumed {
            Ok(status) => status,
            Err(msg) => {
                self.terminate_block(
                    &block,
                    ExitReason::Crash(format!("stepper panic: {}", msg)),
                    1,
                );
                self.blocks_in_flight.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        };

        // A stepper that charged a whole extra budget without giving up
        // its slice is a runaway.
        if overdraft > budget && matches!(status, StepStatus::Yield | StepStatus::Waiting) {
            self.terminate_block(
                &block,
                ExitReason::Crash("reduction cap exceeded".to_string()),
                1,
            );
            self.blocks_in_flight.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        match status {
            StepStatus::Yield => {
                if let Some(reason) = block.take_exit_request() {
                    self.terminate_block(&block, reason, 1);
                } else if block.try_transition(BlockState::Running, BlockState::Runnable) {
                    local.push(block);
                }
                // CAS failure: terminated externally mid-slice; the
                // DEAD block is never re-enqueued.
            }
            StepStatus::Waiting => {
                // The receive path already performed RUNNING -> WAITING
                // (or lost its claim to a waker, which enqueued the
                // block). Nothing to do unless an exit was requested.
                if let Some(reason) = block.take_exit_request() {
                    self.terminate_block(&block, reason, 1);
                }
            }
            StepStatus::Ok | StepStatus::Halt => {
                let (code, reason) = block
                    .exit_status()
                    .map(|e| (e.code, e.reason))
                    .unwrap_or((0, ExitReason::Normal));
                self.terminate_block(&block, reason, code);
            }
            StepStatus::Error(err) => {
                self.terminate_block(&block, ExitReason::Crash(err.to_string()), 1);
            }
        }

        self.blocks_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Best-effort extraction of a panic payload's message.
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.stealers.len())
            .field("stats", &self.stats())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Receive API
// ---------------------------------------------------------------------------

/// How long a receive waits for a matching message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveTimeout {
    /// Return immediately when nothing matches.
    NoWait,
    /// Wait up to this many milliseconds.
    After(u64),
    /// Wait until a matching message arrives.
    Infinite,
}

/// Outcome of a receive attempt.
#[derive(Debug)]
pub enum Receive {
    /// The first matching message.
    Message(Message),
    /// The timeout elapsed (or was zero) with nothing matching.
    TimedOut,
    /// The block is parked WAITING; the program must return
    /// [`StepStatus::Waiting`] and retry the receive when resumed.
    Suspended,
}

/// Predicate for selective receive.
pub type Matcher<'m> = &'m dyn Fn(&Message) -> bool;

// ---------------------------------------------------------------------------
// BlockRun -- the stepper's view of the runtime
// ---------------------------------------------------------------------------

/// Execution context handed to a program for one slice.
///
/// Holds the block's core lock for the duration of the slice, which is what
/// makes the private heap and stepper state single-writer.
pub struct BlockRun<'a> {
    sched: &'a Scheduler,
    block: &'a Arc<Block>,
    core: &'a mut crate::block::BlockCore,
}

impl<'a> BlockRun<'a> {
    pub fn pid(&self) -> Pid {
        self.block.pid()
    }

    pub fn sched(&self) -> &Scheduler {
        self.sched
    }

    pub fn limits(&self) -> &Limits {
        self.block.limits()
    }

    pub fn stepper(&self) -> &crate::stepper::StepperState {
        &self.core.stepper
    }

    pub fn stepper_mut(&mut self) -> &mut crate::stepper::StepperState {
        &mut self.core.stepper
    }

    pub fn heap_mut(&mut self) -> &mut crate::heap::BlockHeap {
        &mut self.core.heap
    }

    pub fn has_cap(&self, cap: Caps) -> bool {
        self.block.has_cap(cap)
    }

    fn require_cap(&self, cap: Caps, what: &str) -> Result<(), StepError> {
        if self.block.has_cap(cap) {
            Ok(())
        } else {
            Err(StepError::new(StepErrorKind::CapabilityDenied, what))
        }
    }

    /// Charge `n` reductions. Returns false once the slice budget is
    /// exhausted; the program should then return [`StepStatus::Yield`].
    /// Charging a whole extra budget past exhaustion marks the stepper a
    /// runaway, which the scheduler crashes at the slice boundary.
    pub fn charge(&mut self, n: u32) -> bool {
        self.block
            .counters()
            .reductions
            .fetch_add(n as u64, Ordering::Relaxed);
        let stepper = &mut self.core.stepper;
        if stepper.reductions_left >= n {
            stepper.reductions_left -= n;
            stepper.reductions_left > 0
        } else {
            stepper.overdraft = stepper.overdraft.saturating_add(n - stepper.reductions_left);
            stepper.reductions_left = 0;
            false
        }
    }

    /// Record the exit slot the termination protocol will publish when the
    /// program returns [`StepStatus::Halt`].
    pub fn set_exit_status(&mut self, code: i32, reason: ExitReason) {
        self.core.exit = Some(ExitStatus { code, reason });
    }

    fn trace(&self, kind: TraceEventKind, other: Pid) {
        if let Some(tracer) = &self.core.tracer {
            tracer.record(TraceEvent {
                kind,
                pid: self.block.pid(),
                other,
                at_ms: self.sched.now_ms(),
            });
        }
    }

    // -- gated operations ---------------------------------------------------

    /// Send a value to another block.
    pub fn send(&mut self, target: Pid, value: Value) -> Result<(), SendError> {
        if !self.block.has_cap(CAP_SEND) {
            return Err(SendError::CapabilityDenied);
        }
        self.trace(TraceEventKind::Send, target);
        self.sched
            .send_message(self.block.pid(), Some(self.block), target, value)
    }

    /// Spawn a child block with the scheduler's default caps and limits.
    pub fn spawn(&mut self, program: Arc<dyn Program>) -> Result<Pid, StepError> {
        self.require_cap(CAP_SPAWN, "spawn")?;
        let pid = self
            .sched
            .spawn_with(
                program,
                None,
                self.sched.config.default_caps,
                self.sched.config.default_limits.clone(),
                self.block.pid(),
            )
            .map_err(|e| StepError::new(StepErrorKind::SendFailed, e.to_string()))?;
        self.trace(TraceEventKind::Spawn, pid);
        Ok(pid)
    }

    /// Link this block to another.
    pub fn link(&mut self, other: Pid) -> Result<(), StepError> {
        self.require_cap(CAP_LINK, "link")?;
        let target = self.sched.registry.get(other).ok_or_else(|| {
            StepError::new(StepErrorKind::SendFailed, format!("link target {} is dead", other))
        })?;
        link::link(self.block, &target);
        self.trace(TraceEventKind::Link, other);
        Ok(())
    }

    pub fn unlink(&mut self, other: Pid) -> Result<(), StepError> {
        self.require_cap(CAP_LINK, "unlink")?;
        if let Some(target) = self.sched.registry.get(other) {
            link::unlink(self.block, &target);
        }
        self.trace(TraceEventKind::Unlink, other);
        Ok(())
    }

    /// Monitor another block; a DOWN message arrives when it terminates.
    pub fn monitor(&mut self, target: Pid) -> Result<(), StepError> {
        self.require_cap(CAP_MONITOR, "monitor")?;
        let target_block = self.sched.registry.get(target).ok_or_else(|| {
            StepError::new(
                StepErrorKind::SendFailed,
                format!("monitor target {} is dead", target),
            )
        })?;
        link::monitor(self.block, &target_block);
        Ok(())
    }

    pub fn demonitor(&mut self, target: Pid) -> Result<(), StepError> {
        self.require_cap(CAP_MONITOR, "demonitor")?;
        if let Some(target_block) = self.sched.registry.get(target) {
            link::demonitor(self.block, &target_block);
        }
        Ok(())
    }

    /// Record a collection cycle. The collector itself lives outside the
    /// core; this hook keeps the per-block counter and trace honest.
    pub fn gc(&mut self) {
        self.block.counters().gc_cycles.fetch_add(1, Ordering::Relaxed);
        self.trace(TraceEventKind::Gc, Pid::INVALID);
    }

    // -- receive ------------------------------------------------------------

    /// Selective receive.
    ///
    /// Replays the save queue first, then drains the mailbox, parking
    /// non-matching messages in the save queue in order. With nothing
    /// matching: `NoWait` reports a timeout immediately, `After` arms a
    /// timer and suspends, `Infinite` suspends until a push wakes the
    /// block. On [`Receive::Suspended`] the program must return
    /// [`StepStatus::Waiting`] and re-issue the receive when resumed.
    pub fn receive(&mut self, matcher: Option<Matcher<'_>>, timeout: ReceiveTimeout) -> Receive {
        // A previously armed receive timer expired while we were parked.
        if self.block.take_timeout_fired() {
            self.block.take_pending_timer();
            return Receive::TimedOut;
        }

        let matches = |msg: &Message| matcher.map(|m| m(msg)).unwrap_or(true);

        loop {
            // 1. Replay messages set aside by earlier passes.
            if let Some(idx) = self.core.save_queue.iter().position(|m| matches(m)) {
                let msg = self.core.save_queue.remove(idx).unwrap();
                self.complete_receive(&msg);
                return Receive::Message(msg);
            }

            // 2. Drain the mailbox, saving non-matching messages in order.
            while let Some(msg) = self.block.mailbox().pop() {
                if matches(&msg) {
                    self.complete_receive(&msg);
                    return Receive::Message(msg);
                }
                self.core.save_queue.push_back(msg);
            }

            // 3. Nothing matched.
            match timeout {
                ReceiveTimeout::NoWait => return Receive::TimedOut,
                ReceiveTimeout::After(_) | ReceiveTimeout::Infinite => {
                    if !self.block.try_transition(BlockState::Running, BlockState::Waiting) {
                        // Externally terminated mid-slice; just release.
                        return Receive::Suspended;
                    }
                    let now = self.sched.now_ms();
                    self.block.begin_wait(now);

                    if let ReceiveTimeout::After(ms) = timeout {
                        self.arm_receive_timer(now, ms);
                    }

                    // Race-closing pass: a push that landed between the
                    // drain and the transition must not strand us.
                    if !self.block.mailbox().is_empty() {
                        if self
                            .block
                            .try_transition(BlockState::Waiting, BlockState::Running)
                        {
                            // Claim retained; disarm and retry.
                            self.block.end_wait(self.sched.now_ms());
                            if let Some(timer) = self.block.take_pending_timer() {
                                timer.cancel();
                            }
                            continue;
                        }
                        // A waker won the CAS and enqueued us; release
                        // the slice without touching state.
                    }
                    return Receive::Suspended;
                }
            }
        }
    }

    fn complete_receive(&mut self, msg: &Message) {
        // Completing a receive cancels any pending timer.
        if let Some(timer) = self.block.take_pending_timer() {
            timer.cancel();
        }
        self.trace(TraceEventKind::Receive, msg.sender);
    }

    fn arm_receive_timer(&mut self, now_ms: u64, timeout_ms: u64) {
        let block = Arc::clone(self.block);
        let injector = Arc::clone(&self.sched.injector);
        let started = self.sched.started;
        let entry = self.sched.timers.add(
            self.block.pid(),
            now_ms,
            timeout_ms,
            Box::new(move || {
                // Consumer of the wake edge: only the CAS winner enqueues.
                if block.try_transition(BlockState::Waiting, BlockState::Runnable) {
                    block.set_timeout_fired();
                    block.end_wait(started.elapsed().as_millis() as u64);
                    injector.push(Arc::clone(&block));
                }
            }),
        );
        self.block.set_pending_timer(entry);
    }

    /// Park this block for at least `ms` milliseconds.
    ///
    /// Suspension point: the program must return [`StepStatus::Waiting`]
    /// after calling this. An incoming message wakes the block early.
    pub fn sleep(&mut self, ms: u64) -> Result<(), StepError> {
        self.require_cap(CAP_TIMER, "sleep")?;
        if !self.block.try_transition(BlockState::Running, BlockState::Waiting) {
            return Ok(());
        }
        let now = self.sched.now_ms();
        self.block.begin_wait(now);

        let block = Arc::clone(self.block);
        let injector = Arc::clone(&self.sched.injector);
        let started = self.sched.started;
        let entry = self.sched.timers.add(
            self.block.pid(),
            now,
            ms,
            Box::new(move || {
                if block.try_transition(BlockState::Waiting, BlockState::Runnable) {
                    block.end_wait(started.elapsed().as_millis() as u64);
                    injector.push(Arc::clone(&block));
                }
            }),
        );
        self.block.set_pending_timer(entry);
        Ok(())
    }

    // -- supervisor state ---------------------------------------------------

    /// Detach the supervisor state for the duration of a slice.
    pub(crate) fn take_supervisor_state(
        &mut self,
    ) -> Option<crate::supervisor::SupervisorState> {
        self.core.supervisor.take()
    }

    /// Reattach the supervisor state before returning from a slice.
    pub(crate) fn put_supervisor_state(&mut self, state: crate::supervisor::SupervisorState) {
        self.core.supervisor = Some(state);
    }

    // -- hot upgrade safe point --------------------------------------------

    /// The upgrade safe point. If an upgrade is pending, migrate globals
    /// through the new version's migrate hook, rebind the program, and
    /// clear the flag. Returns true when a rebind happened; the new code
    /// runs from the next resume.
    pub fn check_upgrade(&mut self) -> bool {
        if !self.block.take_pending_upgrade() {
            return false;
        }
        let Some(name) = self.core.module_name.clone() else {
            return false;
        };
        let Some(next) = self.sched.modules.current(&name) else {
            return false;
        };
        let bound_version = self.core.module.as_ref().map(|m| m.version).unwrap_or(0);
        if next.version == bound_version {
            return false;
        }

        if let Some(migrate) = &next.migrate {
            let old = std::mem::take(&mut self.core.stepper.globals);
            self.core.stepper.globals = migrate(old, bound_version);
        }
        self.core.program = Some(Arc::clone(&next.program));
        self.core.module = Some(next);
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MessageTag;
    use crate::stepper::program_fn;
    use std::sync::atomic::AtomicU64;

    fn small_sched(workers: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            workers,
            ..SchedulerConfig::default()
        })
    }

    fn counting_program(counter: &Arc<AtomicU64>) -> Arc<dyn Program> {
        let counter = Arc::clone(counter);
        program_fn(move |_cx| {
            counter.fetch_add(1, Ordering::SeqCst);
            StepStatus::Ok
        })
    }

    #[test]
    fn test_spawn_unique_pids() {
        let sched = small_sched(2);
        let counter = Arc::new(AtomicU64::new(0));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let pid = sched.spawn(counting_program(&counter), None).unwrap();
            assert!(pid.is_valid());
            assert!(seen.insert(pid.as_u64()), "duplicate PID {}", pid);
        }
    }

    #[test]
    fn test_single_block_completes() {
        let sched = small_sched(1);
        let counter = Arc::new(AtomicU64::new(0));
        let pid = sched.spawn(counting_program(&counter), None).unwrap();
        let block = sched.block(pid).unwrap();

        sched.run();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(block.state(), BlockState::Dead);
        assert_eq!(block.exit_status().unwrap().reason, ExitReason::Normal);
        assert!(sched.block(pid).is_none(), "dead block is unregistered");

        let stats = sched.stats();
        assert_eq!(stats.total_spawned, 1);
        assert_eq!(stats.total_terminated, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.blocks_in_flight, 0);
    }

    #[test]
    fn test_many_blocks_complete_across_workers() {
        let sched = small_sched(4);
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..200 {
            sched.spawn(counting_program(&counter), None).unwrap();
        }
        sched.run();
        assert_eq!(counter.load(Ordering::SeqCst), 200);
        assert_eq!(sched.stats().active, 0);
    }

    #[test]
    fn test_yielding_block_still_completes() {
        let sched = small_sched(2);
        let counter = Arc::new(AtomicU64::new(0));
        let done = Arc::clone(&counter);
        // Yields five times (tracked through ip) before finishing.
        sched
            .spawn(
                program_fn(move |cx| {
                    if cx.stepper().ip < 5 {
                        cx.stepper_mut().ip += 1;
                        return StepStatus::Yield;
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                    StepStatus::Ok
                }),
                None,
            )
            .unwrap();
        sched.run();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_yielding_block_does_not_starve_others() {
        let sched = small_sched(1);
        let counter = Arc::new(AtomicU64::new(0));
        let yielder_done = Arc::clone(&counter);
        sched
            .spawn(
                program_fn(move |cx| {
                    if cx.stepper().ip < 20 {
                        cx.stepper_mut().ip += 1;
                        return StepStatus::Yield;
                    }
                    yielder_done.fetch_add(1, Ordering::SeqCst);
                    StepStatus::Ok
                }),
                None,
            )
            .unwrap();
        for _ in 0..5 {
            sched.spawn(counting_program(&counter), None).unwrap();
        }
        sched.run();
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_crash_reports_reason() {
        let sched = small_sched(1);
        let pid = sched
            .spawn(
                program_fn(|_cx| {
                    StepStatus::Error(StepError::new(StepErrorKind::DivideByZero, "1 / 0"))
                }),
                None,
            )
            .unwrap();
        let block = sched.block(pid).unwrap();
        sched.run();

        let exit = block.exit_status().unwrap();
        assert!(matches!(exit.reason, ExitReason::Crash(_)));
        assert!(exit.reason.to_string().contains("divide by zero"));
    }

    #[test]
    fn test_send_receive_between_blocks() {
        let sched = small_sched(2);
        let got = Arc::new(AtomicU64::new(0));

        let got_clone = Arc::clone(&got);
        let receiver = sched
            .spawn(
                program_fn(move |cx| match cx.receive(None, ReceiveTimeout::Infinite) {
                    Receive::Message(msg) => {
                        got_clone.store(msg.payload.as_int().unwrap() as u64, Ordering::SeqCst);
                        StepStatus::Ok
                    }
                    Receive::Suspended => StepStatus::Waiting,
                    Receive::TimedOut => StepStatus::Ok,
                }),
                None,
            )
            .unwrap();

        let sender = sched
            .spawn(
                program_fn(move |cx| {
                    cx.send(receiver, Value::Int(7)).unwrap();
                    StepStatus::Ok
                }),
                None,
            )
            .unwrap();
        let sender_block = sched.block(sender).unwrap();
        let receiver_block = sched.block(receiver).unwrap();

        sched.run();

        assert_eq!(got.load(Ordering::SeqCst), 7);
        assert_eq!(sender_block.counters().snapshot().messages_sent, 1);
        assert_eq!(receiver_block.counters().snapshot().messages_received, 1);
    }

    #[test]
    fn test_receive_nowait_times_out_immediately() {
        let sched = small_sched(1);
        let outcome = Arc::new(AtomicU64::new(0));
        let outcome_clone = Arc::clone(&outcome);
        sched
            .spawn(
                program_fn(move |cx| {
                    match cx.receive(None, ReceiveTimeout::NoWait) {
                        Receive::TimedOut => outcome_clone.store(1, Ordering::SeqCst),
                        _ => outcome_clone.store(2, Ordering::SeqCst),
                    }
                    StepStatus::Ok
                }),
                None,
            )
            .unwrap();
        sched.run();
        assert_eq!(outcome.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_receive_timeout_fires() {
        let sched = small_sched(2);
        let outcome = Arc::new(AtomicU64::new(0));
        let outcome_clone = Arc::clone(&outcome);
        sched
            .spawn(
                program_fn(move |cx| {
                    match cx.receive(None, ReceiveTimeout::After(30)) {
                        Receive::TimedOut => {
                            outcome_clone.store(1, Ordering::SeqCst);
                            StepStatus::Ok
                        }
                        Receive::Suspended => StepStatus::Waiting,
                        Receive::Message(_) => {
                            outcome_clone.store(2, Ordering::SeqCst);
                            StepStatus::Ok
                        }
                    }
                }),
                None,
            )
            .unwrap();
        sched.run();
        assert_eq!(outcome.load(Ordering::SeqCst), 1, "timeout should fire");
    }

    #[test]
    fn test_selective_receive_saves_nonmatching() {
        let sched = small_sched(2);
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_clone = Arc::clone(&order);
        let receiver = sched
            .spawn(
                program_fn(move |cx| {
                    // First pass: match only 99. Second pass: take anything.
                    if cx.stepper().ip == 0 {
                        let want_99 =
                            |m: &Message| m.payload.as_int() == Some(99);
                        match cx.receive(Some(&want_99), ReceiveTimeout::Infinite) {
                            Receive::Message(msg) => {
                                order_clone.lock().push(msg.payload.as_int().unwrap());
                                cx.stepper_mut().ip = 1;
                            }
                            Receive::Suspended => return StepStatus::Waiting,
                            Receive::TimedOut => return StepStatus::Ok,
                        }
                    }
                    loop {
                        match cx.receive(None, ReceiveTimeout::NoWait) {
                            Receive::Message(msg) => {
                                order_clone.lock().push(msg.payload.as_int().unwrap())
                            }
                            _ => return StepStatus::Ok,
                        }
                    }
                }),
                None,
            )
            .unwrap();

        sched
            .spawn(
                program_fn(move |cx| {
                    for n in [1i64, 2, 99] {
                        cx.send(receiver, Value::Int(n)).unwrap();
                    }
                    StepStatus::Ok
                }),
                None,
            )
            .unwrap();

        sched.run();

        // 99 is taken first; 1 and 2 replay from the save queue in order.
        assert_eq!(*order.lock(), vec![99, 1, 2]);
    }

    #[test]
    fn test_kill_terminates_waiting_block() {
        let sched = Arc::new(small_sched(2));
        let pid = sched
            .spawn(
                program_fn(|cx| match cx.receive(None, ReceiveTimeout::Infinite) {
                    Receive::Suspended => StepStatus::Waiting,
                    _ => StepStatus::Ok,
                }),
                None,
            )
            .unwrap();
        let block = sched.block(pid).unwrap();

        sched.start();
        // Wait for the block to park.
        let deadline = Instant::now() + Duration::from_secs(2);
        while block.state() != BlockState::Waiting && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(block.state(), BlockState::Waiting);

        assert!(sched.kill(pid, ExitReason::Killed));
        sched.wait();

        assert_eq!(block.exit_status().unwrap().reason, ExitReason::Killed);
    }

    #[test]
    fn test_link_propagates_crash() {
        let sched = small_sched(2);
        let victim = sched
            .spawn(
                program_fn(|cx| match cx.receive(None, ReceiveTimeout::Infinite) {
                    Receive::Suspended => StepStatus::Waiting,
                    _ => StepStatus::Ok,
                }),
                None,
            )
            .unwrap();
        let crasher = sched
            .spawn(
                program_fn(|cx| {
                    // Give the victim a slice to park first.
                    if cx.stepper().ip < 3 {
                        cx.stepper_mut().ip += 1;
                        return StepStatus::Yield;
                    }
                    StepStatus::Error(StepError::new(StepErrorKind::DivideByZero, "n / 0"))
                }),
                None,
            )
            .unwrap();
        assert!(sched.link(victim, crasher));
        let victim_block = sched.block(victim).unwrap();

        sched.run();

        let exit = victim_block.exit_status().unwrap();
        assert!(matches!(exit.reason, ExitReason::Crash(_)), "{:?}", exit);
    }

    #[test]
    fn test_trap_exit_delivers_message_instead() {
        let sched = small_sched(2);
        let got_exit = Arc::new(AtomicU64::new(0));

        let got_clone = Arc::clone(&got_exit);
        let watcher = sched
            .spawn(
                program_fn(move |cx| match cx.receive(None, ReceiveTimeout::Infinite) {
                    Receive::Message(msg) => {
                        if let MessageTag::Exit(reason) = &msg.tag {
                            if reason.is_abnormal() {
                                got_clone.store(msg.sender.as_u64(), Ordering::SeqCst);
                            }
                        }
                        StepStatus::Ok
                    }
                    Receive::Suspended => StepStatus::Waiting,
                    Receive::TimedOut => StepStatus::Ok,
                }),
                None,
            )
            .unwrap();
        sched.block(watcher).unwrap().grant(CAP_TRAP_EXIT);

        let crasher = sched
            .spawn(
                program_fn(|_cx| {
                    StepStatus::Error(StepError::new(StepErrorKind::OutOfBounds, "xs[9]"))
                }),
                None,
            )
            .unwrap();
        sched.link(watcher, crasher);
        let watcher_block = sched.block(watcher).unwrap();

        sched.run();

        assert_eq!(got_exit.load(Ordering::SeqCst), crasher.as_u64());
        assert_eq!(
            watcher_block.exit_status().unwrap().reason,
            ExitReason::Normal,
            "trapping block survives the crash and exits on its own"
        );
    }

    #[test]
    fn test_send_to_dead_block_fails() {
        let sched = small_sched(1);
        let counter = Arc::new(AtomicU64::new(0));
        let pid = sched.spawn(counting_program(&counter), None).unwrap();
        sched.run();

        assert_eq!(sched.send(Pid::INVALID, pid, Value::Int(1)), Err(SendError::Dead));
    }

    #[test]
    fn test_capability_denied_without_cap_send() {
        let sched = small_sched(1);
        let outcome = Arc::new(AtomicU64::new(0));
        let outcome_clone = Arc::clone(&outcome);
        let pid = sched
            .spawn(
                program_fn(move |cx| {
                    match cx.send(Pid(12345), Value::Nil) {
                        Err(SendError::CapabilityDenied) => {
                            outcome_clone.store(1, Ordering::SeqCst)
                        }
                        _ => outcome_clone.store(2, Ordering::SeqCst),
                    }
                    StepStatus::Ok
                }),
                None,
            )
            .unwrap();
        // Strip the default caps before the block first runs.
        sched.block(pid).unwrap().revoke(CAP_SEND);
        sched.run();
        assert_eq!(outcome.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawn_limit() {
        let sched = Scheduler::new(SchedulerConfig {
            workers: 1,
            max_blocks: 2,
            ..SchedulerConfig::default()
        });
        let counter = Arc::new(AtomicU64::new(0));
        sched.spawn(counting_program(&counter), None).unwrap();
        sched.spawn(counting_program(&counter), None).unwrap();
        assert_eq!(
            sched.spawn(counting_program(&counter), None),
            Err(SpawnError::LimitReached(2))
        );
    }

    #[test]
    fn test_reductions_counted() {
        let sched = small_sched(1);
        let pid = sched
            .spawn(
                program_fn(|cx| {
                    for _ in 0..100 {
                        cx.charge(1);
                    }
                    StepStatus::Ok
                }),
                None,
            )
            .unwrap();
        let block = sched.block(pid).unwrap();
        sched.run();
        assert_eq!(block.counters().snapshot().reductions, 100);
    }

    #[test]
    fn test_charge_exhausts_budget() {
        let sched = Scheduler::new(SchedulerConfig {
            workers: 1,
            default_limits: Limits {
                max_reductions_per_slice: 10,
                ..Limits::default()
            },
            ..SchedulerConfig::default()
        });
        let slices = Arc::new(AtomicU64::new(0));
        let slices_clone = Arc::clone(&slices);
        sched
            .spawn(
                program_fn(move |cx| {
                    slices_clone.fetch_add(1, Ordering::SeqCst);
                    // Burn the whole budget, then yield; finish on slice 3.
                    while cx.charge(1) {}
                    if cx.stepper().ip >= 2 {
                        return StepStatus::Ok;
                    }
                    cx.stepper_mut().ip += 1;
                    StepStatus::Yield
                }),
                None,
            )
            .unwrap();
        sched.run();
        assert_eq!(slices.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_no_lost_wakeup() {
        // A push racing the WAITING transition must always wake the block.
        let sched = Arc::new(small_sched(2));
        let got = Arc::new(AtomicU64::new(0));

        let got_clone = Arc::clone(&got);
        let receiver = sched
            .spawn(
                program_fn(move |cx| match cx.receive(None, ReceiveTimeout::Infinite) {
                    Receive::Message(_) => {
                        got_clone.fetch_add(1, Ordering::SeqCst);
                        StepStatus::Ok
                    }
                    Receive::Suspended => StepStatus::Waiting,
                    Receive::TimedOut => StepStatus::Ok,
                }),
                None,
            )
            .unwrap();

        sched.start();
        // Fire the send from outside with no synchronization against the
        // receiver's parking; delivery must wake it regardless.
        std::thread::sleep(Duration::from_millis(5));
        sched.send(Pid::INVALID, receiver, Value::Int(1)).unwrap();
        sched.wait();

        assert_eq!(got.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_runaway_stepper_crashes() {
        let sched = Scheduler::new(SchedulerConfig {
            workers: 1,
            default_limits: Limits {
                max_reductions_per_slice: 100,
                ..Limits::default()
            },
            ..SchedulerConfig::default()
        });
        // Ignores the exhausted budget and keeps charging before yielding.
        let pid = sched
            .spawn(
                program_fn(|cx| {
                    for _ in 0..500 {
                        cx.charge(1);
                    }
                    StepStatus::Yield
                }),
                None,
            )
            .unwrap();
        let block = sched.block(pid).unwrap();
        sched.run();

        let exit = block.exit_status().unwrap();
        assert_eq!(
            exit.reason,
            ExitReason::Crash("reduction cap exceeded".to_string())
        );
    }

    #[test]
    fn test_spawn_from_module_binds_and_registers() {
        let sched = small_sched(1);
        assert_eq!(
            sched.spawn_from_module("missing", None),
            Err(SpawnError::UnknownModule("missing".to_string()))
        );

        sched.load_module("m", program_fn(|_| StepStatus::Ok), None);
        let pid = sched.spawn_from_module("m", Some("w")).unwrap();
        assert_eq!(sched.modules().registered("m"), vec![pid]);

        sched.run();
        // Termination unbinds the block from the module registry.
        assert!(sched.modules().registered("m").is_empty());
    }

    #[test]
    fn test_panic_crashes_block_not_worker() {
        let sched = small_sched(1);
        let done = Arc::new(AtomicU64::new(0));

        let panicker = sched
            .spawn(
                program_fn(|_cx| panic!("stepper blew up")),
                Some("panicker"),
            )
            .unwrap();
        let panicker_block = sched.block(panicker).unwrap();
        sched.spawn(counting_program(&done), None).unwrap();

        sched.run();

        // The worker survived the panic and ran the other block.
        assert_eq!(done.load(Ordering::SeqCst), 1);
        let exit = panicker_block.exit_status().unwrap();
        match exit.reason {
            ExitReason::Crash(msg) => assert!(msg.contains("stepper blew up"), "{}", msg),
            other => panic!("expected crash, got {:?}", other),
        }
    }

    #[test]
    fn test_block_stats_aggregation() {
        let sched = small_sched(1);
        let a = sched
            .spawn(program_fn(|_| StepStatus::Ok), Some("a"))
            .unwrap();
        sched.send(Pid::INVALID, a, Value::Int(1)).unwrap();

        let stats = sched.block_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].pid, a);
        assert_eq!(stats[0].name.as_deref(), Some("a"));
        assert_eq!(stats[0].state, BlockState::Runnable);
        assert_eq!(stats[0].mailbox_len, 1);
        assert_eq!(stats[0].counters.messages_received, 1);
    }

    #[test]
    fn test_tracer_records_and_forwards_to_pid() {
        use crate::telemetry::Tracer;

        let sched = Arc::new(small_sched(2));

        // Sink block: parks forever collecting forwarded events.
        let sink = sched
            .spawn(
                program_fn(|cx| match cx.receive(None, ReceiveTimeout::Infinite) {
                    Receive::Suspended => StepStatus::Waiting,
                    _ => StepStatus::Waiting,
                }),
                Some("sink"),
            )
            .unwrap();
        let sink_block = sched.block(sink).unwrap();

        // Traced block: one send, then exit.
        let traced = sched
            .spawn(
                program_fn(move |cx| {
                    cx.send(sink, Value::Int(1)).unwrap();
                    StepStatus::Ok
                }),
                Some("traced"),
            )
            .unwrap();
        let traced_block = sched.block(traced).unwrap();
        let tracer = Arc::new(Tracer::new(16));
        traced_block.set_tracer(Arc::clone(&tracer));
        sched.forward_trace(&tracer, sink);

        sched.start();
        // The Exit event lands at the tail of the termination protocol, so
        // poll for it rather than for the DEAD transition.
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            let kinds: Vec<TraceEventKind> = tracer.snapshot().iter().map(|e| e.kind).collect();
            if kinds.contains(&TraceEventKind::Exit) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let kinds: Vec<TraceEventKind> = tracer.snapshot().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&TraceEventKind::Send), "{:?}", kinds);
        assert!(kinds.contains(&TraceEventKind::Exit), "{:?}", kinds);

        // The sink saw the user message plus the forwarded events.
        assert!(sink_block.mailbox().len() >= 2);

        sched.kill(sink, ExitReason::Killed);
        sched.wait();
    }

    #[test]
    fn test_run_with_shutdown_and_no_blocks() {
        let sched = small_sched(2);
        sched.signal_shutdown();
        // Returns promptly: shutdown + empty queues.
        sched.run();
        assert_eq!(sched.stats().total_spawned, 0);
    }
}
