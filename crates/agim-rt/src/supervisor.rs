//! Supervision: child specs, restart strategies, restart-rate windows.
//!
//! A supervisor is an ordinary block that traps exits and runs the built-in
//! [`SupervisorProgram`]. It starts its children in order (spawn + link),
//! then sits in a receive loop handling the synthetic EXIT messages the
//! termination protocol delivers for linked children. Restart decisions are
//! made per child policy and gated by sliding restart-rate windows, both
//! per child and supervisor-wide; exceeding either terminates every child
//! in reverse start order and makes the supervisor itself exit with reason
//! `shutdown`, escalating to its own parent.
//!
//! The child table lives in the supervisor block's own state and is only
//! touched while the supervisor is running.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::block::{Block, ExitReason, MessageTag, Pid};
use crate::sched::{BlockRun, Receive, ReceiveTimeout, Scheduler};
use crate::stepper::{Program, StepStatus};

// ---------------------------------------------------------------------------
// Strategy / RestartPolicy
// ---------------------------------------------------------------------------

/// Which children are restarted when one exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Restart only the failed child.
    OneForOne,
    /// Terminate and restart all children.
    OneForAll,
    /// Terminate and restart the failed child and all children started
    /// after it.
    RestForOne,
}

/// When a child is eligible for restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Always restart, whatever the exit reason.
    Permanent,
    /// Restart only on abnormal exit (crash, kill, timeout).
    Transient,
    /// Never restart; the child is removed from the table on exit.
    Temporary,
}

// ---------------------------------------------------------------------------
// ChildSpec / SupervisorSpec
// ---------------------------------------------------------------------------

/// Static description of one supervised child.
#[derive(Clone)]
pub struct ChildSpec {
    /// Identifier within the supervisor, also the spawned block's name.
    pub name: String,
    pub program: Arc<dyn Program>,
    pub restart: RestartPolicy,
    /// Per-child restart budget within the window.
    pub max_restarts: u32,
    pub restart_window_ms: u64,
}

impl std::fmt::Debug for ChildSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSpec")
            .field("name", &self.name)
            .field("restart", &self.restart)
            .field("max_restarts", &self.max_restarts)
            .field("restart_window_ms", &self.restart_window_ms)
            .finish()
    }
}

/// Configuration for a supervisor block.
#[derive(Debug, Clone)]
pub struct SupervisorSpec {
    pub strategy: Strategy,
    /// Supervisor-wide restart budget within the window.
    pub max_restarts: u32,
    pub restart_window_ms: u64,
    pub children: Vec<ChildSpec>,
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

/// Dynamic state of one child.
#[derive(Debug)]
pub struct ChildState {
    pub spec: ChildSpec,
    pub pid: Option<Pid>,
    pub running: bool,
    /// Restart timestamps inside the per-child window.
    restarts: VecDeque<u64>,
    pub restart_count: u64,
}

impl ChildState {
    fn new(spec: ChildSpec) -> Self {
        ChildState {
            spec,
            pid: None,
            running: false,
            restarts: VecDeque::new(),
            restart_count: 0,
        }
    }
}

/// The supervisor's complete runtime state, held in its block.
#[derive(Debug)]
pub struct SupervisorState {
    pub strategy: Strategy,
    pub max_restarts: u32,
    pub restart_window_ms: u64,
    pub children: Vec<ChildState>,
    /// Restart timestamps inside the supervisor-wide window.
    restart_history: VecDeque<u64>,
    pub total_restarts: u64,
}

impl SupervisorState {
    pub fn from_spec(spec: &SupervisorSpec) -> Self {
        SupervisorState {
            strategy: spec.strategy,
            max_restarts: spec.max_restarts,
            restart_window_ms: spec.restart_window_ms,
            children: spec.children.iter().cloned().map(ChildState::new).collect(),
            restart_history: VecDeque::new(),
            total_restarts: 0,
        }
    }

    pub fn running_count(&self) -> usize {
        self.children.iter().filter(|c| c.running).count()
    }

    /// Live child PIDs in reverse start order, for ordered shutdown.
    pub fn live_children_reverse(&self) -> Vec<Pid> {
        self.children
            .iter()
            .rev()
            .filter(|c| c.running)
            .filter_map(|c| c.pid)
            .collect()
    }
}

/// Introspection view of a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorInfo {
    pub strategy: Strategy,
    pub total_restarts: u64,
    pub children: Vec<ChildInfo>,
}

#[derive(Debug, Clone)]
pub struct ChildInfo {
    pub name: String,
    pub pid: Option<Pid>,
    pub running: bool,
    pub restart_count: u64,
}

impl Block {
    /// Snapshot of this block's supervisor state, if it is a supervisor.
    pub fn supervisor_info(&self) -> Option<SupervisorInfo> {
        let core = self.core();
        core.supervisor.as_ref().map(|s| SupervisorInfo {
            strategy: s.strategy,
            total_restarts: s.total_restarts,
            children: s
                .children
                .iter()
                .map(|c| ChildInfo {
                    name: c.spec.name.clone(),
                    pid: c.pid,
                    running: c.running,
                    restart_count: c.restart_count,
                })
                .collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Restart window
// ---------------------------------------------------------------------------

/// Sliding-window admission: prune entries older than the window, refuse
/// when the budget is spent, record otherwise.
fn allow_restart(history: &mut VecDeque<u64>, max: u32, window_ms: u64, now_ms: u64) -> bool {
    while let Some(&oldest) = history.front() {
        if now_ms.saturating_sub(oldest) > window_ms {
            history.pop_front();
        } else {
            break;
        }
    }
    if history.len() >= max as usize {
        return false;
    }
    history.push_back(now_ms);
    true
}

// ---------------------------------------------------------------------------
// Child lifecycle
// ---------------------------------------------------------------------------

/// Spawn one child and link the supervisor to it.
pub(crate) fn start_child(
    sched: &Scheduler,
    sup_pid: Pid,
    child: &mut ChildState,
) -> Result<Pid, String> {
    let pid = sched
        .spawn(Arc::clone(&child.spec.program), Some(&child.spec.name))
        .map_err(|e| format!("child '{}' failed to start: {}", child.spec.name, e))?;
    if !sched.link(sup_pid, pid) {
        return Err(format!("child '{}' died before linking", child.spec.name));
    }
    child.pid = Some(pid);
    child.running = true;
    Ok(pid)
}

/// Start children `[from_idx, end)` in forward order. On failure,
/// terminate the ones started in this batch, in reverse order.
pub(crate) fn start_children_from(
    sched: &Scheduler,
    sup_pid: Pid,
    state: &mut SupervisorState,
    from_idx: usize,
) -> Result<(), String> {
    for i in from_idx..state.children.len() {
        if state.children[i].running {
            continue;
        }
        if let Err(e) = start_child(sched, sup_pid, &mut state.children[i]) {
            terminate_children_from(sched, sup_pid, state, from_idx);
            return Err(e);
        }
    }
    Ok(())
}

/// Stop one child: unlink first so the supervisor does not observe the
/// shutdown as a child failure, then kill.
pub(crate) fn terminate_child(sched: &Scheduler, sup_pid: Pid, child: &mut ChildState) {
    if let Some(pid) = child.pid.take() {
        sched.unlink(sup_pid, pid);
        sched.kill(pid, ExitReason::Shutdown);
    }
    child.running = false;
}

/// Stop children `[from_idx, end)` in reverse start order.
pub(crate) fn terminate_children_from(
    sched: &Scheduler,
    sup_pid: Pid,
    state: &mut SupervisorState,
    from_idx: usize,
) {
    for i in (from_idx..state.children.len()).rev() {
        if state.children[i].running {
            terminate_child(sched, sup_pid, &mut state.children[i]);
        }
    }
}

/// Stop every child in reverse start order.
pub(crate) fn terminate_all_children(sched: &Scheduler, sup_pid: Pid, state: &mut SupervisorState) {
    terminate_children_from(sched, sup_pid, state, 0);
}

// ---------------------------------------------------------------------------
// Exit handling
// ---------------------------------------------------------------------------

/// React to a child exit observed through an EXIT message.
///
/// `Err` means a restart-rate limit was exceeded: the caller terminates
/// everything and escalates.
pub(crate) fn handle_child_exit(
    sched: &Scheduler,
    sup_pid: Pid,
    state: &mut SupervisorState,
    from: Pid,
    reason: &ExitReason,
) -> Result<(), String> {
    let Some(idx) = state.children.iter().position(|c| c.pid == Some(from)) else {
        // Not one of ours (or a child we already stopped deliberately).
        return Ok(());
    };
    state.children[idx].running = false;
    state.children[idx].pid = None;

    let policy = state.children[idx].spec.restart;
    if policy == RestartPolicy::Temporary {
        state.children.remove(idx);
        return Ok(());
    }
    let should_restart = match policy {
        RestartPolicy::Permanent => true,
        RestartPolicy::Transient => reason.is_abnormal(),
        RestartPolicy::Temporary => false,
    };
    if !should_restart {
        return Ok(());
    }

    let now = sched.now_ms();
    {
        let child = &mut state.children[idx];
        if !allow_restart(
            &mut child.restarts,
            child.spec.max_restarts,
            child.spec.restart_window_ms,
            now,
        ) {
            return Err(format!(
                "child '{}' exceeded {} restarts in {} ms",
                child.spec.name, child.spec.max_restarts, child.spec.restart_window_ms
            ));
        }
    }
    if !allow_restart(
        &mut state.restart_history,
        state.max_restarts,
        state.restart_window_ms,
        now,
    ) {
        return Err(format!(
            "supervisor exceeded {} restarts in {} ms",
            state.max_restarts, state.restart_window_ms
        ));
    }

    state.children[idx].restart_count += 1;
    state.total_restarts += 1;

    apply_strategy(sched, sup_pid, state, idx)
}

/// Apply the restart strategy after an eligible child exit.
pub(crate) fn apply_strategy(
    sched: &Scheduler,
    sup_pid: Pid,
    state: &mut SupervisorState,
    failed_idx: usize,
) -> Result<(), String> {
    match state.strategy {
        Strategy::OneForOne => {
            start_child(sched, sup_pid, &mut state.children[failed_idx])?;
        }
        Strategy::OneForAll => {
            terminate_all_children(sched, sup_pid, state);
            start_children_from(sched, sup_pid, state, 0)?;
        }
        Strategy::RestForOne => {
            terminate_children_from(sched, sup_pid, state, failed_idx + 1);
            start_children_from(sched, sup_pid, state, failed_idx)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SupervisorProgram
// ---------------------------------------------------------------------------

/// The program every supervisor block runs.
pub struct SupervisorProgram {
    spec: SupervisorSpec,
}

impl SupervisorProgram {
    pub fn new(spec: SupervisorSpec) -> Self {
        SupervisorProgram { spec }
    }
}

impl Program for SupervisorProgram {
    fn resume(&self, cx: &mut BlockRun<'_>) -> StepStatus {
        let sup_pid = cx.pid();

        // First slice: build the child table and start everything.
        let mut state = match cx.take_supervisor_state() {
            Some(state) => state,
            None => {
                let mut state = SupervisorState::from_spec(&self.spec);
                if start_children_from(cx.sched(), sup_pid, &mut state, 0).is_err() {
                    cx.set_exit_status(1, ExitReason::Shutdown);
                    cx.put_supervisor_state(state);
                    return StepStatus::Halt;
                }
                state
            }
        };

        loop {
            if !cx.charge(1) {
                cx.put_supervisor_state(state);
                return StepStatus::Yield;
            }
            match cx.receive(None, ReceiveTimeout::Infinite) {
                Receive::Suspended => {
                    cx.put_supervisor_state(state);
                    return StepStatus::Waiting;
                }
                Receive::TimedOut => {
                    cx.put_supervisor_state(state);
                    return StepStatus::Yield;
                }
                Receive::Message(msg) => {
                    if let MessageTag::Exit(reason) = &msg.tag {
                        if let Err(_limit) =
                            handle_child_exit(cx.sched(), sup_pid, &mut state, msg.sender, reason)
                        {
                            // Escalate: stop everything, exit `shutdown`.
                            terminate_all_children(cx.sched(), sup_pid, &mut state);
                            cx.set_exit_status(1, ExitReason::Shutdown);
                            cx.put_supervisor_state(state);
                            return StepStatus::Halt;
                        }
                    }
                    // Anything else in a supervisor mailbox is ignored.
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::SchedulerConfig;
    use crate::stepper::program_fn;

    fn test_sched() -> Scheduler {
        // No workers started: children sit queued, which is all the
        // strategy logic needs.
        Scheduler::new(SchedulerConfig {
            workers: 1,
            ..SchedulerConfig::default()
        })
    }

    fn noop_spec(name: &str, restart: RestartPolicy) -> ChildSpec {
        ChildSpec {
            name: name.to_string(),
            program: program_fn(|_| StepStatus::Ok),
            restart,
            max_restarts: 3,
            restart_window_ms: 5000,
        }
    }

    fn setup(
        sched: &Scheduler,
        strategy: Strategy,
        specs: Vec<ChildSpec>,
    ) -> (SupervisorState, Pid) {
        let sup_pid = sched
            .spawn(program_fn(|_| StepStatus::Ok), Some("sup"))
            .unwrap();
        // The real SupervisorProgram always runs with trap-exit; these
        // tests drive the strategy functions directly, so grant it here.
        sched
            .block(sup_pid)
            .unwrap()
            .grant(crate::block::CAP_TRAP_EXIT);
        let mut state = SupervisorState::from_spec(&SupervisorSpec {
            strategy,
            max_restarts: 10,
            restart_window_ms: 5000,
            children: specs,
        });
        start_children_from(sched, sup_pid, &mut state, 0).unwrap();
        (state, sup_pid)
    }

    fn crash_child(sched: &Scheduler, state: &mut SupervisorState, idx: usize) -> Pid {
        let pid = state.children[idx].pid.unwrap();
        // Simulate the crash the EXIT message reports.
        sched.kill(pid, ExitReason::Crash("boom".to_string()));
        pid
    }

    #[test]
    fn test_start_children_links_supervisor() {
        let sched = test_sched();
        let specs = vec![
            noop_spec("a", RestartPolicy::Permanent),
            noop_spec("b", RestartPolicy::Permanent),
        ];
        let (state, sup_pid) = setup(&sched, Strategy::OneForOne, specs);

        assert_eq!(state.running_count(), 2);
        for child in &state.children {
            let block = sched.block(child.pid.unwrap()).unwrap();
            assert_eq!(block.links(), vec![sup_pid]);
        }
    }

    #[test]
    fn test_one_for_one_restarts_only_failed() {
        let sched = test_sched();
        let specs = vec![
            noop_spec("a", RestartPolicy::Permanent),
            noop_spec("b", RestartPolicy::Permanent),
            noop_spec("c", RestartPolicy::Permanent),
        ];
        let (mut state, sup_pid) = setup(&sched, Strategy::OneForOne, specs);
        let initial: Vec<Pid> = state.children.iter().map(|c| c.pid.unwrap()).collect();

        let crashed = crash_child(&sched, &mut state, 1);
        handle_child_exit(
            &sched,
            sup_pid,
            &mut state,
            crashed,
            &ExitReason::Crash("boom".to_string()),
        )
        .unwrap();

        assert_eq!(state.children[0].pid.unwrap(), initial[0]);
        assert_ne!(state.children[1].pid.unwrap(), initial[1]);
        assert_eq!(state.children[2].pid.unwrap(), initial[2]);
        assert!(state.children[1].running);
        assert_eq!(state.children[1].restart_count, 1);
        assert_eq!(state.total_restarts, 1);
    }

    #[test]
    fn test_one_for_all_restarts_everything() {
        let sched = test_sched();
        let specs = vec![
            noop_spec("a", RestartPolicy::Permanent),
            noop_spec("b", RestartPolicy::Permanent),
            noop_spec("c", RestartPolicy::Permanent),
        ];
        let (mut state, sup_pid) = setup(&sched, Strategy::OneForAll, specs);
        let initial: Vec<Pid> = state.children.iter().map(|c| c.pid.unwrap()).collect();

        let crashed = crash_child(&sched, &mut state, 1);
        handle_child_exit(
            &sched,
            sup_pid,
            &mut state,
            crashed,
            &ExitReason::Crash("boom".to_string()),
        )
        .unwrap();

        for (i, child) in state.children.iter().enumerate() {
            assert_ne!(child.pid.unwrap(), initial[i], "child {} must restart", i);
            assert!(child.running);
        }
    }

    #[test]
    fn test_rest_for_one_restarts_suffix() {
        let sched = test_sched();
        let specs = vec![
            noop_spec("a", RestartPolicy::Permanent),
            noop_spec("b", RestartPolicy::Permanent),
            noop_spec("c", RestartPolicy::Permanent),
        ];
        let (mut state, sup_pid) = setup(&sched, Strategy::RestForOne, specs);
        let initial: Vec<Pid> = state.children.iter().map(|c| c.pid.unwrap()).collect();

        let crashed = crash_child(&sched, &mut state, 1);
        handle_child_exit(
            &sched,
            sup_pid,
            &mut state,
            crashed,
            &ExitReason::Crash("boom".to_string()),
        )
        .unwrap();

        assert_eq!(state.children[0].pid.unwrap(), initial[0], "predecessor untouched");
        assert_ne!(state.children[1].pid.unwrap(), initial[1]);
        assert_ne!(state.children[2].pid.unwrap(), initial[2]);
    }

    #[test]
    fn test_permanent_restarts_on_normal_exit() {
        let sched = test_sched();
        let (mut state, sup_pid) = setup(
            &sched,
            Strategy::OneForOne,
            vec![noop_spec("a", RestartPolicy::Permanent)],
        );
        let pid = state.children[0].pid.unwrap();
        sched.kill(pid, ExitReason::Normal);

        handle_child_exit(&sched, sup_pid, &mut state, pid, &ExitReason::Normal).unwrap();
        assert!(state.children[0].running);
        assert_ne!(state.children[0].pid.unwrap(), pid);
    }

    #[test]
    fn test_transient_skips_normal_and_shutdown() {
        for reason in [ExitReason::Normal, ExitReason::Shutdown] {
            let sched = test_sched();
            let (mut state, sup_pid) = setup(
                &sched,
                Strategy::OneForOne,
                vec![noop_spec("a", RestartPolicy::Transient)],
            );
            let pid = state.children[0].pid.unwrap();
            sched.kill(pid, reason.clone());

            handle_child_exit(&sched, sup_pid, &mut state, pid, &reason).unwrap();
            assert!(!state.children[0].running, "no restart on {:?}", reason);
            assert!(state.children[0].pid.is_none());
        }
    }

    #[test]
    fn test_transient_restarts_on_crash() {
        let sched = test_sched();
        let (mut state, sup_pid) = setup(
            &sched,
            Strategy::OneForOne,
            vec![noop_spec("a", RestartPolicy::Transient)],
        );
        let crashed = crash_child(&sched, &mut state, 0);
        handle_child_exit(
            &sched,
            sup_pid,
            &mut state,
            crashed,
            &ExitReason::Crash("boom".to_string()),
        )
        .unwrap();
        assert!(state.children[0].running);
    }

    #[test]
    fn test_temporary_is_removed() {
        let sched = test_sched();
        let (mut state, sup_pid) = setup(
            &sched,
            Strategy::OneForOne,
            vec![
                noop_spec("a", RestartPolicy::Temporary),
                noop_spec("b", RestartPolicy::Permanent),
            ],
        );
        let crashed = crash_child(&sched, &mut state, 0);
        handle_child_exit(
            &sched,
            sup_pid,
            &mut state,
            crashed,
            &ExitReason::Crash("boom".to_string()),
        )
        .unwrap();

        assert_eq!(state.children.len(), 1);
        assert_eq!(state.children[0].spec.name, "b");
    }

    #[test]
    fn test_unknown_child_ignored() {
        let sched = test_sched();
        let (mut state, sup_pid) = setup(
            &sched,
            Strategy::OneForOne,
            vec![noop_spec("a", RestartPolicy::Permanent)],
        );
        let before = state.children[0].pid.unwrap();
        handle_child_exit(
            &sched,
            sup_pid,
            &mut state,
            Pid(987654),
            &ExitReason::Crash("boom".to_string()),
        )
        .unwrap();
        assert_eq!(state.children[0].pid.unwrap(), before);
    }

    #[test]
    fn test_restart_limit_exceeded_errors() {
        let sched = test_sched();
        let mut spec = noop_spec("a", RestartPolicy::Permanent);
        spec.max_restarts = 2;
        let (mut state, sup_pid) = setup(&sched, Strategy::OneForOne, vec![spec]);

        for i in 0..2 {
            let crashed = crash_child(&sched, &mut state, 0);
            let result = handle_child_exit(
                &sched,
                sup_pid,
                &mut state,
                crashed,
                &ExitReason::Crash("boom".to_string()),
            );
            assert!(result.is_ok(), "restart {} should be admitted", i);
        }

        let crashed = crash_child(&sched, &mut state, 0);
        let result = handle_child_exit(
            &sched,
            sup_pid,
            &mut state,
            crashed,
            &ExitReason::Crash("boom".to_string()),
        );
        let err = result.unwrap_err();
        assert!(err.contains("exceeded"), "{}", err);
    }

    #[test]
    fn test_restart_window_slides() {
        let mut history = VecDeque::new();
        assert!(allow_restart(&mut history, 2, 100, 0));
        assert!(allow_restart(&mut history, 2, 100, 10));
        assert!(!allow_restart(&mut history, 2, 100, 20));
        // Outside the window the old entries are pruned.
        assert!(allow_restart(&mut history, 2, 100, 500));
    }

    #[test]
    fn test_terminate_all_reverse_order() {
        let sched = test_sched();
        let specs = vec![
            noop_spec("a", RestartPolicy::Permanent),
            noop_spec("b", RestartPolicy::Permanent),
            noop_spec("c", RestartPolicy::Permanent),
        ];
        let (mut state, sup_pid) = setup(&sched, Strategy::OneForOne, specs);
        let pids: Vec<Pid> = state.children.iter().map(|c| c.pid.unwrap()).collect();

        terminate_all_children(&sched, sup_pid, &mut state);

        assert_eq!(state.running_count(), 0);
        for pid in pids {
            // Killed children are unregistered by the termination protocol.
            assert!(sched.block(pid).is_none());
        }
    }
}
