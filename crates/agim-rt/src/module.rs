//! Versioned module registry and hot code upgrade.
//!
//! A module is a named, monotonically versioned program. Loading a new
//! version makes it current and keeps the predecessor for rollback; blocks
//! stay bound to the version they were running until they pass their
//! upgrade safe point (the explicit `check_upgrade` call in the stepper
//! context), where they migrate their state and rebind.
//!
//! Old versions are reference-counted by the blocks still bound to them:
//! the registry prunes a superseded version once no block holds it (the
//! immediate predecessor of the current version is always retained so
//! rollback has a target).

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::block::Pid;
use crate::stepper::Program;
use crate::value::ValueMap;

/// State migration hook run at the upgrade safe point:
/// `(old_globals, old_version) -> new_globals`.
pub type MigrateFn = Arc<dyn Fn(ValueMap, u32) -> ValueMap + Send + Sync>;

// ---------------------------------------------------------------------------
// ModuleVersion
// ---------------------------------------------------------------------------

/// One immutable version of a module.
pub struct ModuleVersion {
    /// Monotonically increasing, starting at 1.
    pub version: u32,
    pub program: Arc<dyn Program>,
    /// Invoked on each block's globals when it migrates to this version.
    pub migrate: Option<MigrateFn>,
}

impl std::fmt::Debug for ModuleVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleVersion")
            .field("version", &self.version)
            .field("has_migrate", &self.migrate.is_some())
            .finish()
    }
}

struct ModuleEntry {
    /// Version history, oldest first. `current` indexes into it.
    versions: Vec<Arc<ModuleVersion>>,
    current: usize,
    /// Blocks registered against this module; flagged on upgrade triggers.
    registered: FxHashSet<Pid>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    UnknownModule(String),
    /// Rollback requested but no prior version exists.
    NoPriorVersion(String),
}

impl std::fmt::Display for ModuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleError::UnknownModule(name) => write!(f, "unknown module '{}'", name),
            ModuleError::NoPriorVersion(name) => {
                write!(f, "module '{}' has no prior version to roll back to", name)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ModuleRegistry
// ---------------------------------------------------------------------------

/// Name -> versioned module map behind a reader-writer lock.
pub struct ModuleRegistry {
    modules: RwLock<FxHashMap<String, ModuleEntry>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry {
            modules: RwLock::new(FxHashMap::default()),
        }
    }

    /// Install a new current version. Returns the assigned version number.
    pub fn load(
        &self,
        name: &str,
        program: Arc<dyn Program>,
        migrate: Option<MigrateFn>,
    ) -> u32 {
        let mut modules = self.modules.write();
        let entry = modules.entry(name.to_string()).or_insert_with(|| ModuleEntry {
            versions: Vec::new(),
            current: 0,
            registered: FxHashSet::default(),
        });

        let version = entry.versions.last().map(|v| v.version + 1).unwrap_or(1);
        entry.versions.push(Arc::new(ModuleVersion {
            version,
            program,
            migrate,
        }));
        entry.current = entry.versions.len() - 1;

        // Prune superseded versions nobody is bound to, keeping the
        // immediate predecessor as the rollback target.
        let keep_from = entry.current.saturating_sub(1);
        let mut idx = 0usize;
        entry.versions.retain(|v| {
            let keep = idx >= keep_from || Arc::strong_count(v) > 1;
            idx += 1;
            keep
        });
        // Only entries before the predecessor can drop; re-find current.
        entry.current = entry
            .versions
            .iter()
            .position(|v| v.version == version)
            .unwrap_or(entry.versions.len() - 1);

        version
    }

    /// The current version of a module.
    pub fn current(&self, name: &str) -> Option<Arc<ModuleVersion>> {
        let modules = self.modules.read();
        let entry = modules.get(name)?;
        entry.versions.get(entry.current).cloned()
    }

    /// A specific version, if still retained.
    pub fn version(&self, name: &str, version: u32) -> Option<Arc<ModuleVersion>> {
        let modules = self.modules.read();
        modules
            .get(name)?
            .versions
            .iter()
            .find(|v| v.version == version)
            .cloned()
    }

    /// Bind a block to a module for upgrade tracking.
    pub fn register_block(&self, name: &str, pid: Pid) {
        if let Some(entry) = self.modules.write().get_mut(name) {
            entry.registered.insert(pid);
        }
    }

    /// Remove a block's binding. Called on block termination.
    pub fn unregister_block(&self, name: &str, pid: Pid) {
        if let Some(entry) = self.modules.write().get_mut(name) {
            entry.registered.remove(&pid);
        }
    }

    /// PIDs currently registered against a module.
    pub fn registered(&self, name: &str) -> Vec<Pid> {
        self.modules
            .read()
            .get(name)
            .map(|e| e.registered.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Re-promote the previous version. The caller re-flags registered
    /// blocks, exactly as with an upgrade trigger.
    pub fn rollback(&self, name: &str) -> Result<u32, ModuleError> {
        let mut modules = self.modules.write();
        let entry = modules
            .get_mut(name)
            .ok_or_else(|| ModuleError::UnknownModule(name.to_string()))?;
        if entry.current == 0 {
            return Err(ModuleError::NoPriorVersion(name.to_string()));
        }
        entry.current -= 1;
        Ok(entry.versions[entry.current].version)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.read().contains_key(name)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let modules = self.modules.read();
        f.debug_struct("ModuleRegistry")
            .field("modules", &modules.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stepper::{program_fn, StepStatus};

    fn noop_program() -> Arc<dyn Program> {
        program_fn(|_| StepStatus::Ok)
    }

    #[test]
    fn test_load_assigns_monotonic_versions() {
        let reg = ModuleRegistry::new();
        assert_eq!(reg.load("m", noop_program(), None), 1);
        assert_eq!(reg.load("m", noop_program(), None), 2);
        assert_eq!(reg.load("m", noop_program(), None), 3);
        assert_eq!(reg.current("m").unwrap().version, 3);
    }

    #[test]
    fn test_unknown_module() {
        let reg = ModuleRegistry::new();
        assert!(reg.current("nope").is_none());
        assert_eq!(
            reg.rollback("nope").unwrap_err(),
            ModuleError::UnknownModule("nope".to_string())
        );
    }

    #[test]
    fn test_rollback_restores_previous() {
        let reg = ModuleRegistry::new();
        reg.load("m", noop_program(), None);
        reg.load("m", noop_program(), None);

        assert_eq!(reg.rollback("m").unwrap(), 1);
        assert_eq!(reg.current("m").unwrap().version, 1);

        // A single remaining version cannot roll back further.
        assert_eq!(
            reg.rollback("m").unwrap_err(),
            ModuleError::NoPriorVersion("m".to_string())
        );
    }

    #[test]
    fn test_register_and_unregister_blocks() {
        let reg = ModuleRegistry::new();
        reg.load("m", noop_program(), None);
        reg.register_block("m", Pid(1));
        reg.register_block("m", Pid(2));
        reg.register_block("m", Pid(1));

        let mut pids = reg.registered("m");
        pids.sort_unstable();
        assert_eq!(pids, vec![Pid(1), Pid(2)]);

        reg.unregister_block("m", Pid(1));
        assert_eq!(reg.registered("m"), vec![Pid(2)]);
    }

    #[test]
    fn test_prune_keeps_bound_and_predecessor_versions() {
        let reg = ModuleRegistry::new();
        reg.load("m", noop_program(), None);
        // Simulate a block still bound to v1.
        let bound_v1 = reg.current("m").unwrap();

        reg.load("m", noop_program(), None);
        reg.load("m", noop_program(), None);

        // v1 is still reachable (a block holds it), v2 as predecessor.
        assert!(reg.version("m", 1).is_some());
        assert!(reg.version("m", 2).is_some());
        assert_eq!(reg.current("m").unwrap().version, 3);

        drop(bound_v1);
        reg.load("m", noop_program(), None);
        // v1 had no holders anymore and is gone; v3 is the new predecessor.
        assert!(reg.version("m", 1).is_none());
        assert!(reg.version("m", 3).is_some());
        assert_eq!(reg.current("m").unwrap().version, 4);
    }

    #[test]
    fn test_migrate_hook_carried_by_version() {
        let reg = ModuleRegistry::new();
        let migrate: MigrateFn = Arc::new(|mut globals, _from| {
            globals.insert("migrated".into(), crate::value::Value::Bool(true));
            globals
        });
        reg.load("m", noop_program(), Some(migrate));

        let version = reg.current("m").unwrap();
        let out = (version.migrate.as_ref().unwrap())(ValueMap::default(), 1);
        assert_eq!(out["migrated"], crate::value::Value::Bool(true));
    }
}
