//! Block checkpointing: capture, on-disk storage, restore.
//!
//! A checkpoint captures everything a block needs to resume elsewhere:
//! metadata, mailbox contents, operand stack, globals, instruction offset,
//! frame count, links, parent, capabilities, and counters. The body is the
//! shared TLV format behind a `MAGIC | VERSION` header; unknown magic or
//! version fails to load.
//!
//! Programs are never serialized -- code identity comes from the module
//! registry, so `restore` takes the program to bind. The restored block
//! gets a fresh PID: callers that care about identity must republish it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::block::{Block, BlockState, Caps, ExitReason, Message, MessageTag, Pid};
use crate::codec::{self, CodecError, Reader};
use crate::link;
use crate::sched::{Scheduler, SpawnError};
use crate::stepper::{Frame, Program};
use crate::telemetry::CounterSnapshot;
use crate::value::{Value, ValueMap};

/// File header magic, "AGMC".
pub const CHECKPOINT_MAGIC: u32 = 0x4147_4D43;

/// Checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    /// The block is RUNNING; its state is not capturable mid-slice.
    BlockRunning(Pid),
    /// Header magic did not match.
    BadMagic(u32),
    /// Unknown format version.
    BadVersion(u32),
    /// TLV-level failure (including non-serializable values).
    Codec(CodecError),
    /// Filesystem failure.
    Io(String),
    /// Spawn-side failure during restore.
    Spawn(SpawnError),
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointError::BlockRunning(pid) => {
                write!(f, "block {} is running and cannot be checkpointed", pid)
            }
            CheckpointError::BadMagic(got) => {
                write!(f, "bad checkpoint magic 0x{:08X}", got)
            }
            CheckpointError::BadVersion(got) => {
                write!(f, "unsupported checkpoint version {}", got)
            }
            CheckpointError::Codec(err) => write!(f, "{}", err),
            CheckpointError::Io(msg) => write!(f, "checkpoint io: {}", msg),
            CheckpointError::Spawn(err) => write!(f, "checkpoint restore: {}", err),
        }
    }
}

impl From<CodecError> for CheckpointError {
    fn from(err: CodecError) -> Self {
        CheckpointError::Codec(err)
    }
}

impl From<std::io::Error> for CheckpointError {
    fn from(err: std::io::Error) -> Self {
        CheckpointError::Io(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Everything captured from one block.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub id: u64,
    pub timestamp_ms: u64,
    /// PID at capture time. Restore assigns a fresh one.
    pub pid: Pid,
    pub name: Option<String>,
    pub ip: u64,
    pub frame_count: u32,
    pub stack: Vec<Value>,
    pub globals: ValueMap,
    pub mailbox: Vec<Message>,
    pub links: Vec<Pid>,
    pub parent: Pid,
    pub caps: Caps,
    pub counters: CounterSnapshot,
}

impl Checkpoint {
    /// Capture a block that is not currently running.
    ///
    /// The caller must guarantee the block stays off the workers for the
    /// duration (parked WAITING, or a scheduler that is not running).
    pub fn capture(block: &Block, id: u64, timestamp_ms: u64) -> Result<Checkpoint, CheckpointError> {
        if block.state() == BlockState::Running {
            return Err(CheckpointError::BlockRunning(block.pid()));
        }

        let mailbox = block.mailbox().snapshot();
        let links = block.links();
        let core = block.core();
        Ok(Checkpoint {
            id,
            timestamp_ms,
            pid: block.pid(),
            name: block.name().map(String::from),
            ip: core.stepper.ip,
            frame_count: core.stepper.frames.len() as u32,
            stack: core.stepper.stack.clone(),
            globals: core.stepper.globals.clone(),
            mailbox,
            links,
            parent: block.parent(),
            caps: block.caps(),
            counters: block.counters().snapshot(),
        })
    }

    /// Encode to the on-disk byte layout.
    pub fn encode(&self) -> Result<Vec<u8>, CheckpointError> {
        let mut out = Vec::new();
        out.extend_from_slice(&CHECKPOINT_MAGIC.to_be_bytes());
        out.extend_from_slice(&CHECKPOINT_VERSION.to_be_bytes());

        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.extend_from_slice(&self.pid.0.to_be_bytes());
        match &self.name {
            Some(name) => {
                out.push(1);
                encode_str(name, &mut out);
            }
            None => out.push(0),
        }
        out.extend_from_slice(&self.ip.to_be_bytes());
        out.extend_from_slice(&self.frame_count.to_be_bytes());

        out.extend_from_slice(&(self.stack.len() as u32).to_be_bytes());
        for value in &self.stack {
            codec::encode_value(value, &mut out)?;
        }

        codec::encode_value(&Value::Map(Arc::new(self.globals.clone())), &mut out)?;

        out.extend_from_slice(&(self.mailbox.len() as u32).to_be_bytes());
        for msg in &self.mailbox {
            encode_message(msg, &mut out)?;
        }

        out.extend_from_slice(&(self.links.len() as u32).to_be_bytes());
        for pid in &self.links {
            out.extend_from_slice(&pid.0.to_be_bytes());
        }
        out.extend_from_slice(&self.parent.0.to_be_bytes());
        out.extend_from_slice(&self.caps.to_be_bytes());

        for n in [
            self.counters.reductions,
            self.counters.messages_sent,
            self.counters.messages_received,
            self.counters.gc_cycles,
            self.counters.bytes_allocated,
            self.counters.wait_time_ms,
        ] {
            out.extend_from_slice(&n.to_be_bytes());
        }
        Ok(out)
    }

    /// Decode from the on-disk byte layout.
    pub fn decode(bytes: &[u8]) -> Result<Checkpoint, CheckpointError> {
        let mut r = Reader::new(bytes);

        let magic = r.u32()?;
        if magic != CHECKPOINT_MAGIC {
            return Err(CheckpointError::BadMagic(magic));
        }
        let version = r.u32()?;
        if version != CHECKPOINT_VERSION {
            return Err(CheckpointError::BadVersion(version));
        }

        let id = r.u64()?;
        let timestamp_ms = r.u64()?;
        let pid = Pid(r.u64()?);
        let name = if r.u8()? != 0 {
            Some(decode_str(&mut r)?)
        } else {
            None
        };
        let ip = r.u64()?;
        let frame_count = r.u32()?;

        let stack_len = r.u32()?;
        let mut stack = Vec::with_capacity(stack_len.min(1024) as usize);
        for _ in 0..stack_len {
            stack.push(codec::decode_value(&mut r)?);
        }

        // The globals section is always a map value.
        let globals = match codec::decode_value(&mut r)? {
            Value::Map(map) => Arc::try_unwrap(map).unwrap_or_else(|arc| (*arc).clone()),
            _ => return Err(CheckpointError::Codec(CodecError::InvalidTag(codec::TAG_MAP))),
        };

        let mailbox_len = r.u32()?;
        let mut mailbox = Vec::with_capacity(mailbox_len.min(1024) as usize);
        for _ in 0..mailbox_len {
            mailbox.push(decode_message(&mut r)?);
        }

        let links_len = r.u32()?;
        let mut links = Vec::with_capacity(links_len.min(1024) as usize);
        for _ in 0..links_len {
            links.push(Pid(r.u64()?));
        }
        let parent = Pid(r.u64()?);
        let caps = r.u64()?;

        let counters = CounterSnapshot {
            reductions: r.u64()?,
            messages_sent: r.u64()?,
            messages_received: r.u64()?,
            gc_cycles: r.u64()?,
            bytes_allocated: r.u64()?,
            wait_time_ms: r.u64()?,
        };

        Ok(Checkpoint {
            id,
            timestamp_ms,
            pid,
            name,
            ip,
            frame_count,
            stack,
            globals,
            mailbox,
            links,
            parent,
            caps,
            counters,
        })
    }

    /// Rebuild a block from this checkpoint and schedule it RUNNABLE.
    ///
    /// The new block gets a fresh PID (returned); links are re-established
    /// against peers that are still alive.
    pub fn restore(
        &self,
        sched: &Scheduler,
        program: Arc<dyn Program>,
    ) -> Result<Pid, CheckpointError> {
        let pid = sched.allocate_pid();
        let block = Arc::new(Block::new(
            pid,
            self.name.clone(),
            sched.default_limits(),
        ));
        block.load(program);
        block.grant(self.caps);
        block.set_parent(self.parent);
        block.counters().restore(&self.counters);

        {
            let mut core = block.core();
            core.stepper.ip = self.ip;
            core.stepper.stack = self.stack.clone();
            // Only the frame count survives a checkpoint; the offsets are
            // the program's to rebuild.
            core.stepper.frames = vec![Frame { return_ip: 0 }; self.frame_count as usize];
            core.stepper.globals = self.globals.clone();
        }

        for msg in &self.mailbox {
            block.mailbox().push(msg.clone(), block.limits());
        }

        for peer_pid in &self.links {
            if let Some(peer) = sched.block(*peer_pid) {
                link::link(&block, &peer);
            }
        }

        sched.adopt_block(block);
        Ok(pid)
    }
}

// ---------------------------------------------------------------------------
// Field codecs
// ---------------------------------------------------------------------------

fn encode_str(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn decode_str(r: &mut Reader<'_>) -> Result<String, CheckpointError> {
    let len = r.u32()? as usize;
    let bytes = r.take(len)?;
    Ok(std::str::from_utf8(bytes)
        .map_err(|_| CodecError::InvalidUtf8)?
        .to_string())
}

fn encode_reason(reason: &ExitReason, out: &mut Vec<u8>) {
    match reason {
        ExitReason::Normal => out.push(0),
        ExitReason::Crash(msg) => {
            out.push(1);
            encode_str(msg, out);
        }
        ExitReason::Killed => out.push(2),
        ExitReason::Shutdown => out.push(3),
        ExitReason::Timeout => out.push(4),
    }
}

fn decode_reason(r: &mut Reader<'_>) -> Result<ExitReason, CheckpointError> {
    Ok(match r.u8()? {
        0 => ExitReason::Normal,
        1 => ExitReason::Crash(decode_str(r)?),
        2 => ExitReason::Killed,
        3 => ExitReason::Shutdown,
        4 => ExitReason::Timeout,
        tag => return Err(CheckpointError::Codec(CodecError::InvalidTag(tag))),
    })
}

fn encode_message(msg: &Message, out: &mut Vec<u8>) -> Result<(), CheckpointError> {
    out.extend_from_slice(&msg.sender.0.to_be_bytes());
    match &msg.tag {
        MessageTag::User => out.push(0),
        MessageTag::Exit(reason) => {
            out.push(1);
            encode_reason(reason, out);
        }
        MessageTag::Down(reason) => {
            out.push(2);
            encode_reason(reason, out);
        }
        MessageTag::NodeDown(node) => {
            out.push(3);
            encode_str(node, out);
        }
    }
    codec::encode_value(&msg.payload, out)?;
    Ok(())
}

fn decode_message(r: &mut Reader<'_>) -> Result<Message, CheckpointError> {
    let sender = Pid(r.u64()?);
    let tag = match r.u8()? {
        0 => MessageTag::User,
        1 => MessageTag::Exit(decode_reason(r)?),
        2 => MessageTag::Down(decode_reason(r)?),
        3 => MessageTag::NodeDown(decode_str(r)?),
        tag => return Err(CheckpointError::Codec(CodecError::InvalidTag(tag))),
    };
    let payload = codec::decode_value(r)?;
    Ok(Message {
        sender,
        tag,
        payload,
    })
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// On-disk checkpoint store with per-block retention.
///
/// Files are named `<block-name>-<checkpoint-id>`; `cleanup` deletes the
/// oldest files beyond the retention bound.
pub struct CheckpointManager {
    dir: PathBuf,
    retention: usize,
    next_id: AtomicU64,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, retention: usize) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(CheckpointManager {
            dir,
            retention: retention.max(1),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn stem_for(cp: &Checkpoint) -> String {
        cp.name
            .clone()
            .unwrap_or_else(|| format!("block{}", cp.pid.0))
    }

    /// Write a checkpoint, then enforce retention for its block.
    pub fn save(&self, cp: &Checkpoint) -> Result<PathBuf, CheckpointError> {
        let stem = Self::stem_for(cp);
        let path = self.dir.join(format!("{}-{}", stem, cp.id));
        std::fs::write(&path, cp.encode()?)?;
        self.cleanup(&stem)?;
        Ok(path)
    }

    /// Capture a block and persist it in one step.
    pub fn capture(
        &self,
        block: &Block,
        timestamp_ms: u64,
    ) -> Result<(Checkpoint, PathBuf), CheckpointError> {
        let cp = Checkpoint::capture(block, self.next_id(), timestamp_ms)?;
        let path = self.save(&cp)?;
        Ok((cp, path))
    }

    pub fn load(&self, path: &Path) -> Result<Checkpoint, CheckpointError> {
        let bytes = std::fs::read(path)?;
        Checkpoint::decode(&bytes)
    }

    /// Checkpoint files for one block, oldest first.
    pub fn list(&self, block_name: &str) -> Result<Vec<PathBuf>, CheckpointError> {
        let prefix = format!("{}-", block_name);
        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(rest) = name.strip_prefix(&prefix) {
                if let Ok(id) = rest.parse::<u64>() {
                    found.push((id, entry.path()));
                }
            }
        }
        found.sort_by_key(|(id, _)| *id);
        Ok(found.into_iter().map(|(_, p)| p).collect())
    }

    /// Delete the oldest checkpoints beyond the retention bound. Returns
    /// how many files were removed.
    pub fn cleanup(&self, block_name: &str) -> Result<usize, CheckpointError> {
        let files = self.list(block_name)?;
        let mut removed = 0;
        if files.len() > self.retention {
            for path in &files[..files.len() - self.retention] {
                std::fs::remove_file(path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("dir", &self.dir)
            .field("retention", &self.retention)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
