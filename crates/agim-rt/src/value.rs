//! Runtime values exchanged between Agim blocks.
//!
//! Values are a tagged sum covering the scalar, container, and identity
//! types a block's stepper operates on. Immutable variants (strings,
//! vectors, pids, function references) are shared freely by reference
//! count. The mutable containers (array, map) are structurally shared:
//! the `Arc` strong count acts as the shared bit, and any holder that
//! mutates a shared value clones it first (`Arc::make_mut`). Byte buffers
//! and closures capture mutable state and are deep-copied whenever they
//! cross a block boundary.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::block::Pid;

/// String-keyed mapping used for map values and block globals.
pub type ValueMap = FxHashMap<String, Value>;

// ---------------------------------------------------------------------------
// FuncRef / Closure
// ---------------------------------------------------------------------------

/// Reference to a named function in a loaded module.
///
/// Function references carry no state and are shared by value. They are
/// never serializable (a checkpoint cannot capture code identity).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncRef {
    /// Module the function was defined in.
    pub module: Arc<str>,
    /// Index of the function within the module's code table.
    pub index: u32,
}

/// A function reference plus captured upvalues.
///
/// Upvalues may be mutable, so closures are deep-copied on send.
#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    pub func: FuncRef,
    pub upvalues: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A single runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Immutable byte sequence, shared by reference count.
    Str(Arc<str>),
    /// Mutable byte buffer, deep-copied on send.
    Bytes(Vec<u8>),
    /// Ordered sequence; copy-on-write across sends.
    Array(Arc<Vec<Value>>),
    /// String-keyed mapping; copy-on-write across sends.
    Map(Arc<ValueMap>),
    Pid(Pid),
    Func(FuncRef),
    Closure(Closure),
    /// Persistent vector; immutable and freely shared.
    Vector(Arc<[Value]>),
    /// Ok/Err pair; the bool is the ok discriminant.
    Result(bool, Box<Value>),
    Option(Option<Box<Value>>),
}

impl Value {
    /// Short type name used in stepper error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Pid(_) => "pid",
            Value::Func(_) => "function",
            Value::Closure(_) => "closure",
            Value::Vector(_) => "vector",
            Value::Result(..) => "result",
            Value::Option(_) => "option",
        }
    }

    /// Approximate in-memory size in bytes.
    ///
    /// Used for mailbox byte accounting and heap charge bookkeeping. The
    /// estimate is conservative and stable, not exact: shared containers
    /// count their full contents at every holder.
    pub fn approx_bytes(&self) -> usize {
        const BASE: usize = std::mem::size_of::<Value>();
        match self {
            Value::Str(s) => BASE + s.len(),
            Value::Bytes(b) => BASE + b.len(),
            Value::Array(items) => BASE + items.iter().map(Value::approx_bytes).sum::<usize>(),
            Value::Map(m) => {
                BASE + m
                    .iter()
                    .map(|(k, v)| k.len() + v.approx_bytes())
                    .sum::<usize>()
            }
            Value::Vector(items) => BASE + items.iter().map(Value::approx_bytes).sum::<usize>(),
            Value::Closure(c) => BASE + c.upvalues.iter().map(Value::approx_bytes).sum::<usize>(),
            Value::Result(_, inner) => BASE + inner.approx_bytes(),
            Value::Option(Some(inner)) => BASE + inner.approx_bytes(),
            _ => BASE,
        }
    }

    /// Wrap a value for transfer to another block.
    ///
    /// Immutable variants retain (reference-count bump). Arrays and maps
    /// share structurally; the bumped strong count is the shared bit that
    /// forces both sides onto the copy-on-write path. Bytes and closures
    /// are deep-copied immediately.
    pub fn wrap_for_send(&self) -> Value {
        match self {
            Value::Bytes(b) => Value::Bytes(b.clone()),
            Value::Closure(c) => Value::Closure(Closure {
                func: c.func.clone(),
                upvalues: c.upvalues.iter().map(Value::deep_copy).collect(),
            }),
            // Arc clone: shares the allocation and marks it shared.
            other => other.clone(),
        }
    }

    /// Fully independent copy: no allocation is shared with `self`.
    pub fn deep_copy(&self) -> Value {
        match self {
            Value::Str(s) => Value::Str(Arc::from(&**s)),
            Value::Bytes(b) => Value::Bytes(b.clone()),
            Value::Array(items) => {
                Value::Array(Arc::new(items.iter().map(Value::deep_copy).collect()))
            }
            Value::Map(m) => Value::Map(Arc::new(
                m.iter().map(|(k, v)| (k.clone(), v.deep_copy())).collect(),
            )),
            Value::Vector(items) => {
                Value::Vector(items.iter().map(Value::deep_copy).collect::<Vec<_>>().into())
            }
            Value::Closure(c) => Value::Closure(Closure {
                func: c.func.clone(),
                upvalues: c.upvalues.iter().map(Value::deep_copy).collect(),
            }),
            Value::Result(ok, inner) => Value::Result(*ok, Box::new(inner.deep_copy())),
            Value::Option(inner) => {
                Value::Option(inner.as_ref().map(|v| Box::new(v.deep_copy())))
            }
            other => other.clone(),
        }
    }

    /// True for variants that are shared by reference count alone.
    pub fn is_immutable(&self) -> bool {
        !matches!(
            self,
            Value::Bytes(_) | Value::Array(_) | Value::Map(_) | Value::Closure(_)
        )
    }

    /// Convenience constructor for string values.
    pub fn str(s: &str) -> Value {
        Value::Str(Arc::from(s))
    }

    /// Convenience constructor for array values.
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(items))
    }

    /// Convenience constructor for map values.
    pub fn map(entries: ValueMap) -> Value {
        Value::Map(Arc::new(entries))
    }

    /// Borrow the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Extract the integer payload, if this is an int.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Arc::from(s.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
