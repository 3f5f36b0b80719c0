//! The dynamic runtime value (§3 "Data model"). Containers share by
//! reference (`triomphe::Arc` + `parking_lot::Mutex`, matching the
//! teacher's preferred combination for shared mutable runtime state)
//! rather than by deep copy.

use crate::tensor::TensorData;
use arcstr::ArcStr;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use triomphe::Arc;

pub type ArrayRef = Arc<Mutex<ArrayData>>;
pub type MapRef = Arc<Mutex<MapData>>;
pub type TensorRef = Arc<Mutex<TensorData>>;
pub type OpaqueRef = Arc<OpaqueHandle>;
pub type JsonRef = Arc<serde_json::Value>;

#[derive(Debug, Clone)]
pub struct ArrayData {
    pub shape: Vec<usize>,
    pub data: Vec<Value>,
}

impl ArrayData {
    pub fn scalar_like(shape: Vec<usize>, fill: Value) -> Self {
        let len = shape.iter().product();
        Self { shape, data: vec![fill; len] }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Flatten a multi-index into `shape`'s row-major offset. Returns
    /// `None` if out of bounds (error 10, array out of bounds).
    pub fn flat_index(&self, indices: &[usize]) -> Option<usize> {
        if indices.len() != self.shape.len() {
            return None;
        }
        let mut offset = 0usize;
        let mut stride = 1usize;
        for (dim, idx) in self.shape.iter().zip(indices.iter()).rev() {
            if *idx >= *dim {
                return None;
            }
            offset += idx * stride;
            stride *= dim;
        }
        Some(offset)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapData {
    pub udt_type_name: Option<ArcStr>,
    pub entries: IndexMap<ArcStr, Value>,
}

/// A native resource surfaced to scripts (§4.11). The dropper runs
/// exactly once, when the last `Value::Opaque` referencing it is
/// dropped (invariant 4, §3).
pub struct OpaqueHandle {
    pub type_tag: ArcStr,
    pub pointer: usize,
    dropper: Mutex<Option<Box<dyn FnOnce(usize) + Send>>>,
}

impl OpaqueHandle {
    pub fn new(type_tag: impl Into<ArcStr>, pointer: usize, dropper: impl FnOnce(usize) + Send + 'static) -> Self {
        Self { type_tag: type_tag.into(), pointer, dropper: Mutex::new(Some(Box::new(dropper))) }
    }
}

impl fmt::Debug for OpaqueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueHandle({}, {:#x})", self.type_tag, self.pointer)
    }
}

impl Drop for OpaqueHandle {
    fn drop(&mut self) {
        if let Some(dropper) = self.dropper.lock().take() {
            dropper(self.pointer);
        }
    }
}

static NEXT_TASK_ID: AtomicUsize = AtomicUsize::new(1);
static NEXT_THREAD_HANDLE_ID: AtomicUsize = AtomicUsize::new(1);

pub fn next_task_id() -> u64 {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed) as u64
}

pub fn next_thread_handle_id() -> u64 {
    NEXT_THREAD_HANDLE_ID.fetch_add(1, Ordering::Relaxed) as u64
}

#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Double(f64),
    Str(ArcStr),
    /// Seconds since epoch, civil time (§3 "date-time").
    DateTime(i64),
    FuncRef(ArcStr),
    TaskRef(u64),
    ThreadHandle(u64),
    Array(ArrayRef),
    Map(MapRef),
    Json(JsonRef),
    Tensor(TensorRef),
    Opaque(OpaqueRef),
}

impl Value {
    pub fn empty_string() -> Value {
        Value::Str(ArcStr::new())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "BOOL",
            Value::Integer(_) => "INTEGER",
            Value::Double(_) => "DOUBLE",
            Value::Str(_) => "STRING",
            Value::DateTime(_) => "DATETIME",
            Value::FuncRef(_) => "FUNCREF",
            Value::TaskRef(_) => "TASKREF",
            Value::ThreadHandle(_) => "THREADHANDLE",
            Value::Array(_) => "ARRAY",
            Value::Map(_) => "MAP",
            Value::Json(_) => "JSON",
            Value::Tensor(_) => "TENSOR",
            Value::Opaque(_) => "OPAQUE",
        }
    }

    pub fn array(shape: Vec<usize>, data: Vec<Value>) -> Value {
        Value::Array(Arc::new(Mutex::new(ArrayData { shape, data })))
    }

    pub fn map(entries: IndexMap<ArcStr, Value>) -> Value {
        Value::Map(Arc::new(Mutex::new(MapData { udt_type_name: None, entries })))
    }
}

/// `to-bool` (§4.1): 0/empty-string/empty-array → false; all else true.
pub fn to_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Integer(i) => *i != 0,
        Value::Double(d) => *d != 0.0,
        Value::Str(s) => !s.is_empty(),
        Value::DateTime(t) => *t != 0,
        Value::Array(a) => !a.lock().is_empty(),
        Value::Map(m) => !m.lock().entries.is_empty(),
        _ => true,
    }
}

/// `to-number` (§4.1). Containers that aren't specifically supported by
/// the calling op are the caller's responsibility to reject with error
/// 15 before reaching here; this function never fails by design, mapping
/// anything it can't convert to `0.0` the same way a malformed numeric
/// string would.
pub fn to_number(v: &Value) -> f64 {
    match v {
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Integer(i) => *i as f64,
        Value::Double(d) => *d,
        Value::Str(s) => parse_leading_number(s),
        Value::DateTime(t) => *t as f64,
        _ => 0.0,
    }
}

fn parse_leading_number(s: &str) -> f64 {
    let trimmed = s.trim();
    let mut end = 0usize;
    let bytes = trimmed.as_bytes();
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let mut seen_digit = false;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
        seen_digit = true;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
            seen_digit = true;
        }
    }
    if !seen_digit {
        return 0.0;
    }
    trimmed[..end].parse().unwrap_or(0.0)
}

/// `to-string` (§4.1). Integral doubles print without a trailing `.0`
/// (SPEC_FULL §4.1 supplement), matching `original_source/source/BuiltinFunctions.cpp`'s
/// number formatter.
pub fn to_display_string(v: &Value) -> ArcStr {
    match v {
        Value::Bool(b) => ArcStr::from(if *b { "TRUE" } else { "FALSE" }),
        Value::Integer(i) => ArcStr::from(i.to_string()),
        Value::Double(d) => ArcStr::from(format_double(*d)),
        Value::Str(s) => s.clone(),
        Value::DateTime(t) => ArcStr::from(format_datetime(*t)),
        Value::FuncRef(n) => ArcStr::from(format!("@{n}")),
        Value::TaskRef(id) => ArcStr::from(format!("TASK#{id}")),
        Value::ThreadHandle(id) => ArcStr::from(format!("THREAD#{id}")),
        Value::Array(a) => ArcStr::from(format_array(&a.lock())),
        Value::Map(m) => ArcStr::from(format_map(&m.lock())),
        Value::Json(j) => ArcStr::from(j.to_string()),
        Value::Tensor(t) => ArcStr::from(format_tensor(&t.lock())),
        Value::Opaque(o) => ArcStr::from(format!("<{}>", o.type_tag)),
    }
}

fn format_double(d: f64) -> String {
    if d.is_finite() && d.fract() == 0.0 && d.abs() < 1e15 {
        format!("{}", d as i64)
    } else {
        format!("{d}")
    }
}

fn format_datetime(epoch_secs: i64) -> String {
    use chrono::{DateTime, Utc};
    match DateTime::<Utc>::from_timestamp(epoch_secs, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => epoch_secs.to_string(),
    }
}

fn format_array(a: &ArrayData) -> String {
    if a.shape.len() <= 1 {
        let parts: Vec<String> = a.data.iter().map(|v| to_display_string(v).to_string()).collect();
        format!("[{}]", parts.join(" "))
    } else {
        // nested bracketed rendering for the outermost dimension; inner
        // dimensions are rendered the same way recursively via sub-slices.
        let row_len: usize = a.shape[1..].iter().product();
        let rows = a.shape[0];
        let mut parts = Vec::with_capacity(rows);
        for r in 0..rows {
            let sub = ArrayData { shape: a.shape[1..].to_vec(), data: a.data[r * row_len..(r + 1) * row_len].to_vec() };
            parts.push(format_array(&sub));
        }
        format!("[{}]", parts.join(" "))
    }
}

fn format_map(m: &MapData) -> String {
    let parts: Vec<String> = m.entries.iter().map(|(k, v)| format!("\"{k}\": {}", to_display_string(v))).collect();
    format!("{{{}}}", parts.join(", "))
}

fn format_tensor(t: &TensorData) -> String {
    format!("Tensor(shape={:?})", t.shape)
}
