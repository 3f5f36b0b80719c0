//! Call stack frames and variable scoping (§3, §4.7).

use crate::value::Value;
use arcstr::ArcStr;
use fxhash::FxHashMap;
use jdb_compiler::Chunk;
use triomphe::Arc;

/// One activation record. `return_bytecode` lets a call into an imported
/// module's chunk return correctly into the caller's own chunk even though
/// they are separate `Chunk`s (compiler.rs keeps per-module chunks
/// distinct rather than flattening them into one bytecode stream).
pub struct StackFrame {
    pub function_name: ArcStr,
    pub source_line: u32,
    pub locals: FxHashMap<ArcStr, Value>,
    pub return_pc: u16,
    pub return_bytecode: Arc<Chunk>,
    pub previous_function_table: Option<Arc<FxHashMap<ArcStr, jdb_compiler::FunctionInfo>>>,
    pub for_stack_depth_on_entry: usize,
    pub is_async_call: bool,
}

impl StackFrame {
    pub fn new(function_name: ArcStr, return_pc: u16, return_bytecode: Arc<Chunk>, for_stack_depth_on_entry: usize, is_async_call: bool) -> Self {
        Self {
            function_name,
            source_line: 0,
            locals: FxHashMap::default(),
            return_pc,
            return_bytecode,
            previous_function_table: None,
            for_stack_depth_on_entry,
            is_async_call,
        }
    }
}

/// Variable scope: the call stack of frames plus the global table shared
/// by every task (§4.7).
pub struct Scopes {
    pub frames: Vec<StackFrame>,
    pub globals: FxHashMap<ArcStr, Value>,
}

impl Scopes {
    pub fn new() -> Self {
        Self { frames: Vec::new(), globals: FxHashMap::default() }
    }

    fn innermost(&mut self) -> Option<&mut StackFrame> {
        self.frames.last_mut()
    }

    /// `get` (§4.7): walk the call stack from the innermost frame outward,
    /// returning the first frame's binding of `name`; fall through to
    /// globals only if no frame on the stack has it. This is what lets a
    /// lambda or nested `FUNC` body capture a caller's (non-global) local
    /// by dynamic scope lookup rather than just the frame it's running in.
    pub fn get(&self, name: &str) -> Option<&Value> {
        for frame in self.frames.iter().rev() {
            if let Some(v) = frame.locals.get(name) {
                return Some(v);
            }
        }
        self.globals.get(name)
    }

    /// `set` (§4.7), three sub-rules:
    /// 1. if the innermost frame already has `name` as a local, update it.
    /// 2. else if a global `name` exists and `force` is false, update the global.
    /// 3. else create a new binding: local if inside a frame, else global.
    /// `force = true` (FOR-loop induction variables) always creates/updates
    /// a fresh local in the innermost frame, skipping rules 1-2 entirely...
    /// except a FOR variable that already exists locally is still just
    /// reassigned in place, so rule 1 is checked first regardless of force.
    pub fn set(&mut self, name: ArcStr, value: Value, force: bool) {
        if let Some(frame) = self.frames.last_mut() {
            if frame.locals.contains_key(&name) {
                frame.locals.insert(name, value);
                return;
            }
        }
        if force {
            match self.innermost() {
                Some(frame) => {
                    frame.locals.insert(name, value);
                }
                None => {
                    self.globals.insert(name, value);
                }
            }
            return;
        }
        if self.globals.contains_key(&name) {
            self.globals.insert(name, value);
            return;
        }
        match self.innermost() {
            Some(frame) => {
                frame.locals.insert(name, value);
            }
            None => {
                self.globals.insert(name, value);
            }
        }
    }
}

impl Default for Scopes {
    fn default() -> Self {
        Self::new()
    }
}

/// Free-function form of `Scopes::get`/`set` for callers (the VM) that
/// keep frames inside a `Task` rather than inside a standalone `Scopes`.
pub fn get_var(globals: &FxHashMap<ArcStr, Value>, frames: &[StackFrame], name: &str) -> Option<Value> {
    for frame in frames.iter().rev() {
        if let Some(v) = frame.locals.get(name) {
            return Some(v.clone());
        }
    }
    globals.get(name).cloned()
}

pub fn set_var(globals: &mut FxHashMap<ArcStr, Value>, frames: &mut [StackFrame], name: ArcStr, value: Value, force: bool) {
    if let Some(frame) = frames.last_mut() {
        if frame.locals.contains_key(&name) {
            frame.locals.insert(name, value);
            return;
        }
    }
    if force {
        match frames.last_mut() {
            Some(frame) => {
                frame.locals.insert(name, value);
            }
            None => {
                globals.insert(name, value);
            }
        }
        return;
    }
    if globals.contains_key(&name) {
        globals.insert(name, value);
        return;
    }
    match frames.last_mut() {
        Some(frame) => {
            frame.locals.insert(name, value);
        }
        None => {
            globals.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_updates_existing_global_without_force() {
        let mut s = Scopes::new();
        s.globals.insert(ArcStr::from("x"), Value::Integer(1));
        s.frames.push(StackFrame::new(ArcStr::from("main"), 0, Arc::new(Chunk::new()), 0, false));
        s.set(ArcStr::from("x"), Value::Integer(2), false);
        assert!(s.frames[0].locals.is_empty());
        assert_eq!(s.globals.get("x").map(|v| matches!(v, Value::Integer(2))), Some(true));
    }

    #[test]
    fn set_force_always_creates_local() {
        let mut s = Scopes::new();
        s.globals.insert(ArcStr::from("i"), Value::Integer(1));
        s.frames.push(StackFrame::new(ArcStr::from("main"), 0, Arc::new(Chunk::new()), 0, false));
        s.set(ArcStr::from("i"), Value::Integer(0), true);
        assert!(s.frames[0].locals.contains_key("i"));
        assert_eq!(s.globals.get("i").map(|v| matches!(v, Value::Integer(1))), Some(true));
    }

    #[test]
    fn get_prefers_local_over_global() {
        let mut s = Scopes::new();
        s.globals.insert(ArcStr::from("x"), Value::Integer(1));
        s.frames.push(StackFrame::new(ArcStr::from("main"), 0, Arc::new(Chunk::new()), 0, false));
        s.frames[0].locals.insert(ArcStr::from("x"), Value::Integer(9));
        match s.get("x") {
            Some(Value::Integer(9)) => {}
            other => panic!("expected local shadow, got {other:?}"),
        }
    }

    #[test]
    fn get_walks_outward_past_the_innermost_frame() {
        // A nested call (or lambda body) whose own frame has no binding
        // for `x` must still see the enclosing caller frame's local --
        // this is what lambda capture-by-dynamic-scope-lookup relies on.
        let mut s = Scopes::new();
        s.frames.push(StackFrame::new(ArcStr::from("outer"), 0, Arc::new(Chunk::new()), 0, false));
        s.frames[0].locals.insert(ArcStr::from("x"), Value::Integer(42));
        s.frames.push(StackFrame::new(ArcStr::from("inner"), 0, Arc::new(Chunk::new()), 0, false));
        match s.get("x") {
            Some(Value::Integer(42)) => {}
            other => panic!("expected to find outer frame's local, got {other:?}"),
        }
    }

    #[test]
    fn get_var_free_function_walks_outward_too() {
        let globals = FxHashMap::default();
        let mut outer = StackFrame::new(ArcStr::from("outer"), 0, Arc::new(Chunk::new()), 0, false);
        outer.locals.insert(ArcStr::from("y"), Value::Integer(7));
        let inner = StackFrame::new(ArcStr::from("inner"), 0, Arc::new(Chunk::new()), 0, false);
        let frames = vec![outer, inner];
        match get_var(&globals, &frames, "y") {
            Some(Value::Integer(7)) => {}
            other => panic!("expected outer frame's local, got {other:?}"),
        }
    }
}
