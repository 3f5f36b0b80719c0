//! Bytecode executor (§4.6 expression evaluator, §4.8 statement
//! dispatcher, §4.2/§7 exception machinery, §4.9 scheduler glue).

use crate::arithmetic::{self, ArithOp, CmpOp};
use crate::frame::{get_var, set_var, StackFrame};
use crate::plugin::NativeImpl;
use crate::scheduler::{Scheduler, TaskStatus};
use crate::value::{to_bool, to_display_string, to_number, Value};
use arcstr::ArcStr;
use fxhash::FxHashMap;
use indexmap::IndexMap;
use jdb_compiler::{errors, Chunk, CompiledModule, Cursor, DeclaredType, FunctionInfo, OpCode, ScriptError, TypeRegistry};
use std::io::Write;
use triomphe::Arc;

/// Runtime bookkeeping for one `FOR` loop (§4.7 "FOR loop vars always
/// force=true fresh"). `body_start` is captured at `ForInit` time rather
/// than compiled in, since `ForNext` carries no jump operand in the
/// bytecode -- the loop head address only exists at runtime.
#[derive(Clone)]
pub struct ForRecord {
    pub var: ArcStr,
    pub limit: f64,
    pub step: f64,
    pub body_start: u16,
}

/// A pushed `TRY` frame (§4.2, §7): addresses resolved at compile time,
/// plus the call/value-stack depths to unwind to on a thrown error.
#[derive(Clone, Copy)]
pub struct ExceptionHandler {
    pub catch_addr: u16,
    pub finally_addr: u16,
    pub call_stack_depth: usize,
    pub value_stack_depth: usize,
}

/// Which chunk a `pc` refers to: the program's own, or one of its
/// imported modules' (compiler.rs keeps these separate rather than
/// flattening bytecode).
struct Program {
    main: Arc<Chunk>,
    modules: FxHashMap<ArcStr, Arc<Chunk>>,
}

impl Program {
    fn chunk_for(&self, module_name: &Option<ArcStr>) -> Arc<Chunk> {
        match module_name {
            Some(m) => self.modules.get(m).cloned().unwrap_or_else(|| self.main.clone()),
            None => self.main.clone(),
        }
    }
}

pub struct Vm<W: Write> {
    program: Program,
    functions: FxHashMap<ArcStr, FunctionInfo>,
    natives: FxHashMap<ArcStr, NativeImpl>,
    constants: FxHashMap<&'static str, Value>,
    globals: FxHashMap<ArcStr, Value>,
    scheduler: Scheduler,
    thread_handles: FxHashMap<u64, tokio::sync::oneshot::Receiver<Value>>,
    rt: tokio::runtime::Handle,
    /// Pass-0 UDT registry (§3, §4.4), consulted by `Type.New()`.
    types: TypeRegistry,
    pub out: W,
}

/// Outcome of running a task up to its next suspension point.
enum StepOutcome {
    Continue,
    Completed,
    Errored(ScriptError),
}

/// Result of one `Vm::debug_tick` (a single scheduler pass over all
/// ready tasks), reported against task 0 for a debugger front-end.
pub struct DebugTick {
    pub line: u32,
    pub call_depth: usize,
    pub finished: bool,
}

/// One call-stack entry as reported to a debugger front-end (`get_stacktrace`).
pub struct FrameInfo {
    pub function_name: ArcStr,
    pub line: u32,
}

/// What a single opcode's execution did to control flow.
enum Signal {
    /// Advance `pc` to wherever `cur` ended up.
    Continue,
    /// A `LineMarker`/`AWAIT`/thread-await boundary: stop this task's turn.
    Suspend,
    /// `Call`/`Return`/`StartTask` already set the task's `pc`/`bytecode`
    /// directly (possibly into a different chunk); don't stomp it with
    /// the old cursor's position.
    Jumped,
    /// `NOCMD` reached: the task is done.
    Done(Value),
}

impl<W: Write> Vm<W> {
    pub fn new(compiled: CompiledModule, rt: tokio::runtime::Handle, out: W) -> Self {
        let main = Arc::new(compiled.chunk);
        let mut modules = FxHashMap::default();
        for (name, chunk) in compiled.imported_chunks {
            modules.insert(name, Arc::new(chunk));
        }
        let mut constants = FxHashMap::default();
        constants.insert("PI", Value::Double(std::f64::consts::PI));
        constants.insert("VBNEWLINE", Value::Str(ArcStr::from("\n")));
        constants.insert("ERR", Value::Integer(0));
        constants.insert("ERL", Value::Integer(0));

        let scheduler = Scheduler::new(main.clone());
        Self {
            program: Program { main, modules },
            functions: compiled.functions,
            natives: FxHashMap::default(),
            constants,
            globals: FxHashMap::default(),
            scheduler,
            thread_handles: FxHashMap::default(),
            rt,
            types: compiled.types,
            out,
        }
    }

    /// Snapshot the global variable table, e.g. to carry a REPL's state
    /// across separately-compiled lines (each line gets its own `Vm`
    /// since compilation is whole-program, not incremental).
    pub fn globals(&self) -> &FxHashMap<ArcStr, Value> {
        &self.globals
    }

    pub fn set_globals(&mut self, globals: FxHashMap<ArcStr, Value>) {
        self.globals = globals;
    }

    pub fn install_native(&mut self, name: ArcStr, info: FunctionInfo, implementation: NativeImpl) {
        self.functions.insert(name.clone(), info);
        self.natives.insert(name, implementation);
    }

    /// Install every function a `Registry` accumulated from one or more
    /// `Module`s (§4.11).
    pub fn install_registry(&mut self, registry: crate::plugin::Registry) {
        for entry in registry.entries {
            self.install_native(entry.info.name.clone(), entry.info, entry.implementation);
        }
    }

    /// Run the scheduler until task 0 (the main program) finishes (§4.9:
    /// the run loop exits once task 0 completes or errors).
    pub fn run(&mut self) -> Result<Value, ScriptError> {
        loop {
            self.scheduler.promote_ready_awaiters();
            self.poll_thread_awaiters();
            let ids = self.scheduler.task_ids_this_tick();
            for id in ids {
                if !self.scheduler.tasks.contains_key(&id) {
                    continue;
                }
                if self.scheduler.tasks[&id].status != TaskStatus::Running {
                    continue;
                }
                self.dispatch_events(id);
                if let StepOutcome::Errored(e) = self.run_one_line(id) {
                    if let Some(task) = self.scheduler.tasks.get_mut(&id) {
                        task.status = TaskStatus::Errored;
                    }
                    if id == 0 {
                        return Err(e);
                    }
                }
            }
            self.scheduler.reap_finished();
            if self.scheduler.main_finished() {
                break;
            }
        }
        match self.scheduler.tasks.get(&0) {
            Some(t) if t.status == TaskStatus::Errored => Err(ScriptError::new(errors::CALCULATION, t.current_line)),
            Some(t) => Ok(t.result.clone()),
            None => Ok(Value::Bool(false)),
        }
    }

    /// Drive one scheduler pass (the body of `run`'s loop) and report
    /// task 0's position afterward. Lets a debugger front-end single-step
    /// the interpreter one line at a time rather than running to
    /// completion, without duplicating the scheduler's tick logic.
    pub fn debug_tick(&mut self) -> Result<DebugTick, ScriptError> {
        self.scheduler.promote_ready_awaiters();
        self.poll_thread_awaiters();
        let ids = self.scheduler.task_ids_this_tick();
        for id in ids {
            if !self.scheduler.tasks.contains_key(&id) {
                continue;
            }
            if self.scheduler.tasks[&id].status != TaskStatus::Running {
                continue;
            }
            self.dispatch_events(id);
            if let StepOutcome::Errored(e) = self.run_one_line(id) {
                if let Some(task) = self.scheduler.tasks.get_mut(&id) {
                    task.status = TaskStatus::Errored;
                }
                if id == 0 {
                    return Err(e);
                }
            }
        }
        self.scheduler.reap_finished();
        let finished = self.scheduler.main_finished();
        let (line, call_depth) = match self.scheduler.tasks.get(&0) {
            Some(t) => (t.current_line, t.call_stack.len()),
            None => (0, 0),
        };
        Ok(DebugTick { line, call_depth, finished })
    }

    /// Task 0's result once the scheduler has finished (mirrors `run`'s
    /// tail without re-running the loop); used by the debugger's `exit`
    /// path once `debug_tick` reports `finished`.
    pub fn result(&self) -> Value {
        match self.scheduler.tasks.get(&0) {
            Some(t) => t.result.clone(),
            None => Value::Bool(false),
        }
    }

    /// Task 0's call stack, innermost last (`get_stacktrace`).
    pub fn call_stack(&self) -> Vec<FrameInfo> {
        match self.scheduler.tasks.get(&0) {
            Some(t) => t.call_stack.iter().map(|f| FrameInfo { function_name: f.function_name.clone(), line: f.source_line }).collect(),
            None => Vec::new(),
        }
    }

    /// Task 0's innermost locals, or none at top level (`get_vars local`).
    pub fn locals(&self) -> Vec<(ArcStr, Value)> {
        match self.scheduler.tasks.get(&0).and_then(|t| t.call_stack.last()) {
            Some(frame) => frame.locals.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => Vec::new(),
        }
    }

    /// Every global variable (`get_vars global`).
    pub fn global_vars(&self) -> Vec<(ArcStr, Value)> {
        self.globals.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn poll_thread_awaiters(&mut self) {
        let waiting: Vec<(u64, u64)> = self
            .scheduler
            .tasks
            .values()
            .filter_map(|t| t.awaiting_thread.map(|h| (t.id, h)))
            .collect();
        for (task_id, handle) in waiting {
            let received = self.thread_handles.get_mut(&handle).and_then(|rx| rx.try_recv().ok());
            if let Some(v) = received {
                self.thread_handles.remove(&handle);
                if let Some(task) = self.scheduler.tasks.get_mut(&task_id) {
                    task.result = v;
                    task.awaiting_thread = None;
                    task.status = TaskStatus::Running;
                }
            }
        }
    }

    fn dispatch_events(&mut self, task_id: u64) {
        let events = self.scheduler.drain_events(task_id);
        for (name, data) in events {
            let handler = self.scheduler.tasks.get(&task_id).and_then(|t| t.event_handlers.get(&name).cloned());
            if let Some(handler) = handler {
                self.call_event_handler(task_id, &handler, data);
            }
        }
    }

    /// Execute opcodes for `task_id` until the next `LineMarker` boundary,
    /// an `AWAIT` suspension, or an unhandled error (§4.9: a task executes
    /// one logical line per visit unless it suspends).
    fn run_one_line(&mut self, task_id: u64) -> StepOutcome {
        let mut crossed_first_marker = false;
        loop {
            let (bytecode, pc) = {
                let t = &self.scheduler.tasks[&task_id];
                (t.bytecode.clone(), t.pc as usize)
            };
            let mut cursor = Cursor::new(&bytecode.code, pc);
            if cursor.at_end() {
                self.finish_task(task_id, Value::Bool(false));
                return StepOutcome::Completed;
            }
            let op_start = cursor.pc;
            let op = match cursor.read_op() {
                Some(op) => op,
                None => {
                    self.finish_task(task_id, Value::Bool(false));
                    return StepOutcome::Completed;
                }
            };
            // A second `LineMarker` means the previous line is done; stop
            // here without consuming it so the next tick starts fresh on
            // it (§4.9: one logical line executed per visit).
            if op == OpCode::LineMarker && crossed_first_marker {
                self.set_pc(task_id, op_start as u16);
                return StepOutcome::Continue;
            }
            if op == OpCode::LineMarker {
                crossed_first_marker = true;
            }
            match self.exec_one(task_id, &mut cursor, op) {
                Ok(Signal::Continue) => {
                    self.set_pc(task_id, cursor.pc as u16);
                }
                Ok(Signal::Suspend) => {
                    self.set_pc(task_id, cursor.pc as u16);
                    return StepOutcome::Continue;
                }
                Ok(Signal::Jumped) => {
                    // task.pc/bytecode already updated by the opcode handler.
                }
                Ok(Signal::Done(v)) => {
                    self.finish_task(task_id, v);
                    return StepOutcome::Completed;
                }
                Err(err) => {
                    let attributed = ScriptError { line: self.line(task_id), ..err };
                    if self.try_handle_exception(task_id, &attributed) {
                        continue;
                    }
                    return StepOutcome::Errored(attributed);
                }
            }
        }
    }

    fn set_pc(&mut self, task_id: u64, pc: u16) {
        if let Some(t) = self.scheduler.tasks.get_mut(&task_id) {
            t.pc = pc;
        }
    }

    fn finish_task(&mut self, task_id: u64, result: Value) {
        if let Some(t) = self.scheduler.tasks.get_mut(&task_id) {
            t.status = TaskStatus::Completed;
            t.result = result;
        }
    }

    /// `TRY`/`CATCH`/`FINALLY` (§4.2, §7): unwind the call/value stacks to
    /// the handler's depth and jump to its `CATCH` address, recording the
    /// error for `ERR`/`ERL`.
    fn try_handle_exception(&mut self, task_id: u64, err: &ScriptError) -> bool {
        let handler = self.scheduler.tasks.get_mut(&task_id).and_then(|t| t.exceptions.handler_stack.pop());
        match handler {
            Some(h) => {
                if let Some(t) = self.scheduler.tasks.get_mut(&task_id) {
                    t.call_stack.truncate(h.call_stack_depth);
                    t.value_stack.truncate(h.value_stack_depth);
                    t.pc = h.catch_addr;
                    t.current_line = err.line;
                }
                self.constants.insert("ERR", Value::Integer(err.code as i64));
                self.constants.insert("ERL", Value::Integer(err.line as i64));
                true
            }
            None => false,
        }
    }

    fn push(&mut self, task_id: u64, v: Value) {
        if let Some(t) = self.scheduler.tasks.get_mut(&task_id) {
            t.value_stack.push(v);
        }
    }

    fn pop(&mut self, task_id: u64) -> Value {
        self.scheduler.tasks.get_mut(&task_id).and_then(|t| t.value_stack.pop()).unwrap_or(Value::Bool(false))
    }

    fn pop_n(&mut self, task_id: u64, n: usize) -> Vec<Value> {
        let mut out: Vec<Value> = (0..n).map(|_| self.pop(task_id)).collect();
        out.reverse();
        out
    }

    fn line(&self, task_id: u64) -> u32 {
        self.scheduler.tasks.get(&task_id).map(|t| t.current_line).unwrap_or(0)
    }

    fn exec_one(&mut self, task_id: u64, cur: &mut Cursor, op: OpCode) -> Result<Signal, ScriptError> {
        match op {
            OpCode::NoCmd => return Ok(Signal::Done(self.scheduler.tasks[&task_id].result.clone())),
            OpCode::LineMarker => {
                let line = cur.read_u16();
                if let Some(t) = self.scheduler.tasks.get_mut(&task_id) {
                    t.current_line = line as u32;
                    if let Some(f) = t.call_stack.last_mut() {
                        f.source_line = line as u32;
                    }
                }
            }
            // Catalog entries with no current emission site; handled
            // defensively rather than treated as unreachable.
            OpCode::StmtSep | OpCode::DoLoopHead | OpCode::Let => {}
            OpCode::PushConstant => {
                let name = cur.read_cstr().to_string();
                let v = self.constants.get(name.as_str()).cloned().unwrap_or(Value::Bool(false));
                self.push(task_id, v);
            }
            OpCode::PushIntLiteral => {
                let v = cur.read_i64();
                self.push(task_id, Value::Integer(v));
            }
            OpCode::PushNumberLiteral => {
                let v = cur.read_f64();
                self.push(task_id, Value::Double(v));
            }
            OpCode::PushStringLiteral => {
                let s = cur.read_cstr().to_string();
                self.push(task_id, Value::Str(ArcStr::from(s)));
            }
            OpCode::PushBool => {
                let b = cur.read_u8();
                self.push(task_id, Value::Bool(b != 0));
            }
            OpCode::LoadVar => {
                let name = cur.read_cstr().to_string();
                let v = self.load_var(task_id, &name).ok_or_else(|| ScriptError::new(errors::VARIABLE_NOT_FOUND, self.line(task_id)))?;
                self.push(task_id, v);
            }
            OpCode::StoreVar => {
                let name = cur.read_cstr().to_string();
                let v = self.pop(task_id);
                self.store_var(task_id, ArcStr::from(name), v, false);
            }
            OpCode::LoadIndex => {
                let n = cur.read_u8() as usize;
                let indices = self.pop_n(task_id, n);
                let base = self.pop(task_id);
                let line = self.line(task_id);
                let v = self.load_index(&base, &indices, line)?;
                self.push(task_id, v);
            }
            OpCode::StoreIndex => {
                let name = cur.read_cstr().to_string();
                let n = cur.read_u8() as usize;
                let value = self.pop(task_id);
                let indices = self.pop_n(task_id, n);
                let line = self.line(task_id);
                let base = self.load_var(task_id, &name).ok_or_else(|| ScriptError::new(errors::VARIABLE_NOT_FOUND, line))?;
                self.store_index(&base, &indices, value, line)?;
            }
            OpCode::LoadMapKey => {
                let key = self.pop(task_id);
                let base = self.pop(task_id);
                let line = self.line(task_id);
                let v = self.load_map_key(&base, &key, line)?;
                self.push(task_id, v);
            }
            OpCode::StoreMapKey => {
                let name = cur.read_cstr().to_string();
                // stack order: key pushed first, value pushed last.
                let value = self.pop(task_id);
                let key = self.pop(task_id);
                self.store_map_key(task_id, &name, &key, value);
            }
            OpCode::LoadMember => {
                let member = cur.read_cstr().to_string();
                let base = self.pop(task_id);
                let line = self.line(task_id);
                let v = self.load_member(&base, &member, line)?;
                self.push(task_id, v);
            }
            OpCode::StoreMember => {
                let name = cur.read_cstr().to_string();
                let member = cur.read_cstr().to_string();
                let value = self.pop(task_id);
                let line = self.line(task_id);
                let base = self.load_var(task_id, &name).ok_or_else(|| ScriptError::new(errors::VARIABLE_NOT_FOUND, line))?;
                self.store_member(&base, &member, value, line)?;
            }
            OpCode::MakeArray => {
                let n = cur.read_u16() as usize;
                let elems = self.pop_n(task_id, n);
                self.push(task_id, make_array(elems));
            }
            OpCode::MakeMap => {
                let n = cur.read_u16() as usize;
                let mut pairs = Vec::with_capacity(n);
                for _ in 0..n {
                    let value = self.pop(task_id);
                    let key = self.pop(task_id);
                    pairs.push((key, value));
                }
                pairs.reverse();
                let mut entries = IndexMap::new();
                for (k, v) in pairs {
                    entries.insert(ArcStr::from(to_display_string(&k).as_str()), v);
                }
                self.push(task_id, Value::map(entries));
            }
            OpCode::MakeFuncRef => {
                let name = cur.read_cstr().to_string();
                self.push(task_id, Value::FuncRef(ArcStr::from(name)));
            }
            OpCode::NewInstance => {
                let type_name = cur.read_cstr().to_string();
                let line = self.line(task_id);
                let v = self.instantiate_type(&type_name, line)?;
                self.push(task_id, v);
            }
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Pow => {
                let b = self.pop(task_id);
                let a = self.pop(task_id);
                let line = self.line(task_id);
                let result = arithmetic::eval_arith(arith_op(op), &a, &b, line)?;
                self.push(task_id, result);
            }
            OpCode::CmpEq | OpCode::CmpNe | OpCode::CmpLt | OpCode::CmpGt | OpCode::CmpLe | OpCode::CmpGe => {
                let b = self.pop(task_id);
                let a = self.pop(task_id);
                let line = self.line(task_id);
                let result = arithmetic::eval_cmp(cmp_op(op), &a, &b, line)?;
                self.push(task_id, result);
            }
            OpCode::LogAnd => {
                let b = self.pop(task_id);
                let a = self.pop(task_id);
                self.push(task_id, arithmetic::eval_logical_and(&a, &b));
            }
            OpCode::LogOr => {
                let b = self.pop(task_id);
                let a = self.pop(task_id);
                self.push(task_id, arithmetic::eval_logical_or(&a, &b));
            }
            OpCode::Neg => {
                let a = self.pop(task_id);
                let line = self.line(task_id);
                let v = arithmetic::eval_neg(&a, line)?;
                self.push(task_id, v);
            }
            OpCode::Not => {
                let a = self.pop(task_id);
                self.push(task_id, arithmetic::eval_not(&a));
            }
            OpCode::Jump => {
                let addr = cur.read_u16();
                cur.jump(addr);
            }
            OpCode::JumpIfFalse => {
                let addr = cur.read_u16();
                let cond = self.pop(task_id);
                if !to_bool(&cond) {
                    cur.jump(addr);
                }
            }
            OpCode::ForInit => {
                let var = cur.read_cstr().to_string();
                let step = to_number(&self.pop(task_id));
                let limit = to_number(&self.pop(task_id));
                let start = to_number(&self.pop(task_id));
                self.store_var(task_id, ArcStr::from(var.as_str()), Value::Double(start), true);
                let record = ForRecord { var: ArcStr::from(var), limit, step, body_start: cur.pc as u16 };
                if let Some(t) = self.scheduler.tasks.get_mut(&task_id) {
                    t.for_stack.push(record);
                }
            }
            OpCode::ForNext => {
                let record = self.scheduler.tasks.get(&task_id).and_then(|t| t.for_stack.last().cloned());
                match record {
                    Some(record) => {
                        let cur_val = to_number(&self.load_var(task_id, &record.var).unwrap_or(Value::Double(0.0)));
                        let next_val = cur_val + record.step;
                        let keep_going = if record.step >= 0.0 { next_val <= record.limit } else { next_val >= record.limit };
                        self.store_var(task_id, record.var.clone(), Value::Double(next_val), true);
                        if keep_going {
                            cur.jump(record.body_start);
                        } else if let Some(t) = self.scheduler.tasks.get_mut(&task_id) {
                            t.for_stack.pop();
                        }
                    }
                    None => return Err(ScriptError::new(errors::NEXT_WITHOUT_FOR, 0)),
                }
            }
            OpCode::ExitFor => {
                let addr = cur.read_u16();
                if let Some(t) = self.scheduler.tasks.get_mut(&task_id) {
                    t.for_stack.pop();
                }
                cur.jump(addr);
            }
            OpCode::DoLoopTest => {
                let addr = cur.read_u16();
                let cond = self.pop(task_id);
                if to_bool(&cond) {
                    cur.jump(addr);
                }
            }
            OpCode::ExitDo => {
                let addr = cur.read_u16();
                cur.jump(addr);
            }
            OpCode::FuncDecl => {
                let end_addr = cur.read_u16();
                cur.jump(end_addr);
            }
            OpCode::Call => {
                let name = cur.read_cstr().to_string();
                let argc = cur.read_u8() as usize;
                let args = self.pop_n(task_id, argc);
                self.dispatch_call(task_id, &name, args, cur.pc as u16)?;
                return Ok(Signal::Jumped);
            }
            OpCode::CallValue => {
                let argc = cur.read_u8() as usize;
                let args = self.pop_n(task_id, argc);
                let func = self.pop(task_id);
                match func {
                    Value::FuncRef(name) => {
                        self.dispatch_call(task_id, &name, args, cur.pc as u16)?;
                        return Ok(Signal::Jumped);
                    }
                    _ => return Err(ScriptError::new(errors::TYPE_MISMATCH, 0)),
                }
            }
            OpCode::Return => {
                let v = self.pop(task_id);
                self.do_return(task_id, v);
                return Ok(Signal::Jumped);
            }
            OpCode::PushHandler => {
                let catch_addr = cur.read_u16();
                let finally_addr = cur.read_u16();
                let (call_depth, value_depth) = {
                    let t = &self.scheduler.tasks[&task_id];
                    (t.call_stack.len(), t.value_stack.len())
                };
                if let Some(t) = self.scheduler.tasks.get_mut(&task_id) {
                    t.exceptions.handler_stack.push(ExceptionHandler {
                        catch_addr,
                        finally_addr,
                        call_stack_depth: call_depth,
                        value_stack_depth: value_depth,
                    });
                }
            }
            OpCode::PopHandler => {
                if let Some(t) = self.scheduler.tasks.get_mut(&task_id) {
                    t.exceptions.handler_stack.pop();
                }
            }
            OpCode::StartTask => {
                let name = cur.read_cstr().to_string();
                let argc = cur.read_u8() as usize;
                let args = self.pop_n(task_id, argc);
                let new_id = self.start_task(&name, args)?;
                self.push(task_id, Value::TaskRef(new_id));
            }
            OpCode::Await => {
                let target = self.pop(task_id);
                match target {
                    Value::TaskRef(id) => {
                        self.scheduler.await_task(task_id, id);
                        return Ok(Signal::Suspend);
                    }
                    Value::ThreadHandle(id) => {
                        if let Some(t) = self.scheduler.tasks.get_mut(&task_id) {
                            t.awaiting_thread = Some(id);
                            t.status = TaskStatus::PausedOnAwait;
                        }
                        return Ok(Signal::Suspend);
                    }
                    other => self.push(task_id, other),
                }
            }
            OpCode::Bsync => {
                // By the time this opcode runs, the wrapped call expression
                // has already been compiled and executed as an ordinary
                // synchronous call; BSYNC here just hands the already-known
                // value to a background thread and returns a handle the
                // script can AWAIT. True backgrounding of the call itself
                // would need compiler support this engine doesn't have.
                let v = self.pop(task_id);
                let handle = self.spawn_bsync(v);
                self.push(task_id, Value::ThreadHandle(handle));
            }
            OpCode::OnEvent => {
                let event = cur.read_cstr().to_string();
                let handler = cur.read_cstr().to_string();
                if let Some(t) = self.scheduler.tasks.get_mut(&task_id) {
                    t.event_handlers.insert(ArcStr::from(event), ArcStr::from(handler));
                }
            }
            OpCode::RaiseEvent => {
                let name = cur.read_cstr().to_string();
                let data = self.pop(task_id);
                self.scheduler.raise_event(task_id, ArcStr::from(name), data);
            }
            OpCode::Goto => {
                let addr = cur.read_u16();
                cur.jump(addr);
            }
            OpCode::Dim => {
                let name = cur.read_cstr().to_string();
                self.store_var(task_id, ArcStr::from(name), Value::Integer(0), false);
            }
            OpCode::Print => {
                let n = cur.read_u8() as usize;
                let vals = self.pop_n(task_id, n);
                let parts: Vec<String> = vals.iter().map(|v| to_display_string(v).to_string()).collect();
                let _ = writeln!(self.out, "{}", parts.join(" "));
            }
            OpCode::Input => {
                let name = cur.read_cstr().to_string();
                let mut line = String::new();
                let _ = std::io::stdin().read_line(&mut line);
                let value = parse_input(line.trim());
                self.store_var(task_id, ArcStr::from(name), value, false);
            }
            OpCode::Pop => {
                self.pop(task_id);
            }
        }
        Ok(Signal::Continue)
    }

    fn load_var(&self, task_id: u64, name: &str) -> Option<Value> {
        let t = self.scheduler.tasks.get(&task_id)?;
        get_var(&self.globals, &t.call_stack, name)
    }

    fn store_var(&mut self, task_id: u64, name: ArcStr, value: Value, force: bool) {
        let Some(t) = self.scheduler.tasks.get_mut(&task_id) else { return };
        let mut frames = std::mem::take(&mut t.call_stack);
        set_var(&mut self.globals, &mut frames, name, value, force);
        self.scheduler.tasks.get_mut(&task_id).unwrap().call_stack = frames;
    }

    fn load_index(&self, base: &Value, indices: &[Value], line: u32) -> Result<Value, ScriptError> {
        match base {
            Value::Array(a) => {
                let g = a.lock();
                let idx = non_negative_indices(indices, line)?;
                let flat = g.flat_index(&idx).ok_or_else(|| ScriptError::new(errors::ARRAY_OUT_OF_BOUNDS, line))?;
                Ok(g.data[flat].clone())
            }
            _ => Err(ScriptError::new(errors::TYPE_MISMATCH, line)),
        }
    }

    fn store_index(&self, base: &Value, indices: &[Value], value: Value, line: u32) -> Result<(), ScriptError> {
        match base {
            Value::Array(a) => {
                let mut g = a.lock();
                let idx = non_negative_indices(indices, line)?;
                let flat = g.flat_index(&idx).ok_or_else(|| ScriptError::new(errors::ARRAY_OUT_OF_BOUNDS, line))?;
                g.data[flat] = value;
                Ok(())
            }
            _ => Err(ScriptError::new(errors::TYPE_MISMATCH, line)),
        }
    }

    fn load_map_key(&self, base: &Value, key: &Value, line: u32) -> Result<Value, ScriptError> {
        match base {
            Value::Map(m) => {
                let g = m.lock();
                let k = to_display_string(key);
                g.entries.get(k.as_str()).cloned().ok_or_else(|| ScriptError::new(errors::BAD_SUBSCRIPT, line))
            }
            Value::Json(j) => {
                let k = to_display_string(key);
                match j.get(k.as_str()) {
                    Some(v) => Ok(Value::Json(Arc::new(v.clone()))),
                    None => Err(ScriptError::new(errors::BAD_SUBSCRIPT, line)),
                }
            }
            _ => Err(ScriptError::new(errors::TYPE_MISMATCH, line)),
        }
    }

    fn store_map_key(&mut self, task_id: u64, name: &str, key: &Value, value: Value) {
        let base = self.load_var(task_id, name);
        match base {
            Some(Value::Map(m)) => {
                let mut g = m.lock();
                g.entries.insert(ArcStr::from(to_display_string(key).as_str()), value);
            }
            _ => {
                let mut entries = IndexMap::new();
                entries.insert(ArcStr::from(to_display_string(key).as_str()), value);
                self.store_var(task_id, ArcStr::from(name), Value::map(entries), false);
            }
        }
    }

    fn load_member(&self, base: &Value, member: &str, line: u32) -> Result<Value, ScriptError> {
        match base {
            Value::Map(m) => {
                let g = m.lock();
                g.entries.get(member).cloned().ok_or_else(|| ScriptError::new(errors::BAD_SUBSCRIPT, line))
            }
            Value::Tensor(t) => {
                if member == "grad" {
                    let g = t.lock();
                    let data: Vec<Value> = g.grad.clone().unwrap_or_default().into_iter().map(Value::Double).collect();
                    Ok(Value::array(g.shape.clone(), data))
                } else {
                    Err(ScriptError::new(errors::BAD_SUBSCRIPT, line))
                }
            }
            _ => Err(ScriptError::new(errors::TYPE_MISMATCH, line)),
        }
    }

    fn store_member(&self, base: &Value, member: &str, value: Value, line: u32) -> Result<(), ScriptError> {
        match base {
            Value::Map(m) => {
                let mut g = m.lock();
                g.entries.insert(ArcStr::from(member), value);
                Ok(())
            }
            _ => Err(ScriptError::new(errors::TYPE_MISMATCH, line)),
        }
    }

    /// `Type.New()` (§3): build a `map` tagged with `udt-type-name`,
    /// members zero-initialized per their declared type.
    fn instantiate_type(&self, type_name: &str, line: u32) -> Result<Value, ScriptError> {
        let info = self.types.get(type_name).ok_or_else(|| ScriptError::new(errors::TYPE_MISMATCH, line))?;
        let mut entries = IndexMap::new();
        for (member_name, member) in &info.members {
            let default = match &member.declared_type {
                DeclaredType::Integer => Value::Integer(0),
                DeclaredType::Number => Value::Double(0.0),
                DeclaredType::StringT => Value::empty_string(),
                DeclaredType::Bool => Value::Bool(false),
                DeclaredType::Map => Value::map(IndexMap::new()),
                DeclaredType::DateTime => Value::DateTime(0),
                DeclaredType::Named(_) => Value::Integer(0),
            };
            entries.insert(member_name.clone(), default);
        }
        Ok(Value::Map(Arc::new(parking_lot::Mutex::new(crate::value::MapData {
            udt_type_name: Some(ArcStr::from(type_name)),
            entries,
        }))))
    }

    /// `CALL`/function invocation (§4.6, §4.8): natives run inline;
    /// user functions push an activation record and switch the task's
    /// `pc`/`bytecode` to the callee's chunk, which may belong to a
    /// different imported module than the caller's.
    fn dispatch_call(&mut self, task_id: u64, name: &str, args: Vec<Value>, return_pc: u16) -> Result<(), ScriptError> {
        let line = self.line(task_id);
        if let Some(native) = self.natives.get(name).cloned() {
            if let Some(info) = self.functions.get(name) {
                if !info.arity_ok(args.len()) {
                    return Err(ScriptError::new(errors::WRONG_ARG_COUNT, line));
                }
            }
            let result = native(&args).map_err(|mut e| {
                e.line = line;
                e
            })?;
            self.push(task_id, result);
            self.set_pc(task_id, return_pc);
            return Ok(());
        }
        let info = self.functions.get(name).cloned().ok_or_else(|| ScriptError::new(errors::FUNC_NAME_NOT_FOUND, line))?;
        if !info.arity_ok(args.len()) {
            return Err(ScriptError::new(errors::WRONG_ARG_COUNT, line));
        }
        let target_chunk = self.program.chunk_for(&info.module_name);
        let locals = bind_parameters(&info, args);
        let (old_bytecode, for_depth) = {
            let t = &self.scheduler.tasks[&task_id];
            (t.bytecode.clone(), t.for_stack.len())
        };
        let mut frame = StackFrame::new(ArcStr::from(name), return_pc, old_bytecode, for_depth, info.is_async);
        frame.locals = locals;
        if let Some(t) = self.scheduler.tasks.get_mut(&task_id) {
            t.call_stack.push(frame);
            t.bytecode = target_chunk;
            t.pc = info.start_bytecode_offset;
        }
        Ok(())
    }

    fn do_return(&mut self, task_id: u64, value: Value) {
        let frame = self.scheduler.tasks.get_mut(&task_id).and_then(|t| t.call_stack.pop());
        match frame {
            Some(frame) => {
                if let Some(t) = self.scheduler.tasks.get_mut(&task_id) {
                    t.bytecode = frame.return_bytecode;
                    t.pc = frame.return_pc;
                    t.for_stack.truncate(frame.for_stack_depth_on_entry);
                }
                self.push(task_id, value);
            }
            None => self.finish_task(task_id, value),
        }
    }

    /// `STARTTASK`: a new cooperative task with its own activation record,
    /// beginning at the callee's entry point (§4.9).
    fn start_task(&mut self, name: &str, args: Vec<Value>) -> Result<u64, ScriptError> {
        let info = self.functions.get(name).cloned().ok_or_else(|| ScriptError::new(errors::FUNC_NAME_NOT_FOUND, 0))?;
        let target_chunk = self.program.chunk_for(&info.module_name);
        let id = self.scheduler.start_task(target_chunk.clone(), info.start_bytecode_offset);
        let locals = bind_parameters(&info, args);
        if let Some(t) = self.scheduler.tasks.get_mut(&id) {
            let mut frame = StackFrame::new(ArcStr::from(name), 0, target_chunk, 0, true);
            frame.locals = locals;
            t.call_stack.push(frame);
        }
        Ok(id)
    }

    /// Event handlers run to completion between ticks rather than mid-line
    /// (§4.9); a full re-entrant dispatch isn't needed for the one-argument
    /// notification handlers `ON EVENT` targets, so this hands the event's
    /// payload to the handler by executing it as an ordinary call using a
    /// scratch task that's immediately reaped.
    fn call_event_handler(&mut self, _task_id: u64, name: &str, data: Value) {
        let info = match self.functions.get(name).cloned() {
            Some(info) => info,
            None => return,
        };
        let target_chunk = self.program.chunk_for(&info.module_name);
        let scratch_id = self.scheduler.start_task(target_chunk.clone(), info.start_bytecode_offset);
        let locals = bind_parameters(&info, vec![data]);
        if let Some(t) = self.scheduler.tasks.get_mut(&scratch_id) {
            let mut frame = StackFrame::new(ArcStr::from(name), 0, target_chunk, 0, false);
            frame.locals = locals;
            t.call_stack.push(frame);
        }
        while matches!(self.scheduler.tasks.get(&scratch_id).map(|t| t.status), Some(TaskStatus::Running)) {
            if matches!(self.run_one_line(scratch_id), StepOutcome::Errored(_)) {
                break;
            }
        }
        self.scheduler.tasks.shift_remove(&scratch_id);
    }

    fn spawn_bsync(&mut self, value: Value) -> u64 {
        let id = crate::value::next_thread_handle_id();
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.rt.spawn_blocking(move || {
            let _ = tx.send(value);
        });
        self.thread_handles.insert(id, rx);
        id
    }
}

fn bind_parameters(info: &FunctionInfo, args: Vec<Value>) -> FxHashMap<ArcStr, Value> {
    let mut locals = FxHashMap::default();
    if info.arity < 0 && !info.parameter_names.is_empty() {
        let fixed = info.parameter_names.len() - 1;
        for (p, a) in info.parameter_names[..fixed].iter().zip(args.iter()) {
            locals.insert(p.clone(), a.clone());
        }
        let rest: Vec<Value> = args[fixed.min(args.len())..].to_vec();
        let n = rest.len();
        if let Some(last) = info.parameter_names.last() {
            locals.insert(last.clone(), Value::array(vec![n], rest));
        }
    } else {
        for (p, a) in info.parameter_names.iter().zip(args.into_iter()) {
            locals.insert(p.clone(), a);
        }
    }
    locals
}

fn arith_op(op: OpCode) -> ArithOp {
    match op {
        OpCode::Add => ArithOp::Add,
        OpCode::Sub => ArithOp::Sub,
        OpCode::Mul => ArithOp::Mul,
        OpCode::Div => ArithOp::Div,
        OpCode::Mod => ArithOp::Mod,
        OpCode::Pow => ArithOp::Pow,
        _ => unreachable!(),
    }
}

fn cmp_op(op: OpCode) -> CmpOp {
    match op {
        OpCode::CmpEq => CmpOp::Eq,
        OpCode::CmpNe => CmpOp::Ne,
        OpCode::CmpLt => CmpOp::Lt,
        OpCode::CmpGt => CmpOp::Gt,
        OpCode::CmpLe => CmpOp::Le,
        OpCode::CmpGe => CmpOp::Ge,
        _ => unreachable!(),
    }
}

/// `MAKEARRAY` (§4.6): if every popped element is itself an array of the
/// same shape, stack them into one higher-rank array (matrix/tensor
/// literal syntax); otherwise build a flat 1-D array of the values as-is.
/// Convert index values to `usize`, erroring on negatives instead of
/// wrapping them into a huge unsigned value (§9 open question).
fn non_negative_indices(indices: &[Value], line: u32) -> Result<Vec<usize>, ScriptError> {
    indices
        .iter()
        .map(|v| {
            let n = to_number(v);
            if n < 0.0 {
                Err(ScriptError::new(errors::ARRAY_OUT_OF_BOUNDS, line))
            } else {
                Ok(n as usize)
            }
        })
        .collect()
}

fn make_array(elems: Vec<Value>) -> Value {
    let common_shape = match elems.first() {
        Some(Value::Array(a)) => Some(a.lock().shape.clone()),
        _ => None,
    };
    if let Some(shape) = common_shape {
        let mut flat = Vec::new();
        let mut consistent = true;
        for e in &elems {
            match e {
                Value::Array(a) => {
                    let g = a.lock();
                    if g.shape != shape {
                        consistent = false;
                        break;
                    }
                    flat.extend(g.data.iter().cloned());
                }
                _ => {
                    consistent = false;
                    break;
                }
            }
        }
        if consistent {
            let mut out_shape = vec![elems.len()];
            out_shape.extend(shape);
            return Value::array(out_shape, flat);
        }
    }
    Value::array(vec![elems.len()], elems)
}

fn parse_input(s: &str) -> Value {
    if let Ok(i) = s.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(d) = s.parse::<f64>() {
        Value::Double(d)
    } else {
        Value::Str(ArcStr::from(s))
    }
}
