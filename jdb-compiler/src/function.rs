use arcstr::ArcStr;

/// Everything the compiler knows about a function or sub (§3 "Function
/// record"). The VM layer wraps this with the native-implementation slot,
/// since native closures are a runtime, not compile-time, concept.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub name: ArcStr,
    /// -1 = variadic.
    pub arity: i32,
    pub is_procedure: bool,
    pub is_exported: bool,
    pub is_async: bool,
    pub module_name: Option<ArcStr>,
    pub start_bytecode_offset: u16,
    pub parameter_names: Vec<ArcStr>,
}

impl FunctionInfo {
    pub fn arity_ok(&self, argc: usize) -> bool {
        self.arity < 0 || self.arity as usize == argc
    }
}
