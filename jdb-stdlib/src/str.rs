//! String builtins (`MID$, LEFT$, RIGHT$, ASC, CHR$, INSTR, LCASE$,
//! UCASE$, TRIM$`), grounded on the keyword catalog in
//! `original_source/source/TextEditor.cpp` and the teacher's
//! `graphix-stdlib/src/str.rs` module split.

use crate::common::{arg_number, arg_string, native, type_mismatch};
use arcstr::ArcStr;
use jdb_vm::{Module, NativeFunction, Registry, Value};

pub struct StrModule;

impl Module for StrModule {
    fn name(&self) -> &str {
        "str"
    }

    fn functions(&self) -> Vec<NativeFunction> {
        vec![
            native("MID$", 3, |a| {
                let s = arg_string(a, 0)?;
                let start = (arg_number(a, 1)? as usize).saturating_sub(1);
                let count = arg_number(a, 2)? as usize;
                let out: String = s.chars().skip(start).take(count).collect();
                Ok(Value::Str(ArcStr::from(out)))
            }),
            native("LEFT$", 2, |a| {
                let s = arg_string(a, 0)?;
                let count = arg_number(a, 1)? as usize;
                Ok(Value::Str(ArcStr::from(s.chars().take(count).collect::<String>())))
            }),
            native("RIGHT$", 2, |a| {
                let s = arg_string(a, 0)?;
                let count = arg_number(a, 1)? as usize;
                let total = s.chars().count();
                let skip = total.saturating_sub(count);
                Ok(Value::Str(ArcStr::from(s.chars().skip(skip).collect::<String>())))
            }),
            native("ASC", 1, |a| {
                let s = arg_string(a, 0)?;
                s.chars().next().map(|c| Value::Integer(c as i64)).ok_or_else(type_mismatch)
            }),
            native("CHR$", 1, |a| {
                let code = arg_number(a, 0)? as u32;
                char::from_u32(code).map(|c| Value::Str(ArcStr::from(c.to_string()))).ok_or_else(type_mismatch)
            }),
            native("INSTR", 2, |a| {
                let hay = arg_string(a, 0)?;
                let needle = arg_string(a, 1)?;
                match hay.find(needle.as_str()) {
                    Some(byte_pos) => Ok(Value::Integer(hay[..byte_pos].chars().count() as i64 + 1)),
                    None => Ok(Value::Integer(0)),
                }
            }),
            native("LCASE$", 1, |a| Ok(Value::Str(ArcStr::from(arg_string(a, 0)?.to_lowercase())))),
            native("UCASE$", 1, |a| Ok(Value::Str(ArcStr::from(arg_string(a, 0)?.to_uppercase())))),
            native("TRIM$", 1, |a| Ok(Value::Str(ArcStr::from(arg_string(a, 0)?.trim())))),
            native("SPLIT", 2, |a| {
                let s = arg_string(a, 0)?;
                let sep = arg_string(a, 1)?;
                let parts: Vec<Value> = s.split(sep.as_str()).map(|p| Value::Str(ArcStr::from(p))).collect();
                let n = parts.len();
                Ok(Value::array(vec![n], parts))
            }),
        ]
    }
}

pub fn register(registry: &mut Registry) {
    registry.install(&StrModule);
}
