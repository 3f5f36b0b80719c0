//! Native function registrations for the interpreter's standard library
//! (`STR$`, `LEN`, math, array, JSON, and tensor builtins), implemented
//! against the `jdb_vm::plugin` module interface (§4.11) and grounded on
//! the teacher's `stdlib/graphix-package-*` crates.

mod array;
mod common;
mod core;
mod json;
mod str;
mod tensor;

pub use array::ArrayModule;
pub use core::CoreModule;
pub use json::JsonModule;
pub use str::StrModule;
pub use tensor::TensorModule;

use jdb_vm::Registry;

/// Register every builtin module this crate ships (§4.11's worked
/// example of the plugin contract: a `Registry` ready for
/// `Vm::install_registry`).
pub fn register_all() -> Registry {
    let mut registry = Registry::new();
    core::register(&mut registry);
    str::register(&mut registry);
    array::register(&mut registry);
    json::register(&mut registry);
    tensor::register(&mut registry);
    registry
}
