//! Runtime half of the interpreter: the dynamic value model, the
//! autodiff tensor engine, variable scoping, broadcast arithmetic, the
//! cooperative task scheduler, the native plugin interface, and the
//! bytecode executor that ties them together.

pub mod arithmetic;
pub mod frame;
pub mod plugin;
pub mod scheduler;
pub mod tensor;
pub mod value;
pub mod vm;

pub use frame::{Scopes, StackFrame};
pub use plugin::{Module, NativeFunction, NativeImpl, Registry};
pub use scheduler::{Scheduler, Task, TaskStatus};
pub use value::{to_bool, to_display_string, to_number, ArrayData, MapData, OpaqueHandle, TensorRef, Value};
pub use vm::{DebugTick, ExceptionHandler, ForRecord, FrameInfo, Vm};
