//! Textual IR (`.tir`) for tests and the `a64c` driver.
//!
//! The format mirrors [`IrFunc`](crate::ir::IrFunc) one node per line:
//!
//! ```text
//! ; comments start with a semicolon
//! func add(i64, i64) -> i64 {
//!   local x: i64
//! entry:
//!   %a = param 0
//!   %b = param 1
//!   %c = add %a, %b
//!   ret %c
//! }
//! ```
//!
//! Node names are visible only in the block defining them, as in the IR
//! itself; values cross blocks through `load.local`/`store.local`. Blocks may
//! be referenced before their label appears. Calls take an optional result
//! type and mark the first variadic argument with `...`:
//! `%n = call i32 @printf(%fmt, ...%x)`.

pub mod parser;

pub use parser::parse_module;
