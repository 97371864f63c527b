//! StreamVM for **trafgen**, a stateless software traffic generator.
//!
//! A stream is a packet template plus a short list of field-mutation
//! [`Instruction`](compiler::Instruction)s. The [`compiler`] validates that
//! list and lowers it into a flat bytecode [`Program`](runtime::vm::Program)
//! together with a BSS template, the byte blob holding every flow variable.
//! The [`runtime::vm`] interpreter replays the program once per transmitted
//! packet against a private copy of the BSS.

pub mod compiler;
pub mod runtime;
pub mod stream;
pub mod utils;

pub use log;

/// Configuration for the compiler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
    pub compiler: compiler::Config,
}
