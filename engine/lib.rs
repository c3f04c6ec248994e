#![feature(portable_simd)] // Do not remove this
#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod accumulator;
mod buffer;
pub mod compile;
pub mod config;
pub mod kernel;
pub mod types;
pub mod update;

pub use accumulator::FlowAccumulator;
pub use compile::{CompileError, CompileOptions, compile, compile_with_defaults};
pub use types::{BlockDescriptor, CompiledSchedule, GroupKind, NodeGroupLayout, NodeId};
pub use update::{EmStep, UpdateError, update, update_with_child_counts};
