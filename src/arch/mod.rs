//! Architecture-specific primitives
//!
//! Only x86_64 is supported; `time.rs` falls back to a fixed tick source
//! on other targets rather than requiring one here.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
