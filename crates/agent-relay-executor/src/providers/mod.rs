//! Built-in provider tables.

pub mod amp;
pub mod claude;
pub mod codex;
pub mod cursor;
pub mod droid;
pub mod gemini;
pub mod opencode;
