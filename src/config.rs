//! Execution settings owned by a [`crate::exec::Store`].

use crate::exec::MAX_PAGES;

/// How much the interpreter reports while it runs.
///
/// The level never changes the result of an execution.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DebugLevel {
    /// No per-instruction output
    #[default]
    Silent,
    /// Trace every executed instruction
    Log,
    /// Trace with the operand stack and label context
    Context,
    /// Trace with context and call the store's interrupt hook before each step
    Interrupt,
}

impl DebugLevel {
    /// Maps a numeric level; values above 3 saturate.
    #[must_use]
    pub const fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Silent,
            1 => Self::Log,
            2 => Self::Context,
            _ => Self::Interrupt,
        }
    }
}

/// Interpreter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Debug output level
    pub debug: DebugLevel,
    /// Instruction budget per invocation. `None` is unlimited.
    pub fuel: Option<u64>,
    /// Maximum nesting of calls before `CallStackExhausted` traps.
    pub max_call_depth: usize,
    /// Largest number of entries a table may hold, whatever its type allows.
    pub max_table_size: u32,
    /// Largest number of pages a memory may hold, whatever its type allows.
    pub max_memory_pages: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: DebugLevel::Silent,
            fuel: None,
            max_call_depth: 1024,
            max_table_size: 10_000_000,
            max_memory_pages: MAX_PAGES,
        }
    }
}

impl Config {
    /// Sets the debug level.
    #[must_use]
    pub const fn debug(mut self, debug: DebugLevel) -> Self {
        self.debug = debug;
        self
    }

    /// Bounds the number of instructions an invocation may execute.
    #[must_use]
    pub const fn fuel(mut self, fuel: Option<u64>) -> Self {
        self.fuel = fuel;
        self
    }

    /// Sets the maximum call depth.
    #[must_use]
    pub const fn max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Caps table sizes for allocation and growth.
    #[must_use]
    pub const fn max_table_size(mut self, entries: u32) -> Self {
        self.max_table_size = entries;
        self
    }

    /// Caps memory sizes for allocation and growth. Values above 65,536
    /// pages have no effect.
    #[must_use]
    pub const fn max_memory_pages(mut self, pages: u32) -> Self {
        self.max_memory_pages = pages;
        self
    }
}
