// This module provides the compilation session using the bumpalo crate for per-function
// scratch memory. CompilationSession owns a bump arena that passes use for transient state
// (phi resolution frames, DFS stacks, worklists) whose lifetime ends with the function
// being compiled; reset_function_state drops all of it at once so a long-running driver
// does not accumulate memory across functions. The session also remembers which function
// is being compiled for diagnostics and accumulates SessionStats: functions compiled,
// total and largest code size, phis created and removed by the SSA builder, spill stores,
// reloads, and call sites. Statistics are printed by the a64c driver at debug log level.

//! Per-function scratch arena and compilation statistics.

use bumpalo::Bump;
use std::fmt;

/// Compilation session shared by all functions of one compiler instance.
pub struct CompilationSession {
    /// Scratch arena, reset after every function.
    arena: Bump,

    stats: SessionStats,

    /// Name used in diagnostics while a function is in flight.
    current_function: Option<String>,
}

impl Default for CompilationSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilationSession {
    pub fn new() -> Self {
        Self {
            arena: Bump::new(),
            stats: SessionStats::default(),
            current_function: None,
        }
    }

    /// Get access to the scratch arena.
    pub fn arena(&self) -> &Bump {
        &self.arena
    }

    pub fn set_current_function(&mut self, name: &str) {
        self.current_function = Some(name.to_string());
    }

    pub fn current_function(&self) -> Option<&str> {
        self.current_function.as_deref()
    }

    /// Release all per-function scratch memory.
    pub fn reset_function_state(&mut self) {
        let used = self.arena.allocated_bytes();
        if used > self.stats.peak_arena_bytes {
            self.stats.peak_arena_bytes = used;
        }
        self.arena.reset();
        self.current_function = None;
    }

    /// Count a finished function and track the largest one.
    pub fn record_function_compiled(&mut self, name: &str, code_size: usize) {
        let stats = &mut self.stats;
        stats.functions_compiled += 1;
        stats.total_code_size += code_size;

        if stats.largest_function_size < code_size {
            stats.largest_function_size = code_size;
            stats.largest_function_name = name.to_string();
        }
    }

    /// Record SSA construction results.
    pub fn record_phis(&mut self, created: usize, removed: usize) {
        self.stats.phis_created += created;
        self.stats.phis_removed += removed;
    }

    /// Record spill code inserted by the allocator.
    pub fn record_spill_code(&mut self, spills: usize, reloads: usize) {
        self.stats.spills_generated += spills;
        self.stats.reloads_generated += reloads;
    }

    pub fn record_call_sites(&mut self, count: usize) {
        self.stats.total_calls += count;
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }
}

/// Counters accumulated over every function a compiler instance handles.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub functions_compiled: usize,

    /// Bytes of machine code emitted.
    pub total_code_size: usize,

    /// Largest function compiled.
    pub largest_function_size: usize,
    pub largest_function_name: String,

    pub phis_created: usize,
    pub phis_removed: usize,

    /// Spill stores inserted.
    pub spills_generated: usize,

    /// Reloads inserted.
    pub reloads_generated: usize,

    /// Call sites lowered.
    pub total_calls: usize,

    /// Most scratch memory used by a single function.
    pub peak_arena_bytes: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} functions, {} bytes of code, {} calls",
            self.functions_compiled, self.total_code_size, self.total_calls
        )?;
        write!(
            f,
            "; phis {}/{} kept/removed",
            self.phis_created.saturating_sub(self.phis_removed),
            self.phis_removed
        )?;
        write!(f, "; {} spills, {} reloads", self.spills_generated, self.reloads_generated)?;
        if !self.largest_function_name.is_empty() {
            write!(
                f,
                "; largest {} at {} bytes",
                self.largest_function_name, self.largest_function_size
            )?;
        }
        write!(f, "; scratch peak {} bytes", self.peak_arena_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_empty() {
        let session = CompilationSession::new();
        let stats = session.stats();
        assert_eq!(stats.functions_compiled, 0);
        assert_eq!(stats.total_code_size, 0);
        assert!(session.current_function().is_none());
    }

    #[test]
    fn test_stats_tracking() {
        let mut session = CompilationSession::new();
        session.record_function_compiled("small", 8);
        session.record_function_compiled("big", 64);
        session.record_phis(3, 1);
        session.record_spill_code(2, 4);

        let stats = session.stats();
        assert_eq!(stats.functions_compiled, 2);
        assert_eq!(stats.total_code_size, 72);
        assert_eq!(stats.largest_function_name, "big");
        assert_eq!(stats.phis_removed, 1);
        assert_eq!(stats.reloads_generated, 4);
        assert!(stats.to_string().contains("2 spills, 4 reloads"));
    }

    #[test]
    fn test_reset_releases_scratch() {
        let mut session = CompilationSession::new();
        session.set_current_function("f");
        {
            let mut scratch = bumpalo::collections::Vec::new_in(session.arena());
            scratch.extend(0..1024u32);
            assert_eq!(scratch.len(), 1024);
        }
        session.reset_function_state();
        assert!(session.stats().peak_arena_bytes >= 4096);
        assert!(session.current_function().is_none());
    }
}
