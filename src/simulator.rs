// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Syscall recording for live deliveries and simulation during replay.
//!
//! # Invariants
//! During replay the worker must issue exactly the recorded syscalls, in
//! order. An extra, different, or missing syscall is a divergence and the
//! replay fails closed.

use alloc::format;
use alloc::vec::Vec;

use crate::delivery::{Payload, RecordedSyscall};
use crate::error::{KernelError, KernelResult};
use crate::types::Position;
use crate::worker::SyscallHandler;

/// Forwards syscalls to the live handler and keeps a copy of each
/// request/result pair for the transcript.
pub struct SyscallRecorder<'a> {
    inner: &'a mut dyn SyscallHandler,
    recorded: Vec<RecordedSyscall>,
}

impl<'a> SyscallRecorder<'a> {
    pub fn new(inner: &'a mut dyn SyscallHandler) -> Self {
        Self { inner, recorded: Vec::new() }
    }

    pub fn into_recorded(self) -> Vec<RecordedSyscall> {
        self.recorded
    }
}

impl SyscallHandler for SyscallRecorder<'_> {
    fn syscall(&mut self, call: &Payload) -> KernelResult<Payload> {
        let result = self.inner.syscall(call)?;
        self.recorded.push(RecordedSyscall { call: call.clone(), result: result.clone() });
        Ok(result)
    }
}

/// Answers syscalls from a recorded transcript entry.
pub struct SyscallSimulator<'a> {
    position: Position,
    expected: &'a [RecordedSyscall],
    next: usize,
    divergence: Option<KernelError>,
}

impl<'a> SyscallSimulator<'a> {
    pub fn new(position: Position, expected: &'a [RecordedSyscall]) -> Self {
        Self { position, expected, next: 0, divergence: None }
    }

    /// Check that every recorded syscall was consumed and none diverged.
    pub fn finish(self) -> KernelResult<()> {
        if let Some(err) = self.divergence {
            return Err(err);
        }
        if self.next < self.expected.len() {
            return Err(KernelError::Divergence {
                position: self.position,
                detail: format!(
                    "worker made {} syscalls, transcript recorded {}",
                    self.next,
                    self.expected.len()
                ),
            });
        }
        Ok(())
    }

    fn diverge(&mut self, detail: alloc::string::String) -> KernelError {
        let err = KernelError::Divergence { position: self.position, detail };
        if self.divergence.is_none() {
            self.divergence = Some(err.clone());
        }
        err
    }
}

impl SyscallHandler for SyscallSimulator<'_> {
    fn syscall(&mut self, call: &Payload) -> KernelResult<Payload> {
        let Some(recorded) = self.expected.get(self.next) else {
            let n = self.next;
            return Err(self.diverge(format!("extra syscall #{}", n)));
        };
        if recorded.call != *call {
            let n = self.next;
            return Err(self.diverge(format!("syscall #{} differs from transcript", n)));
        }
        self.next += 1;
        Ok(recorded.result.clone())
    }
}
