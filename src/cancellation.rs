// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cooperative cancellation token (spec.md §5 "Cancellation and timeouts").
//!
//! Every disk I/O, L2 cache call, and spin-loop sleep must observe this
//! token and return promptly without leaving files open or locks held.

use std::sync::{atomic::AtomicBool, Arc};

/// A cheaply-clonable, cooperative cancellation signal.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Returns `true` if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Returns `Err(Error::Cancelled)` if cancellation has been requested,
    /// otherwise `Ok(())`. Call at every suspension point named in
    /// spec.md §5.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
