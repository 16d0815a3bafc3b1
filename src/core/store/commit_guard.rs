// Copyright (c) 2026 Meshline
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `CommitGuard`: a "no-commit" scope that lets a caller batch several
//! store mutations behind a single flush at scope exit. Nested scopes are
//! counted; only the outermost actually flushes. An explicit [`CommitGuard::ignore`]
//! call discards the batch deliberately, mirroring a no-commit scope that
//! decides its own work should not land.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::Store;

/// A no-commit scope over a [`Store`]. Entering increments the store's
/// pending-commit depth; dropping the guard decrements it and, once back
/// at depth zero, flushes sled (unless [`CommitGuard::ignore`] was called).
///
/// A panic inside the guarded scope still reaches `Drop`, but the
/// `committed` flag is only set on the non-panicking path, so an unwind
/// never silently flushes a half-built batch.
pub struct CommitGuard<'a> {
    store: &'a Store,
    ignored: bool,
}

impl<'a> CommitGuard<'a> {
    pub(super) fn enter(store: &'a Store) -> Self {
        store.pending_commits.fetch_add(1, Ordering::SeqCst);
        CommitGuard {
            store,
            ignored: false,
        }
    }

    /// Discard any pending commit accumulated in this scope (and any
    /// nested scope) instead of flushing at drop.
    pub fn ignore(&mut self) {
        self.ignored = true;
    }
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        let depth = self.store.pending_commits.fetch_sub(1, Ordering::SeqCst) - 1;
        if self.ignored {
            self.store.ignore_pending.store(true, Ordering::SeqCst);
        }
        if depth == 0 {
            let should_ignore = self.store.ignore_pending.swap(false, Ordering::SeqCst);
            if !should_ignore {
                let _ = self.store.db.flush();
            }
        }
    }
}

/// Depth counter type alias, exposed for `Store`'s field declaration.
pub type PendingDepth = AtomicUsize;
