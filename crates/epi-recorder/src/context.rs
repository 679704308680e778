// crates/epi-recorder/src/context.rs
// ============================================================================
// Module: EPI Current Session Context
// Description: Context-scoped stack resolving the innermost open session.
// Purpose: Let step producers find the active session without a reference.
// Dependencies: tokio (task_local)
// ============================================================================

//! ## Overview
//! The current session is tracked per calling context, never globally:
//! - Synchronous scopes push onto a thread-local stack.
//! - Async scopes install a task-local stack that is visible only while the
//!   scoped future is being polled, so it follows the future across
//!   suspension points and worker threads and never leaks into sibling
//!   futures polled by the same task.
//!
//! Inside an async scope, synchronous scopes push onto that scope's task-local
//! stack so the innermost session always wins.
//!
//! Thread-stack entries remember the tokio task that pushed them. A task only
//! resolves thread entries it owns, so tasks interleaved on one thread (for
//! example through a `LocalSet`) never see each other's synchronous scopes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;

use tokio::task::Id as TaskId;

use crate::session::Session;

// ============================================================================
// SECTION: Stacks
// ============================================================================

/// Thread-stack entry tagged with the task that entered it.
#[derive(Debug, Clone)]
struct ThreadEntry {
    /// Task polling when the scope was entered; `None` outside any task.
    owner: Option<TaskId>,
    /// Entered session.
    session: Session,
}

thread_local! {
    /// Sessions entered by synchronous scopes on this thread.
    static THREAD_SESSIONS: RefCell<Vec<ThreadEntry>> = const { RefCell::new(Vec::new()) };
}

tokio::task_local! {
    /// Sessions visible to the async scope being polled.
    static TASK_SESSIONS: RefCell<Vec<Session>>;
}

/// Returns the innermost session reachable from the current context.
#[must_use]
pub fn get_current_session() -> Option<Session> {
    if let Ok(found) = TASK_SESSIONS.try_with(|stack| stack.borrow().last().cloned()) {
        return found;
    }
    let owner = tokio::task::try_id();
    THREAD_SESSIONS.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|entry| entry.owner == owner)
            .map(|entry| entry.session.clone())
    })
}

/// Returns true while an async scope is being polled.
pub(crate) fn in_async_scope() -> bool {
    TASK_SESSIONS.try_with(|_| ()).is_ok()
}

/// Thread-stack sessions visible to the calling task, outermost first.
fn owned_thread_chain() -> Vec<Session> {
    let owner = tokio::task::try_id();
    THREAD_SESSIONS.with(|stack| {
        stack
            .borrow()
            .iter()
            .filter(|entry| entry.owner == owner)
            .map(|entry| entry.session.clone())
            .collect()
    })
}

// ============================================================================
// SECTION: Synchronous Scopes
// ============================================================================

/// Stack a guard pushed onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StackKind {
    /// Thread-local stack.
    Thread,
    /// Task-local stack of the enclosing async scope.
    Task,
}

/// Keeps a session current until dropped.
///
/// The guard is bound to the thread that created it.
#[must_use = "the session stops being current when the guard is dropped"]
pub struct ContextGuard {
    /// Session pushed by this guard.
    session: Session,
    /// Stack holding the session.
    stack: StackKind,
    /// Pins the guard to its thread.
    _not_send: PhantomData<*const ()>,
}

/// Makes `session` current for the calling context until the guard drops.
pub fn enter(session: &Session) -> ContextGuard {
    let pushed_to_task = TASK_SESSIONS
        .try_with(|stack| stack.borrow_mut().push(session.clone()))
        .is_ok();
    if !pushed_to_task {
        let entry = ThreadEntry { owner: tokio::task::try_id(), session: session.clone() };
        THREAD_SESSIONS.with(|stack| stack.borrow_mut().push(entry));
    }
    ContextGuard {
        session: session.clone(),
        stack: if pushed_to_task { StackKind::Task } else { StackKind::Thread },
        _not_send: PhantomData,
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        match self.stack {
            StackKind::Task => {
                let _ = TASK_SESSIONS.try_with(|stack| {
                    let mut stack = stack.borrow_mut();
                    if let Some(index) =
                        stack.iter().rposition(|entry| entry.same_session(&self.session))
                    {
                        stack.remove(index);
                    }
                });
            }
            StackKind::Thread => {
                let _ = THREAD_SESSIONS.try_with(|stack| {
                    let mut stack = stack.borrow_mut();
                    if let Some(index) =
                        stack.iter().rposition(|entry| entry.session.same_session(&self.session))
                    {
                        stack.remove(index);
                    }
                });
            }
        }
    }
}

// ============================================================================
// SECTION: Async Scopes
// ============================================================================

/// Runs `future` with `session` as the current session.
///
/// The scope inherits the sessions visible at the call site, so producers in
/// the future see `session` and, after nested scopes end, the outer chain.
pub async fn scope<F: Future>(session: Session, future: F) -> F::Output {
    let mut chain = TASK_SESSIONS
        .try_with(|stack| stack.borrow().clone())
        .unwrap_or_else(|_| owned_thread_chain());
    chain.push(session);
    TASK_SESSIONS.scope(RefCell::new(chain), future).await
}
