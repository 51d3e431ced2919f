//! the incoming submission queue: the single mailbox every other thread uses
//! to talk to the worker, and the lock that pairs it atomically with the
//! worker's own lifecycle so a submission is never silently dropped on the
//! floor by a worker that has already exited.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, Weak},
};

use curl::{easy::Easy2, multi::Multi};

use crate::{context::RequestContext, error::Error, wakeup::WakeupWriter};

/// a cheap, cloneable identity for a request, handed to the caller the
/// instant a request is submitted so it can cancel or be notified of unpause
/// opportunities before the worker has even looked at it (and therefore
/// before any token has been assigned in the active operation table).
#[derive(Clone)]
pub struct RequestHandle {
    id: Arc<()>,
}

impl RequestHandle {
    pub(crate) fn new() -> Self {
        Self { id: Arc::new(()) }
    }

    pub(crate) fn is(&self, other: &RequestHandle) -> bool {
        Arc::ptr_eq(&self.id, &other.id)
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestHandle({:p})", Arc::as_ptr(&self.id))
    }
}

/// a not-yet-started transfer, paired with the closure that applies the
/// caller's request (url, method, headers, ...) to the easy handle before it
/// joins the multi handle. the agent never interprets those options itself.
pub(crate) struct NewSubmission {
    pub(crate) context: RequestContext,
    pub(crate) configure: Box<dyn FnOnce(&mut Easy2<RequestContext>) -> Result<(), Error> + Send>,
}

/// everything a caller thread can ask the worker to do.
pub(crate) enum Submission {
    New(NewSubmission),
    Cancel(RequestHandle),
    Unpause(RequestHandle),
}

/// state shared between every [`crate::Agent`] clone, every [`AgentRef`] held
/// by a request context, and the worker thread itself.
pub(crate) struct Shared {
    inner: Mutex<Inner>,
}

struct Inner {
    queue: VecDeque<Submission>,
    /// `Some` iff a worker thread is currently running. submissions made
    /// while this is `None` are queued anyway; the next call to
    /// [`crate::handle::Inner::enqueue`] drains them once a fresh worker
    /// spawns.
    wakeup: Option<WakeupWriter>,
    /// a multi handle left over from the previous worker, kept warm so a new
    /// burst of submissions doesn't pay for a fresh transport context.
    multi: Option<Multi>,
}

impl Shared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                wakeup: None,
                multi: None,
            }),
        })
    }

    /// push a submission and, if a worker is currently attached, wake it.
    /// holding the lock across both the push and the wakeup write is what
    /// prevents a submission from landing just after the worker decided to
    /// exit but before it detached its wakeup writer.
    pub(crate) fn push(&self, submission: Submission) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut inner = inner;
        inner.queue.push_back(submission);
        if let Some(wakeup) = &inner.wakeup {
            wakeup.wake();
        }
    }

    pub(crate) fn attach_worker(&self, wakeup: WakeupWriter) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.wakeup = Some(wakeup);
    }

    /// drain everything currently queued, for the worker to process in one pass.
    pub(crate) fn drain(&self) -> Vec<Submission> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.queue.drain(..).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.queue.is_empty()
    }

    /// take a cached multi handle, if the previous worker left one warm.
    pub(crate) fn take_multi(&self) -> Option<Multi> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.multi.take()
    }

    /// hand a multi handle back for the next worker to reuse.
    pub(crate) fn cache_multi(&self, multi: Multi) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.multi = Some(multi);
    }
}

/// a weak, cloneable reference to the agent, handed to every [`RequestContext`]
/// so it can post `Cancel`/`Unpause` submissions without keeping the agent
/// alive on its own. routes through [`crate::handle::Inner::enqueue`] rather
/// than pushing onto `Shared` directly, so a `Cancel`/`Unpause` submitted
/// after the worker has idle-exited still respawns it, the same as `submit`.
#[derive(Clone)]
pub(crate) struct AgentRef {
    target: AgentRefTarget,
}

#[derive(Clone)]
enum AgentRefTarget {
    Live(Weak<crate::handle::Inner>),
    /// bypasses worker-spawn entirely; exists so `body.rs`'s unit tests can
    /// inspect queue side effects without a real worker thread draining the
    /// queue out from under them mid-assertion.
    #[cfg(test)]
    Detached(Weak<Shared>),
}

impl AgentRef {
    pub(crate) fn new(inner: &Arc<crate::handle::Inner>) -> Self {
        Self {
            target: AgentRefTarget::Live(Arc::downgrade(inner)),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(shared: &Arc<Shared>) -> Self {
        Self {
            target: AgentRefTarget::Detached(Arc::downgrade(shared)),
        }
    }

    /// best-effort: if the agent has already been torn down there is nothing
    /// left to unpause or cancel, so silently dropping the submission is correct.
    pub(crate) fn enqueue(&self, submission: Submission) {
        match &self.target {
            AgentRefTarget::Live(inner) => {
                if let Some(inner) = inner.upgrade() {
                    inner.enqueue(submission);
                }
            }
            #[cfg(test)]
            AgentRefTarget::Detached(shared) => {
                if let Some(shared) = shared.upgrade() {
                    shared.push(submission);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let shared = Shared::new();
        shared.push(Submission::Cancel(RequestHandle::new()));
        shared.push(Submission::Cancel(RequestHandle::new()));
        let drained = shared.drain();
        assert_eq!(drained.len(), 2);
        assert!(shared.is_empty());
    }

    #[test]
    fn handle_identity() {
        let a = RequestHandle::new();
        let b = a.clone();
        let c = RequestHandle::new();
        assert!(a.is(&b));
        assert!(!a.is(&c));
    }
}
