//! the public entry point: [`Agent`] and [`AgentBuilder`].

use std::{
    sync::{Arc, Mutex},
    task::Wake,
    thread,
    time::Duration,
};

use curl::{easy::Easy2, multi::Multi};

use crate::{
    body::{BoxBody, ResponseBodyReader},
    context::{Metrics, RequestContext},
    error::Error,
    queue::{AgentRef, NewSubmission, RequestHandle, Shared, Submission},
    wakeup,
};

/// configures and builds an [`Agent`].
///
/// mirrors the handful of connection-reuse knobs a caller actually needs to
/// tune; everything else about the transfer (headers, method, TLS options)
/// belongs to the request itself, not the agent driving it.
#[derive(Debug, Clone)]
pub struct AgentBuilder {
    max_connections: usize,
    max_connections_per_host: usize,
    connection_cache_size: usize,
    header_size_limit: usize,
    follow_redirects: bool,
    keep_alive: Duration,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self {
            max_connections: 0,
            max_connections_per_host: 0,
            connection_cache_size: 128,
            header_size_limit: 512 * 1024,
            follow_redirects: true,
            keep_alive: Duration::from_millis(50),
        }
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// maximum number of simultaneous transfers across all hosts. `0` (the
    /// default) leaves it to the transport's own default.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// maximum number of simultaneous transfers to a single host.
    pub fn max_connections_per_host(mut self, max: usize) -> Self {
        self.max_connections_per_host = max;
        self
    }

    /// number of idle connections the transport is allowed to keep warm.
    pub fn connection_cache_size(mut self, size: usize) -> Self {
        self.connection_cache_size = size;
        self
    }

    /// cumulative response header bytes allowed before a transfer is failed.
    pub fn header_size_limit(mut self, bytes: usize) -> Self {
        self.header_size_limit = bytes;
        self
    }

    /// whether a redirect response (`301`/`302`/`303`/`307`) completing with
    /// an unsupported-protocol error is swallowed rather than failed. on by
    /// default, matching curl's own default redirect-following behavior.
    pub fn follow_redirects(mut self, enabled: bool) -> Self {
        self.follow_redirects = enabled;
        self
    }

    /// how long the worker thread stays alive with nothing to do before
    /// exiting. the transport context itself survives the exit and is handed
    /// to whichever thread restarts the worker next.
    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.keep_alive = duration;
        self
    }

    pub fn build(self) -> Agent {
        Agent {
            inner: Arc::new(Inner {
                shared: Shared::new(),
                config: self,
                join: Mutex::new(None),
            }),
        }
    }
}

pub(crate) struct Inner {
    shared: Arc<Shared>,
    config: AgentBuilder,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Inner {
    /// push a submission, ensuring the worker is running first. the single
    /// entry point every caller (`submit`, `cancel`, the read waker's
    /// `Unpause`) goes through, so a submission never sits orphaned waiting
    /// for an unrelated `submit()` to respawn the worker.
    pub(crate) fn enqueue(self: &Arc<Self>, submission: Submission) {
        self.ensure_worker();
        self.shared.push(submission);
    }

    fn ensure_worker(self: &Arc<Self>) {
        let mut join = self.join.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = join.as_ref() {
            if !existing.is_finished() {
                return;
            }
        }
        if let Some(finished) = join.take() {
            let _ = finished.join();
        }

        let (writer, reader) = wakeup::pair().expect("failed to create worker wakeup channel");
        self.shared.attach_worker(writer);

        let multi = self.shared.take_multi().unwrap_or_else(|| new_multi(&self.config));
        let shared = Arc::clone(&self.shared);
        let idle_timeout = self.config.keep_alive;

        *join = Some(
            thread::Builder::new()
                .name("curl-agent-worker".into())
                .spawn(move || {
                    let multi = crate::agent::run(shared.clone(), multi, reader, idle_timeout);
                    shared.cache_multi(multi);
                })
                .expect("failed to spawn worker thread"),
        );
    }
}

/// a handle to a single worker thread driving every transfer submitted
/// through it. cheap to clone; every clone shares the same worker and the
/// same warm transport context.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<Inner>,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub fn new() -> Self {
        AgentBuilder::new().build()
    }

    /// submit a request for the worker to drive.
    ///
    /// `configure` is handed the freshly created easy handle before it joins
    /// the multi handle; set url, method, and headers on it there. returns a
    /// future that resolves with the response once its headers have arrived,
    /// and a handle that can be used to cancel the transfer at any point.
    pub fn submit<F>(&self, configure: F, body: BoxBody) -> SubmittedRequest
    where
        F: FnOnce(&mut Easy2<RequestContext>) -> Result<(), Error> + Send + 'static,
    {
        self.submit_with_auth_hook(configure, body, None)
    }

    /// as [`Agent::submit`], but with a hook invoked once if the server
    /// responds `401`/`407` with at least one recognized auth scheme.
    pub fn submit_with_auth_hook<F>(
        &self,
        configure: F,
        body: BoxBody,
        on_auth_available: Option<Box<dyn FnOnce(u32) + Send>>,
    ) -> SubmittedRequest
    where
        F: FnOnce(&mut Easy2<RequestContext>) -> Result<(), Error> + Send + 'static,
    {
        let handle = RequestHandle::new();
        let agent_ref = AgentRef::new(&self.inner);
        let waker = std::task::Waker::from(Arc::new(ReadWaker {
            agent: agent_ref.clone(),
            handle: handle.clone(),
        }));

        let span = tracing::debug_span!("transfer", token = ?handle);
        let (context, rx) = RequestContext::new(
            span,
            handle.clone(),
            agent_ref,
            self.inner.config.header_size_limit,
            self.inner.config.follow_redirects,
            body,
            waker,
            on_auth_available,
        );
        let metrics = context.metrics();

        self.inner.enqueue(Submission::New(NewSubmission {
            context,
            configure: Box::new(configure),
        }));

        SubmittedRequest {
            response: ResponseFuture { rx },
            handle,
            metrics,
        }
    }

    /// cancel a request previously returned by [`Agent::submit`]. a no-op if
    /// it already completed.
    pub fn cancel(&self, handle: &RequestHandle) {
        self.inner.enqueue(Submission::Cancel(handle.clone()));
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

fn new_multi(config: &AgentBuilder) -> Multi {
    let multi = Multi::new();
    if config.max_connections > 0 {
        if let Err(e) = multi.set_max_total_connections(config.max_connections) {
            tracing::debug!("failed to set max total connections: {e}");
        }
    }
    if config.max_connections_per_host > 0 {
        if let Err(e) = multi.set_max_host_connections(config.max_connections_per_host) {
            tracing::debug!("failed to set max host connections: {e}");
        }
    }
    if let Err(e) = multi.set_max_connects(config.connection_cache_size) {
        tracing::debug!("failed to set connection cache size: {e}");
    }
    multi
}

/// wakes the worker through the submission queue whenever a paused request
/// body's async source becomes ready again.
struct ReadWaker {
    agent: AgentRef,
    handle: RequestHandle,
}

impl Wake for ReadWaker {
    fn wake(self: Arc<Self>) {
        self.agent.enqueue(Submission::Unpause(self.handle.clone()));
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.agent.enqueue(Submission::Unpause(self.handle.clone()));
    }
}

/// resolves with the response once its status line and headers have arrived.
/// dropping it before it resolves does not cancel the transfer; use the
/// [`RequestHandle`] returned alongside it for that.
pub struct ResponseFuture {
    rx: tokio::sync::oneshot::Receiver<Result<http::Response<ResponseBodyReader>, Error>>,
}

impl std::future::Future for ResponseFuture {
    type Output = Result<http::Response<ResponseBodyReader>, Error>;

    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        match std::pin::Pin::new(&mut self.rx).poll(cx) {
            std::task::Poll::Ready(Ok(result)) => std::task::Poll::Ready(result),
            std::task::Poll::Ready(Err(_)) => std::task::Poll::Ready(Err(Error::AgentShutDown)),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

/// everything [`Agent::submit`] hands back: the response future, a handle
/// for cancellation, and a live view of the transfer's progress counters.
pub struct SubmittedRequest {
    pub response: ResponseFuture,
    pub handle: RequestHandle,
    pub metrics: Arc<Mutex<Metrics>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(Agent: Send, Sync, Clone);
    static_assertions::assert_impl_all!(RequestHandle: Send, Sync, Clone);
}
