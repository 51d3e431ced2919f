//! the per-transfer state curl's five callbacks read and write, plus the
//! glue that turns those callbacks into an async response/body pair.

use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context as TaskContext, Poll, Waker},
};

use curl::easy::{Handler, InfoType, ReadError, SeekResult, WriteError};
use http::{HeaderMap, StatusCode, Version};
use tokio::sync::oneshot;

use crate::{
    body::{BoxBody, ResponseBodyReader, ResponseBodySink, TransferOutcome},
    error::Error,
    parse::{parse_header_line, parse_status_line},
    queue::{AgentRef, RequestHandle},
};

/// status codes the header callback treats as "the transport is about to
/// follow a redirect", per spec.
const REDIRECT_STATUSES: [u16; 4] = [301, 302, 303, 307];

/// snapshot of the progress counters curl reports through its xferinfo callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct Metrics {
    pub download_total: f64,
    pub download_now: f64,
    pub upload_total: f64,
    pub upload_now: f64,
}

/// a request/response pair in flight, and the `curl::easy::Handler` curl
/// drives directly. owned by the active operation table while a transfer is
/// running; everything else holds only a [`RequestHandle`].
///
/// public only so it can appear in the `Easy2<RequestContext>` parameter of
/// the `configure` closure passed to [`crate::Agent::submit`]; its fields and
/// most of its methods stay crate-private.
pub struct RequestContext {
    span: tracing::Span,
    handle: RequestHandle,
    agent: AgentRef,

    header_cap: usize,
    header_bytes: usize,
    headers: HeaderMap,
    status: Option<StatusCode>,
    version: Version,
    follow_redirects: bool,
    is_redirect: bool,

    request_body: BoxBody,
    send_state: SendTransferState,
    request_body_waker: Waker,

    response_sink: Option<ResponseBodySink>,
    sender: Option<oneshot::Sender<Result<http::Response<ResponseBodyReader>, Error>>>,

    metrics: Arc<Mutex<Metrics>>,
    on_auth_available: Option<Box<dyn FnOnce(u32) + Send>>,
}

impl RequestContext {
    const SEND_BUFFER_SIZE: usize = 64 * 1024;

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        span: tracing::Span,
        handle: RequestHandle,
        agent: AgentRef,
        header_cap: usize,
        follow_redirects: bool,
        request_body: BoxBody,
        request_body_waker: Waker,
        on_auth_available: Option<Box<dyn FnOnce(u32) + Send>>,
    ) -> (Self, oneshot::Receiver<Result<http::Response<ResponseBodyReader>, Error>>) {
        let (tx, rx) = oneshot::channel();

        let context = RequestContext {
            span,
            handle,
            agent,
            header_cap,
            header_bytes: 0,
            headers: HeaderMap::new(),
            status: None,
            version: Version::HTTP_11,
            follow_redirects,
            is_redirect: false,
            request_body,
            send_state: SendTransferState::new(Self::SEND_BUFFER_SIZE),
            request_body_waker,
            response_sink: None,
            sender: Some(tx),
            metrics: Arc::new(Mutex::new(Metrics::default())),
            on_auth_available,
        };

        (context, rx)
    }

    pub(crate) fn handle(&self) -> &RequestHandle {
        &self.handle
    }

    pub(crate) fn metrics(&self) -> Arc<Mutex<Metrics>> {
        Arc::clone(&self.metrics)
    }

    /// the status line most recently parsed, or `None` before any response
    /// has arrived.
    pub(crate) fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// whether the status line currently held is a redirect the transport was
    /// configured to follow. consulted by the worker's completion-reap step to
    /// decide whether an "unsupported protocol" completion error should be
    /// swallowed rather than failing the request.
    pub(crate) fn is_redirect(&self) -> bool {
        self.is_redirect
    }

    /// complete the caller's future with an error and stop any body stream
    /// still being read. idempotent: called at most once effectively, since
    /// `sender` is consumed on first use.
    pub(crate) fn fail(&mut self, err: Error) {
        if let Some(tx) = self.sender.take() {
            let _ = tx.send(Err(err));
        } else if let Some(sink) = &self.response_sink {
            sink.fail(err);
        }
    }

    fn publish_response(&mut self) {
        let Some(tx) = self.sender.take() else {
            return;
        };

        let (sink, reader) = ResponseBodySink::new(self.agent.clone(), self.handle.clone());
        self.response_sink = Some(sink);

        let mut response = http::Response::new(reader);
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.version_mut() = self.version;
        *response.headers_mut() = self.headers.clone();

        let _ = tx.send(Ok(response));
    }

    /// invoked by the worker after a completed transfer reports which auth
    /// schemes the server would have accepted (`CURLINFO_HTTPAUTH_AVAIL`),
    /// handing credential selection back to whoever built the request.
    pub(crate) fn notify_auth_available(&mut self, mask: u32) {
        if let Some(cb) = self.on_auth_available.take() {
            cb(mask);
        }
    }

}

impl Handler for RequestContext {
    fn header(&mut self, data: &[u8]) -> bool {
        let _enter = self.span.enter();

        if let Some((version, status)) = parse_status_line(data) {
            self.headers.clear();
            self.header_bytes = data.len();
            self.version = version;
            self.status = Some(status);
            self.is_redirect = self.follow_redirects && REDIRECT_STATUSES.contains(&status.as_u16());
            return true;
        }

        self.header_bytes += data.len();
        if self.header_bytes > self.header_cap {
            tracing::debug!(token = ?self.handle, "response headers exceeded cap, aborting");
            self.fail(Error::HeadersTooLarge);
            return false;
        }

        if data == b"\r\n" || data == b"\n" {
            if let Some(status) = self.status {
                if !status.is_informational() {
                    self.publish_response();
                }
            }
            return true;
        }

        match parse_header_line(data) {
            Some((name, value)) => {
                self.headers.append(name, value);
                true
            }
            None => {
                // not every header-callback invocation is a clean `Name: value` line
                // (folded continuations, garbage from a misbehaving server); curl
                // tolerates us ignoring bytes we can't make sense of.
                true
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        let _enter = self.span.enter();

        let Some(sink) = &self.response_sink else {
            // headers haven't been published yet; curl only calls this after
            // the header callback has seen the blank line ending the block.
            return Ok(data.len());
        };

        match sink.transfer_data_to_stream(data) {
            TransferOutcome::Accepted(n) => Ok(n),
            TransferOutcome::Pause => {
                // resumption is the reader's job: `ResponseBodyReader::poll_next`
                // posts `Submission::Unpause` itself as soon as it drains a chunk
                // from a full queue, so there is nothing to schedule here.
                Err(WriteError::Pause)
            }
            TransferOutcome::Closed => {
                tracing::trace!(token = ?self.handle, "response body reader dropped, discarding remainder");
                Ok(data.len())
            }
        }
    }

    fn read(&mut self, data: &mut [u8]) -> Result<usize, ReadError> {
        let _enter = self.span.enter();
        let mut cx = TaskContext::from_waker(&self.request_body_waker);
        match self.send_state.poll_send(&mut cx, self.request_body.as_mut(), data) {
            Poll::Pending => Err(ReadError::Pause),
            Poll::Ready(Ok(n)) => Ok(n),
            Poll::Ready(Err(e)) => {
                tracing::debug!(token = ?self.handle, "request body read failed: {e}");
                self.fail(Error::Io(e));
                Err(ReadError::Abort)
            }
        }
    }

    fn seek(&mut self, whence: std::io::SeekFrom) -> SeekResult {
        match whence {
            std::io::SeekFrom::Start(0) => {
                if self.request_body.as_mut().try_reset() {
                    self.send_state = SendTransferState::new(Self::SEND_BUFFER_SIZE);
                    SeekResult::Ok
                } else {
                    SeekResult::CantSeek
                }
            }
            _ => SeekResult::CantSeek,
        }
    }

    fn debug(&mut self, kind: InfoType, data: &[u8]) {
        let text = || String::from_utf8_lossy(data);
        match kind {
            InfoType::Text => tracing::trace!(token = ?self.handle, "{}", text().trim_end()),
            InfoType::HeaderIn | InfoType::HeaderOut => {
                tracing::trace!(token = ?self.handle, direction = ?kind, "{}", text().trim_end())
            }
            InfoType::DataIn | InfoType::DataOut => {
                tracing::trace!(token = ?self.handle, direction = ?kind, bytes = data.len(), "data")
            }
            _ => {}
        }
    }

    fn progress(&mut self, dltotal: f64, dlnow: f64, ultotal: f64, ulnow: f64) -> bool {
        if let Ok(mut m) = self.metrics.lock() {
            m.download_total = dltotal;
            m.download_now = dlnow;
            m.upload_total = ultotal;
            m.upload_now = ulnow;
        }
        true
    }
}

enum SendState {
    Idle,
    Reading,
    Draining,
}

/// the Idle/Reading/Draining state machine behind the send (upload) callback.
///
/// holds a fixed staging buffer because an async read can hand back more or
/// fewer bytes than libcurl requested in a given callback invocation; any
/// surplus is drained across subsequent invocations before a new read starts.
pub(crate) struct SendTransferState {
    buf: Box<[u8]>,
    state: SendState,
    offset: usize,
    count: usize,
}

impl SendTransferState {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            state: SendState::Idle,
            offset: 0,
            count: 0,
        }
    }

    pub(crate) fn poll_send(
        &mut self,
        cx: &mut TaskContext<'_>,
        mut body: Pin<&mut (dyn crate::body::RequestBodyReader)>,
        out: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        loop {
            match self.state {
                SendState::Draining => {
                    let n = (self.count - self.offset).min(out.len());
                    out[..n].copy_from_slice(&self.buf[self.offset..self.offset + n]);
                    self.offset += n;
                    if self.offset == self.count {
                        self.offset = 0;
                        self.count = 0;
                        self.state = SendState::Idle;
                    }
                    return Poll::Ready(Ok(n));
                }
                SendState::Idle | SendState::Reading => {
                    let want = out.len().min(self.buf.len()).max(1);
                    return match body.as_mut().poll_read(cx, &mut self.buf[..want]) {
                        Poll::Pending => {
                            self.state = SendState::Reading;
                            Poll::Pending
                        }
                        Poll::Ready(Ok(0)) => {
                            self.state = SendState::Idle;
                            Poll::Ready(Ok(0))
                        }
                        Poll::Ready(Ok(n)) => {
                            self.count = n;
                            self.offset = 0;
                            self.state = SendState::Draining;
                            continue;
                        }
                        Poll::Ready(Err(e)) => {
                            self.state = SendState::Idle;
                            Poll::Ready(Err(e))
                        }
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BytesBody;
    use std::task::Waker;

    fn noop_waker() -> Waker {
        futures_util_noop_waker()
    }

    // avoids a direct dependency on `futures-util` just for `noop_waker` in tests.
    fn futures_util_noop_waker() -> Waker {
        use std::task::{RawWaker, RawWakerVTable};
        fn no_op(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            raw()
        }
        fn raw() -> RawWaker {
            static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        unsafe { Waker::from_raw(raw()) }
    }

    #[test]
    fn drains_surplus_across_calls() {
        let mut state = SendTransferState::new(8);
        let mut body = Box::pin(BytesBody::new(&b"abcdefgh"[..]));
        let waker = noop_waker();
        let mut cx = TaskContext::from_waker(&waker);

        let mut out = [0u8; 3];
        let n = match state.poll_send(&mut cx, body.as_mut(), &mut out) {
            Poll::Ready(Ok(n)) => n,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(n, 3);
        assert_eq!(&out[..3], b"abc");

        let n = match state.poll_send(&mut cx, body.as_mut(), &mut out) {
            Poll::Ready(Ok(n)) => n,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(n, 3);
        assert_eq!(&out[..3], b"def");
    }

    #[test]
    fn eof_is_idle_and_reusable_after_reset() {
        let mut state = SendTransferState::new(8);
        let mut body = Box::pin(BytesBody::new(&b""[..]));
        let waker = noop_waker();
        let mut cx = TaskContext::from_waker(&waker);

        let mut out = [0u8; 3];
        match state.poll_send(&mut cx, body.as_mut(), &mut out) {
            Poll::Ready(Ok(0)) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(state.state, SendState::Idle));
    }
}
