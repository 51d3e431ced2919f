//! request and response body plumbing used by [`crate::context::RequestContext`].
//!
//! mirrors the shape of the teacher's `body.rs`/`Once`/`BoxBody` types, but
//! read-oriented rather than stream-oriented: curl's send callback wants to
//! copy bytes directly into a buffer it owns, so the request body side is
//! modelled as a poll-based reader instead of a `Stream`.

use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

use bytes::Bytes;
use futures_core::Stream;

use crate::{
    error::Error,
    queue::{AgentRef, RequestHandle, Submission},
};

/// the caller-supplied source of a request body.
///
/// `poll_read` fills as much of `buf` as is ready and returns the number of
/// bytes written, mirroring [`std::io::Read`] but asynchronously. Returning
/// `Poll::Ready(Ok(0))` signals end of body.
pub trait RequestBodyReader: Send {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>>;

    /// attempt to rewind to the start of the body. returns `false` if the
    /// body is not resettable (e.g. it has already been partially consumed
    /// from a non-seekable source).
    fn try_reset(self: Pin<&mut Self>) -> bool;
}

/// a request with no body (`GET`, `HEAD`, ...). always at EOF, trivially resettable.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyBody;

impl RequestBodyReader for EmptyBody {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut [u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(0))
    }

    fn try_reset(self: Pin<&mut Self>) -> bool {
        true
    }
}

/// a fully buffered in-memory request body. always resettable.
#[derive(Debug, Clone)]
pub struct BytesBody {
    bytes: Bytes,
    pos: usize,
}

impl BytesBody {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            pos: 0,
        }
    }
}

impl RequestBodyReader for BytesBody {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let remaining = &this.bytes[this.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        this.pos += n;
        Poll::Ready(Ok(n))
    }

    fn try_reset(self: Pin<&mut Self>) -> bool {
        self.get_mut().pos = 0;
        true
    }
}

/// an async, possibly non-resettable request body backed by an arbitrary future-producing reader.
pub type BoxBody = Pin<Box<dyn RequestBodyReader>>;

/// the outcome of handing a chunk of response data to the downstream sink.
#[derive(Debug)]
pub(crate) enum TransferOutcome {
    /// all `n` bytes were accepted.
    Accepted(usize),
    /// the downstream reader applied backpressure; the transfer must pause.
    Pause,
    /// the downstream reader is gone; the transfer should be aborted.
    Closed,
}

/// bridges curl's synchronous write callback to an asynchronous response
/// body stream. a plain mutex-guarded queue rather than `tokio::sync::mpsc`:
/// the write callback runs on the worker's own OS thread, not inside a tokio
/// runtime, and freeing capacity needs to resume the transfer by posting an
/// `Unpause` submission directly rather than waking a registered task.
struct Pipe {
    chunks: VecDeque<Result<Bytes, Error>>,
    /// set when the reader is dropped: the producer should stop and discard.
    reader_gone: bool,
    /// set when the sink is dropped: the reader should yield `None` once the
    /// backlog already queued has been drained, same as an EOF marker.
    done: bool,
    read_waker: Option<Waker>,
}

/// held by the write callback; a full queue *is* backpressure, mapping
/// directly onto curl's pause/resume protocol.
pub(crate) struct ResponseBodySink {
    shared: Arc<Mutex<Pipe>>,
}

impl ResponseBodySink {
    /// queue depth chosen so a handful of curl's default-size (16KiB) read
    /// buffers can be in flight before backpressure kicks in.
    const CAPACITY: usize = 4;

    pub(crate) fn new(agent: AgentRef, handle: RequestHandle) -> (Self, ResponseBodyReader) {
        let shared = Arc::new(Mutex::new(Pipe {
            chunks: VecDeque::new(),
            reader_gone: false,
            done: false,
            read_waker: None,
        }));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            ResponseBodyReader { shared, agent, handle },
        )
    }

    pub(crate) fn transfer_data_to_stream(&self, data: &[u8]) -> TransferOutcome {
        let mut pipe = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        if pipe.reader_gone {
            return TransferOutcome::Closed;
        }
        if pipe.chunks.len() >= Self::CAPACITY {
            return TransferOutcome::Pause;
        }
        pipe.chunks.push_back(Ok(Bytes::copy_from_slice(data)));
        if let Some(waker) = pipe.read_waker.take() {
            drop(pipe);
            waker.wake();
        }
        TransferOutcome::Accepted(data.len())
    }

    pub(crate) fn fail(&self, err: Error) {
        let mut pipe = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        pipe.chunks.push_back(Err(err));
        if let Some(waker) = pipe.read_waker.take() {
            drop(pipe);
            waker.wake();
        }
    }
}

impl Drop for ResponseBodySink {
    fn drop(&mut self) {
        let mut pipe = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        pipe.done = true;
        if let Some(waker) = pipe.read_waker.take() {
            drop(pipe);
            waker.wake();
        }
    }
}

/// the response body exposed to the caller.
pub struct ResponseBodyReader {
    shared: Arc<Mutex<Pipe>>,
    agent: AgentRef,
    handle: RequestHandle,
}

impl Stream for ResponseBodyReader {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut pipe = this.shared.lock().unwrap_or_else(|e| e.into_inner());

        let was_full = pipe.chunks.len() >= ResponseBodySink::CAPACITY;
        match pipe.chunks.pop_front() {
            Some(item) => {
                drop(pipe);
                if was_full {
                    this.agent.enqueue(Submission::Unpause(this.handle.clone()));
                }
                Poll::Ready(Some(item))
            }
            None if pipe.done => Poll::Ready(None),
            None => {
                pipe.read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for ResponseBodyReader {
    fn drop(&mut self) {
        let mut pipe = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        pipe.reader_gone = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{RequestHandle, Shared};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{RawWaker, RawWakerVTable};

    fn noop_waker() -> Waker {
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

    fn flag_waker(flag: Arc<AtomicBool>) -> Waker {
        fn clone(ptr: *const ()) -> RawWaker {
            unsafe { Arc::increment_strong_count(ptr as *const AtomicBool) };
            RawWaker::new(ptr, vtable())
        }
        fn wake(ptr: *const ()) {
            let flag = unsafe { Arc::from_raw(ptr as *const AtomicBool) };
            flag.store(true, Ordering::SeqCst);
        }
        fn wake_by_ref(ptr: *const ()) {
            let flag = unsafe { Arc::from_raw(ptr as *const AtomicBool) };
            flag.store(true, Ordering::SeqCst);
            std::mem::forget(flag);
        }
        fn drop_fn(ptr: *const ()) {
            unsafe { drop(Arc::from_raw(ptr as *const AtomicBool)) };
        }
        fn vtable() -> &'static RawWakerVTable {
            static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop_fn);
            &VTABLE
        }
        let ptr = Arc::into_raw(flag) as *const ();
        unsafe { Waker::from_raw(RawWaker::new(ptr, vtable())) }
    }

    #[test]
    fn accepts_until_capacity_then_pauses() {
        let shared = Shared::new();
        let (sink, _reader) = ResponseBodySink::new(AgentRef::detached(&shared), RequestHandle::new());

        for _ in 0..ResponseBodySink::CAPACITY {
            let outcome = sink.transfer_data_to_stream(b"x");
            assert!(matches!(outcome, TransferOutcome::Accepted(1)), "{outcome:?}");
        }
        let outcome = sink.transfer_data_to_stream(b"x");
        assert!(matches!(outcome, TransferOutcome::Pause), "{outcome:?}");
    }

    #[test]
    fn draining_a_full_queue_reenqueues_unpause() {
        let shared = Shared::new();
        let handle = RequestHandle::new();
        let (sink, mut reader) = ResponseBodySink::new(AgentRef::detached(&shared), handle.clone());

        for _ in 0..ResponseBodySink::CAPACITY {
            sink.transfer_data_to_stream(b"x");
        }
        assert!(matches!(sink.transfer_data_to_stream(b"x"), TransferOutcome::Pause));

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let polled = Pin::new(&mut reader).poll_next(&mut cx);
        assert!(matches!(polled, Poll::Ready(Some(Ok(_)))));

        let drained = shared.drain();
        assert_eq!(drained.len(), 1);
        assert!(matches!(&drained[0], Submission::Unpause(h) if h.is(&handle)));
    }

    #[test]
    fn draining_a_non_full_queue_does_not_reenqueue_unpause() {
        let shared = Shared::new();
        let (sink, mut reader) = ResponseBodySink::new(AgentRef::detached(&shared), RequestHandle::new());
        sink.transfer_data_to_stream(b"x");

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let polled = Pin::new(&mut reader).poll_next(&mut cx);
        assert!(matches!(polled, Poll::Ready(Some(Ok(_)))));

        assert!(shared.drain().is_empty());
    }

    #[test]
    fn empty_queue_registers_waker_and_is_woken_on_push() {
        let shared = Shared::new();
        let (sink, mut reader) = ResponseBodySink::new(AgentRef::detached(&shared), RequestHandle::new());

        let flag = Arc::new(AtomicBool::new(false));
        let waker = flag_waker(Arc::clone(&flag));
        let mut cx = Context::from_waker(&waker);
        assert!(matches!(Pin::new(&mut reader).poll_next(&mut cx), Poll::Pending));
        assert!(!flag.load(Ordering::SeqCst));

        sink.transfer_data_to_stream(b"y");
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn dropping_reader_closes_sink() {
        let shared = Shared::new();
        let (sink, reader) = ResponseBodySink::new(AgentRef::detached(&shared), RequestHandle::new());
        drop(reader);
        assert!(matches!(sink.transfer_data_to_stream(b"x"), TransferOutcome::Closed));
    }

    #[test]
    fn closed_sink_yields_none_after_draining_backlog() {
        let shared = Shared::new();
        let (sink, mut reader) = ResponseBodySink::new(AgentRef::detached(&shared), RequestHandle::new());
        sink.transfer_data_to_stream(b"x");
        drop(sink);

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(matches!(Pin::new(&mut reader).poll_next(&mut cx), Poll::Ready(Some(Ok(_)))));
        assert!(matches!(Pin::new(&mut reader).poll_next(&mut cx), Poll::Ready(None)));
    }
}
