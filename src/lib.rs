//! a single-threaded libcurl multi-handle event loop that bridges a caller's
//! async request/response model to libcurl's callback-based transfer API.
//!
//! [`Agent`] owns one worker thread, which drives every transfer submitted to
//! it through libcurl's non-blocking wait/perform cycle. callers never touch
//! the multi handle directly: they submit a request through [`Agent::submit`]
//! from whatever thread they're on, and get back a future that resolves once
//! the response's headers have arrived, plus a [`RequestHandle`] for
//! cancelling the transfer early.
//!
//! what this crate does *not* do: interpret HTTP headers, follow redirects,
//! manage cookies, cache credentials, or configure TLS. those are the
//! responsibility of whatever builds the `curl::easy::Easy2` options in the
//! `configure` closure passed to [`Agent::submit`].

mod agent;
mod body;
mod context;
mod error;
mod handle;
mod parse;
mod queue;
mod request;
mod wakeup;

pub use body::{BoxBody, BytesBody, EmptyBody, RequestBodyReader, ResponseBodyReader};
pub use context::{Metrics, RequestContext};
pub use error::Error;
pub use handle::{Agent, AgentBuilder, ResponseFuture, SubmittedRequest};
pub use queue::RequestHandle;
pub use request::RequestBuilder;

pub use curl;
pub use http;
