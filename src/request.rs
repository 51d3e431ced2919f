//! a minimal request builder used by this crate's own tests and doctests.
//!
//! the actual HTTP object model — header semantics, redirects, cookies,
//! credentials — belongs to the caller's own client; this just demonstrates
//! the `configure` contract [`crate::Agent::submit`] expects.

use curl::easy::Easy2;

use crate::{
    body::{BoxBody, EmptyBody},
    context::RequestContext,
    error::Error,
};

/// builds the closure handed to [`crate::Agent::submit`].
pub struct RequestBuilder {
    url: String,
    method: Method,
    body: BoxBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
}

impl RequestBuilder {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(url, Method::Get)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(url, Method::Post)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(url, Method::Put)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(url, Method::Delete)
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self::new(url, Method::Head)
    }

    fn new(url: impl Into<String>, method: Method) -> Self {
        Self {
            url: url.into(),
            method,
            body: Box::pin(EmptyBody),
        }
    }

    pub fn body(mut self, body: BoxBody) -> Self {
        self.body = body;
        self
    }

    /// split into the `(configure, body)` pair [`crate::Agent::submit`] takes.
    pub fn into_parts(self) -> (impl FnOnce(&mut Easy2<RequestContext>) -> Result<(), Error> + Send + 'static, BoxBody) {
        let Self { url, method, body } = self;
        let configure = move |easy: &mut Easy2<RequestContext>| -> Result<(), Error> {
            easy.url(&url)?;
            match method {
                Method::Get => easy.get(true)?,
                Method::Post => easy.post(true)?,
                Method::Put => easy.put(true)?,
                Method::Delete => easy.custom_request("DELETE")?,
                Method::Head => {
                    easy.nobody(true)?;
                    easy.custom_request("HEAD")?;
                }
            }
            easy.signal(false)?;
            easy.follow_location(false)?;
            Ok(())
        };
        (configure, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_to_empty_body() {
        let (_, _body) = RequestBuilder::get("https://example.invalid/").into_parts();
    }
}
