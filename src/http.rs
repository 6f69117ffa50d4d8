//! HTTP engine collaborator boundary (§4.5's "assume a conforming streaming
//! HTTP engine is available" Non-goal).
//!
//! The original delegates all HTTP/1.1 parsing to libevent's `evhttp`:
//! `header_cb`/`chunked_cb`/`error_cb`/`request_done_cb` on the client side,
//! and `evhttp_set_gencb` on the server side. This module declares the same
//! shape as plain Rust types rather than re-deriving an HTTP parser, so
//! [`crate::pipeline`] can be written and tested against it without pulling
//! in a full HTTP stack spec.md explicitly scopes out.

use std::collections::HashMap;

/// A request line plus headers, as delivered to a server-side handler
/// (`evhttp_set_gencb`'s callback) or built for an outbound client request
/// (`evhttp_request_new`).
#[derive(Clone, Debug, Default)]
pub struct RequestHead {
    pub method: Method,
    /// Path plus query string, e.g. `/a/b?c=d` — the original's
    /// `evhttp_uri_get_path` + `evhttp_uri_get_query` concatenation.
    pub request_uri: String,
    pub headers: HashMap<String, String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Method {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
}

/// A response's status line plus headers, delivered before any body bytes
/// (`header_cb`'s view of the response, before `chunked_cb` starts firing).
#[derive(Clone, Debug)]
pub struct ResponseHead {
    pub status_code: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status_code, 301 | 302 | 307 | 308)
    }

    pub fn location(&self) -> Option<&str> {
        self.header("Location")
    }
}

/// Outcome of an upstream request, delivered to `request_done_cb`: either
/// it completed (with or without a response having started) or the
/// connection died before a response head ever arrived.
#[derive(Debug)]
pub enum UpstreamOutcome {
    Completed,
    ConnectionFailed,
}

/// What an upstream client connection hands the pipeline as events arrive,
/// mirroring `header_cb` → `chunked_cb`* → `request_done_cb`.
pub trait UpstreamEvents: Send {
    fn on_head(&mut self, head: ResponseHead);
    fn on_chunk(&mut self, chunk: &[u8]);
    fn on_done(&mut self, outcome: UpstreamOutcome);
}

/// What a downstream (client-facing) connection exposes so the pipeline can
/// drive it, mirroring `evhttp_send_reply_start`/`_chunk`/`_end` and
/// `evhttp_send_error`.
pub trait DownstreamHandle: Send {
    fn send_reply_start(&mut self, status_code: u16, reason: &str, headers: &HashMap<String, String>);
    fn send_reply_chunk(&mut self, chunk: &[u8]);
    fn send_reply_end(&mut self);
    fn send_error(&mut self, status_code: u16, reason: &str);
    /// `true` once the underlying connection is known to have gone away —
    /// the original's recurring `evhttp_request_get_connection(...)` guard
    /// before every send call.
    fn is_connected(&self) -> bool;
}
