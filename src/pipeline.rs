//! Injector streaming proxy pipeline (§4.5).
//!
//! Grounded in `injector.c`: `submit_request`/`make_connection` (request
//! construction and origin target resolution), `header_cb` (redirect
//! follow-up, response header whitelist, response-head relay),
//! `chunked_cb` (incremental `crypto_generichash_update`, replaced here by
//! [`crate::types::StreamingHash`]), and `request_done_cb` (the final
//! `dht_put_value(url_hash, content_hash)` publication).
//!
//! Networking itself — resolving and opening the upstream connection,
//! parsing the wire bytes into [`crate::http::ResponseHead`]/chunks — is
//! the "conforming streaming HTTP engine" collaborator declared in
//! [`crate::http`]; this module only holds the per-request state machine
//! and the decisions the original makes inside its callbacks.

use std::collections::HashMap;

use crate::http::{DownstreamHandle, Method, RequestHead, ResponseHead, UpstreamOutcome};
use crate::types::{hash_url, StreamingHash, UrlCommitment};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("too many redirects ({0})")]
    TooManyRedirects(u32),
    #[error("malformed request uri: {0}")]
    MalformedUri(String),
}

/// Upstream request headers copied through to the client request
/// (`request_header_whitelist` in `submit_request`).
const REQUEST_HEADER_WHITELIST: &[&str] = &["Referer"];
/// Upstream response headers copied through to the downstream reply
/// (`response_header_whitelist` in `header_cb`).
const RESPONSE_HEADER_WHITELIST: &[&str] = &["Content-Length", "Content-Type"];

/// A same-process-resolved target for an upstream connection: scheme-derived
/// port when the URI doesn't specify one (`get_port_for_scheme`), plus the
/// path+query the injector actually requests (`evhttp_uri_get_path`/`_query`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub path_and_query: String,
}

/// Minimal `scheme://host[:port]/path[?query]` parse, standing in for
/// `evhttp_uri_parse` (also a hand-rolled parser, not a general-purpose
/// library, in the original).
pub fn parse_target(uri: &str) -> Result<UpstreamTarget, PipelineError> {
    let (scheme, rest) = uri.split_once("://").ok_or_else(|| PipelineError::MalformedUri(uri.to_string()))?;
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        other => return Err(PipelineError::MalformedUri(format!("unsupported scheme {other}"))),
    };
    let (authority, path_and_query) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.split_once(':') {
        Some((h, p)) => (h, p.parse().map_err(|_| PipelineError::MalformedUri(uri.to_string()))?),
        None => (authority, default_port),
    };
    if host.is_empty() {
        return Err(PipelineError::MalformedUri(uri.to_string()));
    }
    Ok(UpstreamTarget {
        host: host.to_string(),
        port,
        path_and_query: if path_and_query.is_empty() { "/".to_string() } else { path_and_query.to_string() },
    })
}

/// Bound on redirect chases per client request; the original follows
/// `evhttp`'s redirects with no explicit cap (an unbounded-loop risk this
/// core closes, per its own "Redesign Flags").
pub const MAX_REDIRECTS: u32 = 10;

pub enum HeadOutcome {
    /// Headers accepted; the pipeline should relay a response start to the
    /// downstream client and begin forwarding chunks.
    Proceed,
    /// A 301/302 with a `Location` header: reconnect to `target` and replay
    /// the request, migrating the same downstream handle (`p->server_req`
    /// is carried into the new `proxy_request` in the original).
    Redirect { target: UpstreamTarget, location: String },
}

/// Per-request state carried across a possible chain of redirects, paired
/// with exactly one live downstream handle (`proxy_request` in the original).
pub struct ProxyRequest<D: DownstreamHandle> {
    downstream: D,
    request_uri: String,
    referer: Option<String>,
    content_hash: StreamingHash,
    redirect_depth: u32,
    response_started: bool,
}

impl<D: DownstreamHandle> ProxyRequest<D> {
    pub fn new(request_uri: String, referer: Option<String>, downstream: D) -> Self {
        Self {
            downstream,
            request_uri,
            referer,
            content_hash: StreamingHash::new(),
            redirect_depth: 0,
            response_started: false,
        }
    }

    /// Builds the request head sent upstream: the `Referer` whitelist copy
    /// plus a `Host` header overwritten to the upstream target's authority
    /// (`overwrite_header(client_req, "Host", address)`).
    pub fn build_upstream_request(&self, target: &UpstreamTarget) -> RequestHead {
        let mut headers = HashMap::new();
        if let Some(referer) = &self.referer {
            headers.insert("Referer".to_string(), referer.clone());
        }
        headers.insert("Host".to_string(), target.host.clone());
        RequestHead { method: Method::Get, request_uri: target.path_and_query.clone(), headers }
    }

    /// `header_cb`: follows 301/302/307/308 via `Location` (bumping the redirect
    /// counter and resetting the content hash, since a redirect discards
    /// whatever partial body the prior hop may have started streaming),
    /// otherwise whitelists `Content-Length`/`Content-Type` through and
    /// starts the downstream reply.
    pub fn on_upstream_head(&mut self, head: ResponseHead) -> Result<HeadOutcome, PipelineError> {
        if head.is_redirect() {
            if self.redirect_depth >= MAX_REDIRECTS {
                return Err(PipelineError::TooManyRedirects(self.redirect_depth));
            }
            let location = head.location().ok_or_else(|| PipelineError::MalformedUri(String::new()))?.to_string();
            let target = parse_target(&location)?;
            self.redirect_depth += 1;
            self.content_hash = StreamingHash::new();
            return Ok(HeadOutcome::Redirect { target, location });
        }

        let mut reply_headers = HashMap::new();
        for name in RESPONSE_HEADER_WHITELIST {
            if let Some(value) = head.header(name) {
                reply_headers.insert(name.to_string(), value.to_string());
            }
        }
        if self.downstream.is_connected() {
            self.downstream.send_reply_start(head.status_code, &head.reason, &reply_headers);
        }
        self.response_started = true;
        Ok(HeadOutcome::Proceed)
    }

    /// `chunked_cb`: feeds the streaming hash in network-receive order and
    /// relays the chunk downstream.
    pub fn on_upstream_chunk(&mut self, chunk: &[u8]) {
        self.content_hash.update(chunk);
        if self.downstream.is_connected() {
            self.downstream.send_reply_chunk(chunk);
        }
    }

    /// `request_done_cb`: on a clean completion, finalizes the hash and
    /// returns the commitment to publish; a response that never started is
    /// answered with 502 (`evhttp_send_error(req, 502, "Bad Gateway")`), and
    /// one that started but died mid-stream is just ended without
    /// publishing (the body is incomplete, so its hash can't be trusted).
    pub fn on_upstream_done(mut self, outcome: UpstreamOutcome) -> Option<UrlCommitment> {
        match outcome {
            UpstreamOutcome::Completed => {
                let content_hash = self.content_hash.finalize();
                let url_hash = hash_url(&self.request_uri);
                if self.downstream.is_connected() {
                    self.downstream.send_reply_end();
                }
                Some(UrlCommitment { url_hash, content_hash })
            }
            UpstreamOutcome::ConnectionFailed => {
                if !self.response_started && self.downstream.is_connected() {
                    self.downstream.send_error(502, "Bad Gateway");
                } else if self.downstream.is_connected() {
                    self.downstream.send_reply_end();
                }
                None
            }
        }
    }

    pub fn redirect_depth(&self) -> u32 {
        self.redirect_depth
    }

    pub fn into_downstream(self) -> D {
        self.downstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        connected: bool,
    }

    struct RecordingDownstream(Rc<RefCell<Recorder>>);

    impl DownstreamHandle for RecordingDownstream {
        fn send_reply_start(&mut self, status_code: u16, reason: &str, _headers: &HashMap<String, String>) {
            self.0.borrow_mut().events.push(format!("start {status_code} {reason}"));
        }
        fn send_reply_chunk(&mut self, chunk: &[u8]) {
            self.0.borrow_mut().events.push(format!("chunk {}", chunk.len()));
        }
        fn send_reply_end(&mut self) {
            self.0.borrow_mut().events.push("end".to_string());
        }
        fn send_error(&mut self, status_code: u16, reason: &str) {
            self.0.borrow_mut().events.push(format!("error {status_code} {reason}"));
        }
        fn is_connected(&self) -> bool {
            self.0.borrow().connected
        }
    }

    fn recorder() -> (Rc<RefCell<Recorder>>, RecordingDownstream) {
        let rec = Rc::new(RefCell::new(Recorder { connected: true, ..Default::default() }));
        let handle = RecordingDownstream(rec.clone());
        (rec, handle)
    }

    #[test]
    fn parses_target_with_default_and_explicit_port() {
        let t = parse_target("http://example.com/a/b?c=d").unwrap();
        assert_eq!(t, UpstreamTarget { host: "example.com".into(), port: 80, path_and_query: "/a/b?c=d".into() });

        let t2 = parse_target("https://example.com:8443/x").unwrap();
        assert_eq!(t2.port, 8443);
    }

    #[test]
    fn host_header_is_overwritten_to_upstream_target() {
        let (_rec, handle) = recorder();
        let req = ProxyRequest::new("/a".into(), None, handle);
        let target = UpstreamTarget { host: "origin.example".into(), port: 80, path_and_query: "/a".into() };
        let head = req.build_upstream_request(&target);
        assert_eq!(head.headers.get("Host"), Some(&"origin.example".to_string()));
    }

    #[test]
    fn referer_is_copied_through_when_present() {
        let (_rec, handle) = recorder();
        let req = ProxyRequest::new("/a".into(), Some("https://referer.example/".into()), handle);
        let target = UpstreamTarget { host: "origin.example".into(), port: 80, path_and_query: "/a".into() };
        let head = req.build_upstream_request(&target);
        assert_eq!(head.headers.get("Referer"), Some(&"https://referer.example/".to_string()));
    }

    #[test]
    fn completed_request_publishes_commitment_matching_streamed_body() {
        let (rec, handle) = recorder();
        let mut req = ProxyRequest::new("/a".into(), None, handle);

        let head = ResponseHead { status_code: 200, reason: "OK".into(), headers: HashMap::new() };
        assert!(matches!(req.on_upstream_head(head).unwrap(), HeadOutcome::Proceed));
        req.on_upstream_chunk(b"hello ");
        req.on_upstream_chunk(b"world");

        let commitment = req.on_upstream_done(UpstreamOutcome::Completed).unwrap();
        assert_eq!(commitment.url_hash, hash_url("/a"));
        assert_eq!(commitment.content_hash, crate::types::blake2b_256(b"hello world"));
        assert_eq!(rec.borrow().events, vec!["start 200 OK", "chunk 6", "chunk 5", "end"]);
    }

    #[test]
    fn redirect_resets_hash_and_bumps_depth() {
        let (_rec, handle) = recorder();
        let mut req = ProxyRequest::new("/a".into(), None, handle);
        req.on_upstream_chunk(b"discarded");

        let mut headers = HashMap::new();
        headers.insert("Location".to_string(), "http://elsewhere.example/b".to_string());
        let head = ResponseHead { status_code: 302, reason: "Found".into(), headers };
        match req.on_upstream_head(head).unwrap() {
            HeadOutcome::Redirect { target, .. } => assert_eq!(target.host, "elsewhere.example"),
            HeadOutcome::Proceed => panic!("expected redirect"),
        }
        assert_eq!(req.redirect_depth(), 1);

        req.on_upstream_chunk(b"kept");
        let commitment = req.on_upstream_done(UpstreamOutcome::Completed).unwrap();
        assert_eq!(commitment.content_hash, crate::types::blake2b_256(b"kept"));
    }

    #[test]
    fn exceeding_redirect_cap_errors_instead_of_looping_forever() {
        let (_rec, handle) = recorder();
        let mut req = ProxyRequest::new("/a".into(), None, handle);
        req.redirect_depth = MAX_REDIRECTS;

        let mut headers = HashMap::new();
        headers.insert("Location".to_string(), "http://elsewhere.example/b".to_string());
        let head = ResponseHead { status_code: 302, reason: "Found".into(), headers };
        assert!(matches!(req.on_upstream_head(head), Err(PipelineError::TooManyRedirects(_))));
    }

    #[test]
    fn connection_failure_before_any_response_sends_bad_gateway() {
        let (rec, handle) = recorder();
        let req = ProxyRequest::new("/a".into(), None, handle);
        assert!(req.on_upstream_done(UpstreamOutcome::ConnectionFailed).is_none());
        assert_eq!(rec.borrow().events, vec!["error 502 Bad Gateway"]);
    }

    #[test]
    fn connection_failure_after_response_started_ends_without_publishing() {
        let (rec, handle) = recorder();
        let mut req = ProxyRequest::new("/a".into(), None, handle);
        let head = ResponseHead { status_code: 200, reason: "OK".into(), headers: HashMap::new() };
        req.on_upstream_head(head).unwrap();
        req.on_upstream_chunk(b"partial");

        assert!(req.on_upstream_done(UpstreamOutcome::ConnectionFailed).is_none());
        assert_eq!(rec.borrow().events, vec!["start 200 OK", "chunk 7", "end"]);
    }
}
