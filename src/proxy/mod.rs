pub mod context;
pub mod payload;

pub use context::{GateContext, GateOutcome};
pub use payload::{origin_id, serialize_request_fields};

use crate::metrics::MetricsCollector;
use crate::reputation::{spawn_edge_ban, Admission, Decision, EdgeBanNotifier, ReputationGate};
use crate::waf::{ContentClassifier, Verdict};
use async_trait::async_trait;
use log::{error, info, warn};
use pingora::http::RequestHeader;
use pingora::prelude::*;
use pingora::upstreams::peer::HttpPeer;
use pingora_proxy::{ProxyHttp, Session};
use bytes::Bytes;
use std::sync::Arc;

/// Status for requests from an origin that was already banned.
pub const BANNED_STATUS: u16 = 403;
/// Status for the request that triggered a ban.
pub const FRESH_BAN_STATUS: u16 = 418;
/// Status for bodies over the buffering limit.
pub const BODY_TOO_LARGE_STATUS: u16 = 413;

/// Where a request body stands after one `request_body_filter` call.
#[derive(Debug, PartialEq, Eq)]
pub enum BodyProgress {
    /// Chunk held back; more is coming.
    Buffering,
    /// Forward this in place of the chunk that arrived.
    Release(Option<Bytes>),
    /// Stopped; `GateContext::outcome` says why.
    Blocked,
}

pub struct GateProxy {
    pub classifier: Arc<ContentClassifier>,
    pub gate: Arc<ReputationGate>,
    pub edge_notifier: Option<Arc<dyn EdgeBanNotifier>>,
    pub metrics: Arc<MetricsCollector>,
    pub upstream_addr: (String, u16),
    pub max_body_size: usize,
    pub trust_forwarded_for: bool,
}

impl GateProxy {
    pub fn new(
        upstream_addr: (String, u16),
        classifier: Arc<ContentClassifier>,
        gate: Arc<ReputationGate>,
        edge_notifier: Option<Arc<dyn EdgeBanNotifier>>,
        metrics: Arc<MetricsCollector>,
        max_body_size: usize,
        trust_forwarded_for: bool,
    ) -> Self {
        Self {
            classifier,
            gate,
            edge_notifier,
            metrics,
            upstream_addr,
            max_body_size,
            trust_forwarded_for,
        }
    }

    fn client_origin(&self, session: &Session) -> String {
        let forwarded_for = session
            .req_header()
            .headers
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok());
        let peer = session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .map(|addr| addr.ip());

        origin_id(forwarded_for, peer, self.trust_forwarded_for)
    }

    /// Reject up front if the origin is already banned.
    pub fn admit(&self, ctx: &mut GateContext) -> Admission {
        let admission = self.gate.check_admission(&ctx.origin_id);
        if admission == Admission::Reject {
            ctx.outcome = Some(GateOutcome::AlreadyBanned);
            self.metrics.increment_rejected_requests("banned");
        }
        admission
    }

    /// Classify a serialized payload and let the gate decide.
    pub fn inspect(&self, ctx: &mut GateContext, payload: &str) -> Decision {
        ctx.inspected = true;
        let verdict = self.classifier.classify(payload);
        let decision = self.gate.observe(&ctx.origin_id, &verdict);

        match (decision, verdict) {
            (Decision::Admit, _) => {
                self.metrics.increment_admitted_requests();
            }
            (Decision::Ban, Verdict::Suspicious { rule_id, excerpt }) => {
                self.metrics.increment_bans(&rule_id);
                self.metrics.increment_rejected_requests("suspicious_payload");
                ctx.outcome = Some(GateOutcome::Banned { rule_id, excerpt });
            }
            (Decision::Ban, Verdict::Clean) => {
                // Banned by a concurrent request after admit() ran.
                self.metrics.increment_rejected_requests("banned");
                ctx.outcome = Some(GateOutcome::AlreadyBanned);
            }
        }

        decision
    }

    /// Hold body chunks back until the stream ends, then classify the whole
    /// body together with the query. Nothing reaches upstream before that.
    pub fn accumulate_body(
        &self,
        ctx: &mut GateContext,
        chunk: Option<Bytes>,
        end_of_stream: bool,
        query: Option<&str>,
        content_type: Option<&str>,
    ) -> BodyProgress {
        if ctx.inspected {
            return BodyProgress::Release(chunk);
        }

        if let Some(chunk) = chunk {
            if let Err(e) = ctx.body_inspector.append_chunk(&chunk) {
                error!("Body size limit exceeded from {}: {}", ctx.origin_id, e);
                ctx.outcome = Some(GateOutcome::BodyTooLarge);
                self.metrics.increment_rejected_requests("body_too_large");
                return BodyProgress::Blocked;
            }
        }

        if !end_of_stream {
            return BodyProgress::Buffering;
        }

        let payload = serialize_request_fields(query, content_type, ctx.body_inspector.body());
        if self.inspect(ctx, &payload) == Decision::Ban {
            return BodyProgress::Blocked;
        }

        let full_body = ctx.body_inspector.body();
        if full_body.is_empty() {
            BodyProgress::Release(None)
        } else {
            BodyProgress::Release(Some(Bytes::copy_from_slice(full_body)))
        }
    }

    /// Flush the ban and push it to the edge without holding up the response.
    pub fn propagate_ban(&self, origin_id: &str) {
        let gate = self.gate.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = gate.persist().await {
                metrics.increment_persist_failures();
                error!("Ban kept in memory only for now: {}", e);
            }
        });

        if let Some(notifier) = &self.edge_notifier {
            spawn_edge_ban(notifier.clone(), origin_id.to_string());
        }
    }

    async fn reject(&self, session: &mut Session, ctx: &GateContext) {
        let status = match &ctx.outcome {
            Some(GateOutcome::Banned { rule_id, excerpt }) => {
                warn!(
                    "Suspicious payload from {} (rule {}): {}",
                    ctx.origin_id, rule_id, excerpt
                );
                FRESH_BAN_STATUS
            }
            Some(GateOutcome::BodyTooLarge) => BODY_TOO_LARGE_STATUS,
            _ => BANNED_STATUS,
        };

        let _ = session.respond_error(status).await;

        if matches!(ctx.outcome, Some(GateOutcome::Banned { .. })) {
            self.propagate_ban(&ctx.origin_id);
        }
    }
}

fn has_body(request: &RequestHeader) -> bool {
    let declared_length = request
        .headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .map(|len| len > 0)
        .unwrap_or(false);

    declared_length || request.headers.contains_key(http::header::TRANSFER_ENCODING)
}

fn content_type(request: &RequestHeader) -> Option<&str> {
    request
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
}

#[async_trait]
impl ProxyHttp for GateProxy {
    type CTX = GateContext;

    fn new_ctx(&self) -> Self::CTX {
        GateContext::new(self.max_body_size)
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        ctx.origin_id = self.client_origin(session);

        if self.admit(ctx) == Admission::Reject {
            self.reject(session, ctx).await;
            return Ok(true);
        }

        // Requests with a body are classified once the body is complete
        if !has_body(session.req_header()) {
            let payload = serialize_request_fields(session.req_header().uri.query(), None, &[]);
            if self.inspect(ctx, &payload) == Decision::Ban {
                self.reject(session, ctx).await;
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn request_body_filter(
        &self,
        session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        let progress = {
            let request = session.req_header();
            self.accumulate_body(
                ctx,
                body.take(),
                end_of_stream,
                request.uri.query(),
                content_type(request),
            )
        };

        match progress {
            BodyProgress::Buffering => Ok(()),
            BodyProgress::Release(full_body) => {
                *body = full_body;
                Ok(())
            }
            BodyProgress::Blocked => {
                self.reject(session, ctx).await;
                let error_type = match ctx.outcome {
                    Some(GateOutcome::BodyTooLarge) => "BodySizeLimitExceeded",
                    _ => "OriginBanned",
                };
                Err(Error::explain(
                    ErrorType::Custom(error_type),
                    format!("Request from {} blocked by reputation gate", ctx.origin_id),
                ))
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        if let Some(outcome) = &ctx.outcome {
            error!(
                "Blocking upstream connection for {}: {:?}",
                ctx.origin_id, outcome
            );
            return Err(Error::explain(
                ErrorType::Custom("OriginBanned"),
                "Request blocked by reputation gate",
            ));
        }

        let peer = Box::new(HttpPeer::new(
            (self.upstream_addr.0.as_str(), self.upstream_addr.1),
            false,
            "".to_string(),
        ));
        Ok(peer)
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let response_code = session
            .response_written()
            .map_or(0, |resp| resp.status.as_u16());

        let method = session.req_header().method.as_str();
        let uri = session.req_header().uri.to_string();

        match (&ctx.outcome, e) {
            (Some(GateOutcome::Banned { rule_id, .. }), _) => warn!(
                "Request banned - Origin: {}, Method: {}, URI: {}, Rule: {}, Status: {}",
                ctx.origin_id, method, uri, rule_id, response_code
            ),
            (Some(outcome), _) => info!(
                "Request rejected - Origin: {}, Method: {}, URI: {}, Reason: {:?}, Status: {}",
                ctx.origin_id, method, uri, outcome, response_code
            ),
            (None, Some(error)) => error!(
                "Request failed - Origin: {}, Method: {}, URI: {}, Error: {:?}",
                ctx.origin_id, method, uri, error
            ),
            (None, None) => info!(
                "Request completed - Origin: {}, Method: {}, URI: {}, Status: {}",
                ctx.origin_id, method, uri, response_code
            ),
        }

        ctx.body_inspector.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reputation::OriginStatus;

    fn proxy() -> GateProxy {
        GateProxy::new(
            ("127.0.0.1".to_string(), 8080),
            Arc::new(ContentClassifier::default()),
            Arc::new(ReputationGate::in_memory()),
            None,
            Arc::new(MetricsCollector::new()),
            1024,
            true,
        )
    }

    fn ctx_for(origin: &str) -> GateContext {
        let mut ctx = GateContext::new(1024);
        ctx.origin_id = origin.to_string();
        ctx
    }

    #[test]
    fn test_clean_payload_admitted() {
        let proxy = proxy();
        let mut ctx = ctx_for("5.6.7.8");
        assert_eq!(proxy.admit(&mut ctx), Admission::Admit);
        assert_eq!(proxy.inspect(&mut ctx, r#"{"name":"hello"}"#), Decision::Admit);
        assert!(!ctx.blocked());
    }

    #[tokio::test]
    async fn test_suspicious_payload_bans_origin() {
        let proxy = proxy();
        let mut ctx = ctx_for("1.2.3.4");
        let payload = serialize_request_fields(Some("js=eval('x')"), None, b"");
        assert_eq!(proxy.inspect(&mut ctx, &payload), Decision::Ban);
        assert!(matches!(
            ctx.outcome,
            Some(GateOutcome::Banned { ref rule_id, .. }) if rule_id == "eval-call"
        ));

        proxy.propagate_ban(&ctx.origin_id);

        let mut next = ctx_for("1.2.3.4");
        assert_eq!(proxy.admit(&mut next), Admission::Reject);
        assert_eq!(next.outcome, Some(GateOutcome::AlreadyBanned));
        assert_eq!(
            proxy.gate.record("1.2.3.4").unwrap().status,
            OriginStatus::Banned
        );
    }

    #[test]
    fn test_split_chunks_classified_at_end_of_stream() {
        let proxy = proxy();
        let mut ctx = ctx_for("1.2.3.4");

        let first = proxy.accumulate_body(
            &mut ctx,
            Some(Bytes::from_static(b"{\"js\":\"ev")),
            false,
            None,
            Some("application/json"),
        );
        assert_eq!(first, BodyProgress::Buffering);
        assert!(!ctx.inspected);

        let last = proxy.accumulate_body(
            &mut ctx,
            Some(Bytes::from_static(b"al('x')\"}")),
            true,
            None,
            Some("application/json"),
        );
        assert_eq!(last, BodyProgress::Blocked);
        assert!(matches!(
            ctx.outcome,
            Some(GateOutcome::Banned { ref rule_id, .. }) if rule_id == "eval-call"
        ));
        assert_eq!(proxy.gate.check_admission("1.2.3.4"), Admission::Reject);
    }

    #[test]
    fn test_clean_body_released_whole() {
        let proxy = proxy();
        let mut ctx = ctx_for("5.6.7.8");

        assert_eq!(
            proxy.accumulate_body(&mut ctx, Some(Bytes::from_static(b"name=")), false, Some("a=1"), None),
            BodyProgress::Buffering
        );
        assert_eq!(
            proxy.accumulate_body(&mut ctx, Some(Bytes::from_static(b"hello")), true, Some("a=1"), None),
            BodyProgress::Release(Some(Bytes::from_static(b"name=hello")))
        );
        assert!(ctx.inspected);
        assert!(!ctx.blocked());

        // Anything after classification passes straight through.
        assert_eq!(
            proxy.accumulate_body(&mut ctx, Some(Bytes::from_static(b"tail")), true, None, None),
            BodyProgress::Release(Some(Bytes::from_static(b"tail")))
        );
    }

    #[test]
    fn test_empty_body_released_as_none() {
        let proxy = proxy();
        let mut ctx = ctx_for("5.6.7.8");
        assert_eq!(
            proxy.accumulate_body(&mut ctx, None, true, None, None),
            BodyProgress::Release(None)
        );
    }

    #[test]
    fn test_oversized_body_blocked() {
        let proxy = proxy();
        let mut ctx = ctx_for("5.6.7.8");

        assert_eq!(
            proxy.accumulate_body(&mut ctx, Some(Bytes::from(vec![b'a'; 1000])), false, None, None),
            BodyProgress::Buffering
        );
        assert_eq!(
            proxy.accumulate_body(&mut ctx, Some(Bytes::from(vec![b'a'; 100])), false, None, None),
            BodyProgress::Blocked
        );
        assert_eq!(ctx.outcome, Some(GateOutcome::BodyTooLarge));
        assert!(!ctx.inspected);
        assert_eq!(proxy.gate.check_admission("5.6.7.8"), Admission::Admit);
    }

    #[test]
    fn test_has_body() {
        let mut request = RequestHeader::build("POST", b"/api", None).unwrap();
        assert!(!has_body(&request));
        request.insert_header("Content-Length", "0").unwrap();
        assert!(!has_body(&request));
        request.insert_header("Content-Length", "12").unwrap();
        assert!(has_body(&request));

        let mut chunked = RequestHeader::build("POST", b"/api", None).unwrap();
        chunked.insert_header("Transfer-Encoding", "chunked").unwrap();
        assert!(has_body(&chunked));
    }
}
