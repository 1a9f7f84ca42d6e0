use crate::waf::BodyInspector;

/// Why the gate stopped a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Origin was banned before this request.
    AlreadyBanned,
    /// This request's payload got the origin banned.
    Banned { rule_id: String, excerpt: String },
    /// Body larger than the proxy buffers.
    BodyTooLarge,
}

pub struct GateContext {
    pub origin_id: String,
    pub body_inspector: BodyInspector,
    pub outcome: Option<GateOutcome>,
    /// Payload already classified for this request.
    pub inspected: bool,
}

impl GateContext {
    pub fn new(max_body_size: usize) -> Self {
        Self {
            origin_id: String::new(),
            body_inspector: BodyInspector::new(max_body_size),
            outcome: None,
            inspected: false,
        }
    }

    pub fn blocked(&self) -> bool {
        self.outcome.is_some()
    }
}
