//! The governance pipeline: ordered category evaluation.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use shoal_core::governance::{
    GovernanceEnvelope, GovernanceFlow, GovernanceReject, GovernanceResult, Governor,
};
use tracing::{debug, warn};

use crate::proto::{PluginCategory, PluginDecision, PluginFlow};
use crate::PluginError;

/// Default human message for a denial that supplies none.
const DEFAULT_REJECT_MESSAGE: &str = "request rejected";

/// The channel a slot evaluates over. Implemented by the out-of-process
/// [`crate::host::PluginHost`] and by in-memory fakes in tests.
#[async_trait]
pub trait PluginEndpoint: Send + Sync {
    /// Evaluate one flow.
    async fn handle(
        &self,
        flow: PluginFlow,
        envelope: &GovernanceEnvelope,
    ) -> Result<PluginDecision, PluginError>;

    /// Flows this endpoint participates in.
    fn flows(&self) -> &[PluginFlow];
}

/// One slot in the pipeline.
pub struct PluginSlot {
    /// Plugin name; slots within a category evaluate in name order.
    pub name: String,
    /// Category controlling position and semantics.
    pub category: PluginCategory,
    /// Whether failures of this slot block the request path.
    pub required: bool,
    /// The evaluation channel.
    pub endpoint: Arc<dyn PluginEndpoint>,
}

/// Ordered chain of plugin slots.
pub struct GovernancePipeline {
    slots: Vec<PluginSlot>,
}

impl GovernancePipeline {
    /// Build a pipeline; slots are ordered by category, then name.
    pub fn new(mut slots: Vec<PluginSlot>) -> Self {
        slots.sort_by(|a, b| {
            let pos = |c: PluginCategory| {
                PluginCategory::ORDER.iter().position(|x| *x == c).unwrap_or(usize::MAX)
            };
            pos(a.category)
                .cmp(&pos(b.category))
                .then_with(|| a.name.cmp(&b.name))
        });
        Self { slots }
    }

    /// Launch hosts for every configured plugin and build the pipeline.
    #[cfg(unix)]
    pub async fn start(
        plugins: Vec<shoal_core::config::PluginSpec>,
        socket_dir: &std::path::Path,
    ) -> Result<Self, PluginError> {
        let mut slots = Vec::new();
        for spec in plugins {
            let Some(category) = PluginCategory::parse(&spec.category) else {
                return Err(PluginError::handshake(
                    &spec.name,
                    format!("unknown category '{}'", spec.category),
                ));
            };
            let name = spec.name.clone();
            let required = spec.required;
            let host = crate::host::PluginHost::start(spec, socket_dir).await?;
            slots.push(PluginSlot {
                name,
                category,
                required,
                endpoint: Arc::new(host) as Arc<dyn PluginEndpoint>,
            });
        }
        Ok(Self::new(slots))
    }

    fn flow_matches(slot: &PluginSlot, flow: PluginFlow) -> bool {
        slot.endpoint.flows().contains(&flow)
    }

    async fn evaluate(
        &self,
        flow: PluginFlow,
        mut envelope: GovernanceEnvelope,
    ) -> GovernanceResult {
        for category in PluginCategory::ORDER {
            let slots: Vec<&PluginSlot> = self
                .slots
                .iter()
                .filter(|s| s.category == category && Self::flow_matches(s, flow))
                .collect();
            if slots.is_empty() {
                continue;
            }

            if category == PluginCategory::Observability {
                self.evaluate_observability(flow, &envelope, &slots).await?;
                continue;
            }

            for slot in slots {
                match slot.endpoint.handle(flow, &envelope).await {
                    Ok(decision) => {
                        if !decision.continue_ {
                            return Err(reject_from(&decision, category));
                        }
                        apply_mutations(&mut envelope, decision, slot, category);
                    }
                    Err(err) if slot.required => {
                        warn!(plugin = %slot.name, error = %err, "required plugin unavailable");
                        return Err(GovernanceReject {
                            code: "unavailable".to_string(),
                            message: format!("required plugin '{}' is unavailable", slot.name),
                        });
                    }
                    Err(err) => {
                        debug!(plugin = %slot.name, error = %err, "optional plugin skipped");
                    }
                }
            }
        }
        Ok(envelope)
    }

    /// Observability slots run in parallel; a denial is honored only when
    /// the plugin is required, and errors from optional plugins are
    /// swallowed.
    async fn evaluate_observability(
        &self,
        flow: PluginFlow,
        envelope: &GovernanceEnvelope,
        slots: &[&PluginSlot],
    ) -> Result<(), GovernanceReject> {
        let results = join_all(
            slots
                .iter()
                .map(|slot| async move { (*slot, slot.endpoint.handle(flow, envelope).await) }),
        )
        .await;
        for (slot, result) in results {
            match result {
                Ok(decision) => {
                    if !decision.continue_ && slot.required {
                        return Err(reject_from(&decision, PluginCategory::Observability));
                    }
                    if decision.request_json.is_some() || decision.response_json.is_some() {
                        warn!(plugin = %slot.name, "ignoring mutation from observability plugin");
                    }
                }
                Err(err) if slot.required => {
                    warn!(plugin = %slot.name, error = %err, "required observability plugin unavailable");
                    return Err(GovernanceReject {
                        code: "unavailable".to_string(),
                        message: format!("required plugin '{}' is unavailable", slot.name),
                    });
                }
                Err(err) => {
                    debug!(plugin = %slot.name, error = %err, "observability plugin error swallowed");
                }
            }
        }
        Ok(())
    }

}

fn reject_from(decision: &PluginDecision, category: PluginCategory) -> GovernanceReject {
    GovernanceReject {
        code: decision
            .reject_code
            .clone()
            .unwrap_or_else(|| category.default_reject_code().to_string()),
        message: decision
            .reject_message
            .clone()
            .unwrap_or_else(|| DEFAULT_REJECT_MESSAGE.to_string()),
    }
}

fn apply_mutations(
    envelope: &mut GovernanceEnvelope,
    decision: PluginDecision,
    slot: &PluginSlot,
    category: PluginCategory,
) {
    let has_mutation = decision.request_json.is_some() || decision.response_json.is_some();
    if !has_mutation {
        return;
    }
    if !category.may_mutate() {
        warn!(plugin = %slot.name, category = ?category, "ignoring mutation from non-content plugin");
        return;
    }
    if let Some(request) = decision.request_json {
        envelope.request_json = request;
    }
    if let Some(response) = decision.response_json {
        envelope.response_json = Some(response);
    }
}

#[async_trait]
impl Governor for GovernancePipeline {
    async fn check_request(&self, envelope: GovernanceEnvelope) -> GovernanceResult {
        debug_assert!(matches!(envelope.flow, GovernanceFlow::Request));
        self.evaluate(PluginFlow::Request, envelope).await
    }

    async fn check_response(&self, envelope: GovernanceEnvelope) -> GovernanceResult {
        debug_assert!(matches!(envelope.flow, GovernanceFlow::Response));
        self.evaluate(PluginFlow::Response, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        name: &'static str,
        flows: Vec<PluginFlow>,
        decision: PluginDecision,
        fail: bool,
        order_log: Option<Arc<Mutex<Vec<&'static str>>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn allow(name: &'static str) -> Self {
            Self {
                name,
                flows: vec![PluginFlow::Request, PluginFlow::Response],
                decision: PluginDecision::allow(),
                fail: false,
                order_log: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn with_decision(mut self, decision: PluginDecision) -> Self {
            self.decision = decision;
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn logged(mut self, log: Arc<Mutex<Vec<&'static str>>>) -> Self {
            self.order_log = Some(log);
            self
        }
    }

    #[async_trait]
    impl PluginEndpoint for Scripted {
        async fn handle(
            &self,
            _flow: PluginFlow,
            _envelope: &GovernanceEnvelope,
        ) -> Result<PluginDecision, PluginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(log) = &self.order_log {
                log.lock().unwrap().push(self.name);
            }
            if self.fail {
                return Err(PluginError::unavailable(self.name));
            }
            Ok(self.decision.clone())
        }

        fn flows(&self) -> &[PluginFlow] {
            &self.flows
        }
    }

    fn slot(
        name: &'static str,
        category: PluginCategory,
        required: bool,
        scripted: Scripted,
    ) -> PluginSlot {
        PluginSlot {
            name: name.to_string(),
            category,
            required,
            endpoint: Arc::new(scripted),
        }
    }

    fn envelope() -> GovernanceEnvelope {
        GovernanceEnvelope {
            flow: GovernanceFlow::Request,
            method: "tools/call".into(),
            tool_name: Some("alpha__echo".into()),
            metadata: Default::default(),
            request_json: serde_json::json!({"msg": "hi"}),
            response_json: None,
        }
    }

    #[tokio::test]
    async fn categories_evaluate_in_fixed_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = GovernancePipeline::new(vec![
            slot(
                "audit",
                PluginCategory::Audit,
                false,
                Scripted::allow("audit").logged(Arc::clone(&log)),
            ),
            slot(
                "authn",
                PluginCategory::Authentication,
                false,
                Scripted::allow("authn").logged(Arc::clone(&log)),
            ),
            slot(
                "authz",
                PluginCategory::Authorization,
                false,
                Scripted::allow("authz").logged(Arc::clone(&log)),
            ),
        ]);
        pipeline.check_request(envelope()).await.unwrap();
        assert_eq!(&*log.lock().unwrap(), &["authn", "authz", "audit"]);
    }

    #[tokio::test]
    async fn denial_uses_category_default_code() {
        let pipeline = GovernancePipeline::new(vec![slot(
            "authz",
            PluginCategory::Authorization,
            true,
            Scripted::allow("authz").with_decision(PluginDecision {
                continue_: false,
                reject_code: None,
                reject_message: None,
                request_json: None,
                response_json: None,
            }),
        )]);
        let reject = pipeline.check_request(envelope()).await.unwrap_err();
        assert_eq!(reject.code, "unauthorized");
        assert_eq!(reject.message, "request rejected");
    }

    #[tokio::test]
    async fn plugin_supplied_code_wins() {
        let pipeline = GovernancePipeline::new(vec![slot(
            "authz",
            PluginCategory::Authorization,
            true,
            Scripted::allow("authz")
                .with_decision(PluginDecision::deny("unauthorized", "admin tools only")),
        )]);
        let reject = pipeline.check_request(envelope()).await.unwrap_err();
        assert_eq!(reject.code, "unauthorized");
        assert_eq!(reject.message, "admin tools only");
    }

    #[tokio::test]
    async fn content_mutations_carry_forward() {
        let mutated = serde_json::json!({"msg": "redacted"});
        let pipeline = GovernancePipeline::new(vec![slot(
            "redact",
            PluginCategory::Content,
            false,
            Scripted::allow("redact").with_decision(PluginDecision {
                continue_: true,
                reject_code: None,
                reject_message: None,
                request_json: Some(mutated.clone()),
                response_json: None,
            }),
        )]);
        let out = pipeline.check_request(envelope()).await.unwrap();
        assert_eq!(out.request_json, mutated);
    }

    #[tokio::test]
    async fn non_content_mutations_are_ignored() {
        let pipeline = GovernancePipeline::new(vec![slot(
            "validator",
            PluginCategory::Validation,
            false,
            Scripted::allow("validator").with_decision(PluginDecision {
                continue_: true,
                reject_code: None,
                reject_message: None,
                request_json: Some(serde_json::json!({"msg": "tampered"})),
                response_json: None,
            }),
        )]);
        let out = pipeline.check_request(envelope()).await.unwrap();
        assert_eq!(out.request_json, serde_json::json!({"msg": "hi"}));
    }

    #[tokio::test]
    async fn optional_failure_continues_required_failure_blocks() {
        let pipeline = GovernancePipeline::new(vec![slot(
            "flaky",
            PluginCategory::Validation,
            false,
            Scripted::allow("flaky").failing(),
        )]);
        assert!(pipeline.check_request(envelope()).await.is_ok());

        let pipeline = GovernancePipeline::new(vec![slot(
            "gate",
            PluginCategory::Authorization,
            true,
            Scripted::allow("gate").failing(),
        )]);
        let reject = pipeline.check_request(envelope()).await.unwrap_err();
        assert_eq!(reject.code, "unavailable");
    }

    #[tokio::test]
    async fn optional_observability_denial_is_ignored() {
        let pipeline = GovernancePipeline::new(vec![slot(
            "metrics",
            PluginCategory::Observability,
            false,
            Scripted::allow("metrics").with_decision(PluginDecision::deny("rejected", "no")),
        )]);
        assert!(pipeline.check_request(envelope()).await.is_ok());
    }
}
