//! AN-016: Drift detection — compare live provider ids to the snapshot.
//!
//! Every node the snapshot records as provisioned is described again with its
//! resolved parameters. A resource the provider no longer has, or one that now
//! answers with a different id, is a finding.

use crate::adapter::{AdapterRegistry, ResourceAdapter};
use crate::core::resolver::resolve_parameters;
use crate::core::types::{Parameters, PlanSnapshot, ProvenanceEvent, ResourceNode};
use std::collections::HashMap;
use std::time::Duration;

/// A single drift finding.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftFinding {
    pub resource_id: String,
    pub kind: String,
    pub expected_id: String,
    pub actual_id: String,
    pub detail: String,
}

impl DriftFinding {
    fn new(node: &ResourceNode, expected: &str, actual: String, detail: String) -> Self {
        Self {
            resource_id: node.spec.id.clone(),
            kind: node.spec.kind.clone(),
            expected_id: expected.to_string(),
            actual_id: actual,
            detail,
        }
    }
}

/// Describe one provisioned node and compare against its recorded id.
pub async fn check_node_drift(
    adapter: &dyn ResourceAdapter,
    node: &ResourceNode,
    expected_id: &str,
    params: &Parameters,
    limit: Duration,
) -> Option<DriftFinding> {
    let described = match tokio::time::timeout(limit, adapter.describe(params)).await {
        Ok(result) => result,
        Err(_) => {
            return Some(DriftFinding::new(
                node,
                expected_id,
                "ERROR:timeout".to_string(),
                format!("describe timed out after {}ms", limit.as_millis()),
            ))
        }
    };
    match described {
        Ok(Some(actual)) if actual == expected_id => None,
        Ok(Some(actual)) => Some(DriftFinding::new(
            node,
            expected_id,
            actual.clone(),
            format!("provider reports {} instead of {}", actual, expected_id),
        )),
        Ok(None) => Some(DriftFinding::new(
            node,
            expected_id,
            "MISSING".to_string(),
            format!("{} no longer exists", expected_id),
        )),
        Err(e) => Some(DriftFinding::new(
            node,
            expected_id,
            format!("ERROR:{}", e.message()),
            e.to_string(),
        )),
    }
}

/// Check every provisioned node in a snapshot, in plan order.
pub async fn detect_drift(
    snapshot: &PlanSnapshot,
    params: &HashMap<String, serde_yaml_ng::Value>,
    registry: &AdapterRegistry,
    limit: Duration,
) -> Vec<DriftFinding> {
    let mut findings = Vec::new();
    let external_id = |id: &str| snapshot.nodes.get(id).and_then(|n| n.external_id.clone());

    for node in snapshot.nodes.values() {
        if !node.state.is_success() {
            continue;
        }
        let Some(expected) = node.external_id.as_deref() else {
            continue;
        };
        let Some(adapter) = registry.get(&node.spec.kind) else {
            tracing::warn!(node = %node.spec.id, kind = %node.spec.kind, "no adapter, skipping drift check");
            continue;
        };
        let resolved = match resolve_parameters(&node.spec.parameters, params, &external_id) {
            Ok(p) => p,
            Err(e) => {
                findings.push(DriftFinding::new(node, expected, "ERROR:template".to_string(), e));
                continue;
            }
        };
        if let Some(finding) =
            check_node_drift(adapter.as_ref(), node, expected, &resolved, limit).await
        {
            tracing::warn!(node = %finding.resource_id, detail = %finding.detail, "drift");
            findings.push(finding);
        }
    }

    findings
}

/// Event log entries for a set of findings.
pub fn drift_events(plan: &str, findings: &[DriftFinding]) -> Vec<ProvenanceEvent> {
    findings
        .iter()
        .map(|f| ProvenanceEvent::DriftDetected {
            plan: plan.to_string(),
            node: f.resource_id.clone(),
            expected_id: f.expected_id.clone(),
            actual_id: f.actual_id.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::MockAdapter;
    use crate::adapter::AdapterError;
    use crate::core::planner::Plan;
    use crate::core::types::{NodeState, ResourceSpec};
    use std::sync::Arc;

    const LIMIT: Duration = Duration::from_secs(5);

    fn snapshot(states: &[(&str, NodeState, Option<&str>)]) -> PlanSnapshot {
        let specs = states
            .iter()
            .map(|(id, _, _)| ResourceSpec::new(id, "mock").param("name", id))
            .collect();
        let plan = Plan::build("stack", specs, HashMap::new(), None).unwrap();
        let mut snap = plan.state().snapshot();
        for (id, state, ext) in states {
            let node = &mut snap.nodes[*id];
            node.state = *state;
            node.external_id = ext.map(str::to_string);
        }
        snap
    }

    fn registry(mock: MockAdapter) -> AdapterRegistry {
        let mut r = AdapterRegistry::new();
        r.register("mock", Arc::new(mock));
        r
    }

    #[tokio::test]
    async fn test_an016_no_drift() {
        let snap = snapshot(&[("sg", NodeState::Created, Some("sg-1"))]);
        let reg = registry(MockAdapter::new().with_existing("sg", "sg-1"));
        assert!(detect_drift(&snap, &HashMap::new(), &reg, LIMIT).await.is_empty());
    }

    #[tokio::test]
    async fn test_an016_missing_resource() {
        let snap = snapshot(&[("sg", NodeState::AlreadyExists, Some("sg-1"))]);
        let findings = detect_drift(&snap, &HashMap::new(), &registry(MockAdapter::new()), LIMIT).await;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].actual_id, "MISSING");
        assert_eq!(findings[0].expected_id, "sg-1");
        assert_eq!(findings[0].kind, "mock");
    }

    #[tokio::test]
    async fn test_an016_replaced_resource() {
        let snap = snapshot(&[("sg", NodeState::Created, Some("sg-1"))]);
        let reg = registry(MockAdapter::new().with_existing("sg", "sg-2"));
        let findings = detect_drift(&snap, &HashMap::new(), &reg, LIMIT).await;
        assert_eq!(findings[0].actual_id, "sg-2");
        assert!(findings[0].detail.contains("instead of"));
    }

    #[tokio::test]
    async fn test_an016_skips_unprovisioned_nodes() {
        let snap = snapshot(&[
            ("a", NodeState::PermanentFailure, Some("a-1")),
            ("b", NodeState::Blocked, None),
            ("c", NodeState::Deleted, None),
        ]);
        let mock = Arc::new(MockAdapter::new());
        let mut reg = AdapterRegistry::new();
        reg.register("mock", mock.clone());
        assert!(detect_drift(&snap, &HashMap::new(), &reg, LIMIT).await.is_empty());
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_an016_describe_error_is_a_finding() {
        let snap = snapshot(&[("sg", NodeState::Created, Some("sg-1"))]);
        let reg = registry(
            MockAdapter::new().on_describe("sg", vec![Err(AdapterError::Permanent("denied".into()))]),
        );
        let findings = detect_drift(&snap, &HashMap::new(), &reg, LIMIT).await;
        assert_eq!(findings[0].actual_id, "ERROR:denied");
    }

    #[tokio::test]
    async fn test_an016_describe_timeout() {
        let snap = snapshot(&[("sg", NodeState::Created, Some("sg-1"))]);
        let reg = registry(MockAdapter::new().with_delay(Duration::from_millis(200)));
        let findings = detect_drift(&snap, &HashMap::new(), &reg, Duration::from_millis(10)).await;
        assert!(findings[0].detail.contains("timed out"));
    }

    #[test]
    fn test_an016_drift_events() {
        let finding = DriftFinding {
            resource_id: "sg".into(),
            kind: "security_group".into(),
            expected_id: "sg-1".into(),
            actual_id: "MISSING".into(),
            detail: String::new(),
        };
        let events = drift_events("stack", &[finding]);
        assert!(matches!(
            &events[0],
            ProvenanceEvent::DriftDetected { node, actual_id, .. } if node == "sg" && actual_id == "MISSING"
        ));
    }
}
