//! Target selector resolution against the roster.

use armada_protocol::{Node, NodeStatus, TargetSelector};
use std::collections::HashSet;

fn eligible(node: &Node) -> bool {
    matches!(node.status, NodeStatus::Online | NodeStatus::Degraded)
}

/// Resolve a selector against the full roster.
///
/// Online and degraded nodes are eligible; offline, draining and unreachable
/// nodes are excluded unless explicitly named by id. Label match is
/// conjunctive, results are de-duplicated by id, and ordering is stable by
/// `registered_at`. `max_nodes` (0 = unlimited) caps the result.
pub fn resolve_targets(selector: &TargetSelector, roster: &[Node]) -> Vec<Node> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut targets: Vec<Node> = Vec::new();

    for node in roster {
        if seen.contains(node.id.as_str()) {
            continue;
        }
        let named = selector.node_ids.iter().any(|id| id == &node.id);
        let matched = if named {
            // Explicitly named nodes are eligible regardless of status.
            true
        } else if !eligible(node) {
            false
        } else if selector.all {
            true
        } else {
            let by_group = selector.groups.iter().any(|g| node.in_group(g));
            let by_labels = !selector.labels.is_empty() && node.matches_labels(&selector.labels);
            by_group || by_labels
        };

        if matched {
            seen.insert(node.id.as_str());
            targets.push(node.clone());
        }
    }

    targets.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.id.cmp(&b.id)));

    if selector.max_nodes > 0 && targets.len() > selector.max_nodes {
        targets.truncate(selector.max_nodes);
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn node(id: &str, status: NodeStatus, labels: &[(&str, &str)], minutes_ago: i64) -> Node {
        let mut n = Node::new(id, format!("host-{}", id), "10.0.0.1:1");
        n.status = status;
        n.labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        n.registered_at = Utc::now() - Duration::minutes(minutes_ago);
        n
    }

    #[test]
    fn label_targeting_excludes_offline_nodes() {
        let roster = vec![
            node("n1", NodeStatus::Online, &[("env", "prod"), ("role", "web")], 30),
            node("n2", NodeStatus::Online, &[("env", "prod"), ("role", "api")], 20),
            node("n3", NodeStatus::Offline, &[("env", "prod"), ("role", "web")], 10),
        ];
        let selector = TargetSelector::labels([("env", "prod"), ("role", "web")]);
        let targets = resolve_targets(&selector, &roster);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id, "n1");
    }

    #[test]
    fn resolution_is_a_subset_of_the_roster() {
        let roster = vec![
            node("a", NodeStatus::Online, &[], 5),
            node("b", NodeStatus::Degraded, &[], 4),
            node("c", NodeStatus::Draining, &[], 3),
            node("d", NodeStatus::Unreachable, &[], 2),
        ];
        let targets = resolve_targets(&TargetSelector::all(), &roster);
        let ids: Vec<&str> = targets.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        for t in &targets {
            assert!(roster.iter().any(|n| n.id == t.id));
        }
    }

    #[test]
    fn explicitly_named_nodes_bypass_status_filtering() {
        let roster = vec![
            node("down", NodeStatus::Offline, &[], 10),
            node("up", NodeStatus::Online, &[], 5),
        ];
        let targets = resolve_targets(&TargetSelector::ids(["down"]), &roster);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id, "down");
    }

    #[test]
    fn results_are_deduplicated_and_ordered_by_registration() {
        let mut selector = TargetSelector::ids(["b", "a"]);
        selector.groups = vec!["web".into()];
        let mut a = node("a", NodeStatus::Online, &[], 10);
        a.groups.push("web".into());
        let b = node("b", NodeStatus::Online, &[], 20);
        let roster = vec![a, b];

        let targets = resolve_targets(&selector, &roster);
        let ids: Vec<&str> = targets.iter().map(|n| n.id.as_str()).collect();
        // b registered earlier, each node appears once.
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn max_nodes_caps_the_resolution() {
        let roster: Vec<Node> = (0..5)
            .map(|i| node(&format!("n{}", i), NodeStatus::Online, &[], 10 - i))
            .collect();
        let mut selector = TargetSelector::all();
        selector.max_nodes = 2;
        let targets = resolve_targets(&selector, &roster);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].id, "n0");
    }

    #[test]
    fn empty_selector_resolves_nothing() {
        let roster = vec![node("n1", NodeStatus::Online, &[], 1)];
        let targets = resolve_targets(&TargetSelector::default(), &roster);
        assert!(targets.is_empty());
    }
}
