//! Causal call tree assembly from a flat event list.
//!
//! Events reference their parent by stable id, so the tree can be rebuilt from
//! any store ordering. Events spanning several sessions (a delegation and the
//! subagent work it spawned) link through `parent_event_id`.

use std::collections::{HashMap, HashSet};

use crate::core::types::Event;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallNode {
    pub event: Event,
    pub children: Vec<CallNode>,
}

impl CallNode {
    /// Number of events in this subtree, including this one.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(CallNode::size).sum::<usize>()
    }
}

/// Build the forest of calls. Roots are events without a known parent.
///
/// Children are ordered by start time, then id. Self-references and cycles
/// are broken so every event appears exactly once.
pub fn build_call_tree(events: &[Event]) -> Vec<CallNode> {
    let mut order: Vec<usize> = (0..events.len()).collect();
    order.sort_by(|&a, &b| {
        events[a]
            .start_time
            .cmp(&events[b].start_time)
            .then_with(|| events[a].event_id.cmp(&events[b].event_id))
    });

    let known: HashSet<&str> = events.iter().map(|e| e.event_id.as_str()).collect();
    let mut children: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut roots = Vec::new();
    for &idx in &order {
        let event = &events[idx];
        match event.parent_event_id.as_deref() {
            Some(parent) if parent != event.event_id && known.contains(parent) => {
                children.entry(parent).or_default().push(idx);
            }
            _ => roots.push(idx),
        }
    }

    let mut visited = HashSet::new();
    let mut forest: Vec<CallNode> = roots
        .into_iter()
        .filter_map(|idx| build_node(idx, events, &children, &mut visited))
        .collect();

    // Anything not reached sits on a parent cycle; surface it as a root.
    for &idx in &order {
        if let Some(node) = build_node(idx, events, &children, &mut visited) {
            forest.push(node);
        }
    }
    forest
}

fn build_node(
    idx: usize,
    events: &[Event],
    children: &HashMap<&str, Vec<usize>>,
    visited: &mut HashSet<usize>,
) -> Option<CallNode> {
    if !visited.insert(idx) {
        return None;
    }
    let event = &events[idx];
    let kids = children
        .get(event.event_id.as_str())
        .map(|list| {
            list.iter()
                .filter_map(|&child| build_node(child, events, children, visited))
                .collect()
        })
        .unwrap_or_default();
    Some(CallNode {
        event: event.clone(),
        children: kids,
    })
}

/// Render the forest as an indented outline, one event per line.
pub fn render_tree(roots: &[CallNode]) -> String {
    let mut out = String::new();
    for root in roots {
        render_node(root, 0, &mut out);
    }
    out
}

fn render_node(node: &CallNode, depth: usize, out: &mut String) {
    let event = &node.event;
    let duration = event
        .duration_ms
        .map(|ms| format!("{ms}ms"))
        .unwrap_or_else(|| "-".to_string());
    out.push_str(&format!(
        "{}- {} [{}] {} session={} id={}\n",
        "  ".repeat(depth),
        event.tool_name,
        event.status.as_str(),
        duration,
        event.session_id,
        event.event_id,
    ));
    for child in &node.children {
        render_node(child, depth + 1, out);
    }
}
