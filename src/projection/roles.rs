use std::collections::BTreeSet;

use crate::model::GroupNode;

/// Indices into a group's children that the caller may see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibleChildren {
    /// Attribute statics, written first.
    pub attributes: Vec<usize>,
    /// Everything else, in declaration order.
    pub elements: Vec<usize>,
}

impl VisibleChildren {
    pub fn len(&self) -> usize {
        self.attributes.len() + self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A node with no required roles is always visible; otherwise the caller
/// needs at least one of them.
pub fn is_visible(required: &BTreeSet<String>, roles: &BTreeSet<String>) -> bool {
    required.is_empty() || !required.is_disjoint(roles)
}

pub fn filter_children(group: &GroupNode, roles: &BTreeSet<String>) -> VisibleChildren {
    let mut visible = VisibleChildren::default();
    for (idx, child) in group.children.iter().enumerate() {
        if !is_visible(child.required_roles(), roles) {
            continue;
        }
        if child.is_attribute() {
            visible.attributes.push(idx);
        } else {
            visible.elements.push(idx);
        }
    }
    visible
}
