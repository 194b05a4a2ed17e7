//! Cluster membership view.

use {
    crate::node_id_set::NodeIdSet,
    serde::{Deserialize, Serialize},
};

/// A set of node ids plus whether that membership has settled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    members: NodeIdSet,
    stable: bool,
}

impl View {
    pub fn new(members: NodeIdSet, stable: bool) -> Self {
        Self { members, stable }
    }

    pub fn members(&self) -> &NodeIdSet {
        &self.members
    }

    pub fn is_stable(&self) -> bool {
        self.stable
    }

    pub fn set_stable(&mut self, stable: bool) {
        self.stable = stable;
    }

    pub fn contains(&self, id: u16) -> bool {
        self.members.contains(id)
    }

    pub fn cardinality(&self) -> usize {
        self.members.cardinality()
    }

    /// Same members, ignoring stability.
    pub fn same_members(&self, other: &View) -> bool {
        self.members == other.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_members_ignores_stability() {
        let members: NodeIdSet = [1u16, 2, 3].into_iter().collect();
        let settled = View::new(members.clone(), true);
        let unsettled = View::new(members, false);
        assert!(settled.same_members(&unsettled));
        assert_ne!(settled, unsettled);
        assert!(settled.contains(2));
        assert_eq!(settled.cardinality(), 3);
    }
}
