//! Boundary-node management: which nodes are shared with which peer ranks,
//! and under what (rank, id) each peer knows them.
//!
//! This type owns the local bookkeeping only. The collective drivers that
//! exchange the pair lists built here live on the zone, which holds the
//! communicator.

use std::collections::BTreeMap;
use std::rc::Rc;

use itertools::Itertools;

use crate::ids::{GlobalRankId, GlobalRankIdPair, GlobalRankIdPairList, LocalId, RankNo};
use crate::model::node::NodeRef;

#[derive(Debug, Default)]
pub struct RankConnectivity {
    /// Nodes with a non-empty mpi-rank list. Non-owning: the grid owns the
    /// nodes, this container shares handles.
    boundary_nodes: Vec<NodeRef>,
    /// (peer rank, peer id) → local node, sorted by key. Built on demand,
    /// cleared whenever boundary information changes.
    search_table: Vec<(GlobalRankId, NodeRef)>,
    my_rankno: RankNo,
}

impl RankConnectivity {
    pub fn new() -> Self {
        RankConnectivity::default()
    }

    pub fn my_rankno(&self) -> RankNo {
        self.my_rankno
    }

    pub fn set_my_rankno(&mut self, rankno: RankNo) {
        self.my_rankno = rankno;
    }

    pub fn num_boundary_nodes(&self) -> usize {
        self.boundary_nodes.len()
    }

    pub fn boundary_nodes(&self) -> &[NodeRef] {
        &self.boundary_nodes
    }

    pub fn is_boundary_node(&self, node: &NodeRef) -> bool {
        self.boundary_nodes.iter().any(|n| Rc::ptr_eq(n, node))
    }

    /// Register a boundary node. Duplicate handles are ignored.
    pub fn insert_node(&mut self, node: NodeRef) -> usize {
        if !self.is_boundary_node(&node) {
            self.boundary_nodes.push(node);
            self.clear_search_table();
        }
        self.boundary_nodes.len()
    }

    pub fn remove_boundary_node(&mut self, node: &NodeRef) {
        self.boundary_nodes.retain(|n| !Rc::ptr_eq(n, node));
        self.clear_search_table();
    }

    pub fn remove_boundary_nodes(&mut self, nodes: &[NodeRef]) {
        for node in nodes {
            self.boundary_nodes.retain(|n| !Rc::ptr_eq(n, node));
        }
        self.clear_search_table();
    }

    pub fn clear(&mut self) {
        self.boundary_nodes.clear();
        self.clear_search_table();
    }

    /// Clear the mpi-rank lists of every boundary node and empty the set.
    pub fn clear_mpi_rankinfos(&mut self) {
        for node in &self.boundary_nodes {
            node.borrow_mut().entity.clear_mpi_rankinfos();
        }
        self.clear();
    }

    pub fn sort_boundary_nodes(&mut self) {
        self.boundary_nodes
            .sort_by_key(|n| n.borrow().entity.global_id());
        self.boundary_nodes
            .dedup_by(|a, b| Rc::ptr_eq(a, b));
    }

    // --- search table ------------------------------------------------------

    pub fn clear_search_table(&mut self) {
        self.search_table.clear();
    }

    /// Build the (peer rank, peer id) → node table from the current
    /// mpi-rank lists.
    pub fn create_search_table(&mut self) {
        self.search_table.clear();
        for node in &self.boundary_nodes {
            let infos: Vec<GlobalRankId> =
                node.borrow().entity.mpi_rankinfos().iter().copied().collect();
            for info in infos {
                self.search_table.push((info, Rc::clone(node)));
            }
        }
        self.search_table.sort_by_key(|(key, _)| *key);
        self.search_table.dedup_by_key(|(key, _)| *key);
    }

    /// Local node known to peer `rankno` as `localid`. Uses the search
    /// table when built, otherwise scans the boundary set.
    pub fn find_mpi_rankinfo(&self, rankno: RankNo, localid: LocalId) -> Option<NodeRef> {
        let key = GlobalRankId::new(rankno, localid);
        if !self.search_table.is_empty() {
            let pos = self.search_table.partition_point(|(k, _)| *k < key);
            return match self.search_table.get(pos) {
                Some((k, node)) if *k == key => Some(Rc::clone(node)),
                _ => None,
            };
        }
        self.boundary_nodes
            .iter()
            .find(|n| n.borrow().entity.exists_mpi_rankinfo(rankno, localid))
            .cloned()
    }

    /// Node matching any identity of `src`: its current global id or one of
    /// its mpi entries.
    pub fn find_node_like(&self, src: &NodeRef) -> Option<NodeRef> {
        let gid = src.borrow().entity.global_id();
        if let Some(found) = self.find_mpi_rankinfo(gid.rankno, gid.localid) {
            return Some(found);
        }
        let infos: Vec<GlobalRankId> =
            src.borrow().entity.mpi_rankinfos().iter().copied().collect();
        for info in infos {
            if let Some(found) = self.find_mpi_rankinfo(info.rankno, info.localid) {
                return Some(found);
            }
        }
        None
    }

    /// Boundary nodes owned by this rank or a higher one; shared nodes are
    /// counted once job-wide by attributing them to the lowest rank.
    pub fn num_nodes_without_less_rankno(&self) -> usize {
        self.boundary_nodes
            .iter()
            .filter(|n| {
                let entity = &n.borrow().entity;
                !entity
                    .mpi_rankinfos()
                    .iter()
                    .any(|info| info.rankno < self.my_rankno && info.rankno >= 0)
            })
            .count()
    }

    // --- pair-list construction --------------------------------------------

    /// Migration round: for every boundary node, one pair per foreign mpi
    /// entry, addressed to that peer: (my current id → the id the peer is
    /// expected to know).
    pub fn build_boundary_pairs(&self) -> BTreeMap<RankNo, GlobalRankIdPairList> {
        let mut pairs: BTreeMap<RankNo, GlobalRankIdPairList> = BTreeMap::new();
        for node in &self.boundary_nodes {
            let gid = node.borrow().entity.global_id();
            let infos: Vec<GlobalRankId> =
                node.borrow().entity.mpi_rankinfos().iter().copied().collect();
            for info in infos {
                if info.rankno == self.my_rankno || info.rankno < 0 {
                    continue;
                }
                pairs
                    .entry(info.rankno)
                    .or_default()
                    .push_back(GlobalRankIdPair::new(gid, info));
            }
        }
        pairs
    }

    /// Id-propagation round: every (previous → current) identity of every
    /// boundary node, published to each foreign peer rank in its mpi list.
    pub fn build_updated_id_pairs(&self) -> BTreeMap<RankNo, GlobalRankIdPairList> {
        let mut pairs: BTreeMap<RankNo, GlobalRankIdPairList> = BTreeMap::new();
        for node in &self.boundary_nodes {
            let gid = node.borrow().entity.global_id();
            let previous: Vec<GlobalRankId> = node
                .borrow()
                .entity
                .previous_rankinfos()
                .iter()
                .copied()
                .collect();
            if previous.is_empty() {
                continue;
            }
            let peers: Vec<RankNo> = node
                .borrow()
                .entity
                .mpi_rankinfos()
                .iter()
                .map(|info| info.rankno)
                .filter(|&r| r != self.my_rankno && r >= 0)
                .unique()
                .collect();
            for peer in peers {
                let list = pairs.entry(peer).or_default();
                for prev in &previous {
                    list.push_back(GlobalRankIdPair::new(gid, *prev));
                }
            }
        }
        pairs
    }

    /// Drop invalid and self-referencing mpi entries everywhere, then drop
    /// nodes whose lists became empty. They stay in the grid; they are no
    /// longer boundary nodes.
    pub fn erase_rank_connectivity(&mut self) {
        for node in &self.boundary_nodes {
            node.borrow_mut().entity.erase_invalid_mpi_rankinfos();
        }
        self.drop_empty_boundary_nodes();
    }

    /// Remove nodes with empty mpi lists from the boundary set.
    pub fn drop_empty_boundary_nodes(&mut self) {
        self.boundary_nodes
            .retain(|n| n.borrow().entity.num_mpi_rankinfos() > 0);
        self.clear_search_table();
    }

    /// Symmetry hook for validation: every boundary node must carry a
    /// non-empty mpi list, and the boundary set must hold it exactly once.
    pub fn validate_boundary(&self) -> bool {
        for (i, node) in self.boundary_nodes.iter().enumerate() {
            if node.borrow().entity.num_mpi_rankinfos() == 0 {
                return false;
            }
            if self.boundary_nodes[i + 1..]
                .iter()
                .any(|other| Rc::ptr_eq(other, node))
            {
                return false;
            }
        }
        true
    }
}
