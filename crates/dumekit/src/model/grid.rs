//! Node pools of a zone: actual nodes owned by this rank and the virtual
//! halo copies owned by neighbors.

use std::rc::Rc;

use log::warn;

use crate::error::{Error, Result};
use crate::ids::{GlobalRankId, LocalId, RankNo};
use crate::model::coords::CoordsValue;
use crate::model::node::{Node, NodeRef};
use crate::model::types::{DataValue, RealityType};

#[derive(Debug, Default)]
pub struct GridCoordinates {
    /// Owned nodes; ids are 1..N after a rebuild.
    nodes: Vec<NodeRef>,
    /// Halo copies, kept sorted by global id. A virtual node retains the
    /// owner rank's id and is never renumbered here.
    virtual_nodes: Vec<NodeRef>,
    max_node_id: LocalId,
    my_rankno: RankNo,
}

impl GridCoordinates {
    pub fn new() -> Self {
        GridCoordinates {
            nodes: Vec::new(),
            virtual_nodes: Vec::new(),
            max_node_id: 0,
            my_rankno: 0,
        }
    }

    pub fn my_rankno(&self) -> RankNo {
        self.my_rankno
    }

    pub fn set_my_rankno(&mut self, rankno: RankNo) {
        self.my_rankno = rankno;
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_virtual_nodes(&self) -> usize {
        self.virtual_nodes.len()
    }

    pub fn nodes(&self) -> &[NodeRef] {
        &self.nodes
    }

    pub fn virtual_nodes(&self) -> &[NodeRef] {
        &self.virtual_nodes
    }

    /// Node by 1-based id. Direct index first, then a scan for pools whose
    /// ids are not contiguous (mid-import).
    pub fn node_by_id(&self, node_id: LocalId) -> Option<NodeRef> {
        if node_id == 0 {
            return None;
        }
        let index = node_id as usize - 1;
        if let Some(node) = self.nodes.get(index) {
            if node.borrow().entity.id() == node_id {
                return Some(Rc::clone(node));
            }
        }
        self.nodes
            .iter()
            .find(|n| n.borrow().entity.id() == node_id)
            .cloned()
    }

    /// Node by sequence local id, virtual nodes continuing past the actual
    /// count.
    pub fn node_by_local_id(&self, local_id: LocalId) -> Option<NodeRef> {
        let actual = self.nodes.len() as LocalId;
        if local_id == 0 {
            None
        } else if local_id <= actual {
            self.nodes.get(local_id as usize - 1).cloned()
        } else {
            self.virtual_nodes
                .get((local_id - actual) as usize - 1)
                .cloned()
        }
    }

    /// Register an owned node: next id, owner rank set to this rank.
    pub fn insert_node(&mut self, node: NodeRef) -> LocalId {
        self.max_node_id += 1;
        let id = self.max_node_id;
        {
            let mut n = node.borrow_mut();
            n.entity.set_id(id);
            n.entity.set_local_id(id);
            n.entity.set_my_rankno(self.my_rankno);
            n.entity.set_reality_type(RealityType::Actual);
        }
        self.nodes.push(node);
        id
    }

    /// Adopt an already-identified node (import path): identity is kept,
    /// only the id counter advances.
    pub fn push_node(&mut self, node: NodeRef) {
        let id = node.borrow().entity.id();
        if id > self.max_node_id {
            self.max_node_id = id;
        }
        self.nodes.push(node);
    }

    pub fn insert_grid_coordinates<T: DataValue>(&mut self, x: T, y: T, z: T) -> LocalId {
        let mut node = Node::from_coords(x, y, z);
        node.entity.set_my_rankno(self.my_rankno);
        self.insert_node(node.into_ref())
    }

    /// Insert into the virtual pool keeping it sorted by global id.
    pub fn insert_virtual_node(&mut self, node: NodeRef) -> usize {
        node.borrow_mut().entity.set_reality_type(RealityType::Virtual);
        let key = node.borrow().entity.global_id();
        let pos = self
            .virtual_nodes
            .partition_point(|n| n.borrow().entity.global_id() < key);
        self.virtual_nodes.insert(pos, node);
        self.virtual_nodes.len()
    }

    pub fn find_virtual_node_by_global_id(
        &self,
        rankno: RankNo,
        localid: LocalId,
    ) -> Option<NodeRef> {
        let key = GlobalRankId::new(rankno, localid);
        let pos = self
            .virtual_nodes
            .partition_point(|n| n.borrow().entity.global_id() < key);
        let node = self.virtual_nodes.get(pos)?;
        (node.borrow().entity.global_id() == key).then(|| Rc::clone(node))
    }

    /// Find an owned node under any identity it has carried: direct index,
    /// current global id, then previous global ids.
    pub fn find_node_by_global_id(&self, rankno: RankNo, localid: LocalId) -> Option<NodeRef> {
        if rankno < 0 || localid == 0 {
            return None;
        }
        if let Some(node) = self.nodes.get(localid as usize - 1) {
            let entity = &node.borrow().entity;
            if entity.id() == localid && entity.my_rankno() == rankno {
                return Some(Rc::clone(node));
            }
        }
        if let Some(node) = self
            .nodes
            .iter()
            .find(|n| n.borrow().entity.global_id().equals(rankno, localid))
        {
            return Some(Rc::clone(node));
        }
        self.nodes
            .iter()
            .find(|n| n.borrow().entity.exists_previous_rankinfo(rankno, localid))
            .cloned()
    }

    /// Bulk load: clears the pool and writes `num_nodes` nodes with ids
    /// 1..N, each recording `source_rankno` as its previous identity.
    pub fn set_grid_coordinates_array<T: DataValue>(
        &mut self,
        num_nodes: usize,
        coords_x: &[T],
        coords_y: &[T],
        coords_z: &[T],
        source_rankno: RankNo,
    ) -> Result<usize> {
        if coords_x.len() < num_nodes || coords_y.len() < num_nodes || coords_z.len() < num_nodes {
            return Err(Error::InvalidParameter(format!(
                "coordinate arrays shorter than {num_nodes}"
            )));
        }
        self.clear_nodes();
        for i in 0..num_nodes {
            let mut node = Node::from_coords(coords_x[i], coords_y[i], coords_z[i]);
            node.entity.set_my_rankno(self.my_rankno);
            node.entity.add_previous_rankinfo(source_rankno, i as LocalId + 1);
            self.insert_node(node.into_ref());
        }
        Ok(self.nodes.len())
    }

    /// Extract the inclusive 1-based id range into the given slices.
    pub fn get_grid_coordinates_array<T: DataValue>(
        &self,
        start_id: LocalId,
        end_id: LocalId,
        coords_x: &mut [T],
        coords_y: &mut [T],
        coords_z: &mut [T],
    ) -> usize {
        copy_range(&self.nodes, start_id, end_id, |i, (x, y, z)| {
            coords_x[i] = x;
            coords_y[i] = y;
            coords_z[i] = z;
        })
    }

    pub fn get_grid_coordinates_x<T: DataValue>(
        &self,
        start_id: LocalId,
        end_id: LocalId,
        coords: &mut [T],
    ) -> usize {
        copy_range(&self.nodes, start_id, end_id, |i, (x, _, _)| coords[i] = x)
    }

    pub fn get_grid_coordinates_y<T: DataValue>(
        &self,
        start_id: LocalId,
        end_id: LocalId,
        coords: &mut [T],
    ) -> usize {
        copy_range(&self.nodes, start_id, end_id, |i, (_, y, _)| coords[i] = y)
    }

    pub fn get_grid_coordinates_z<T: DataValue>(
        &self,
        start_id: LocalId,
        end_id: LocalId,
        coords: &mut [T],
    ) -> usize {
        copy_range(&self.nodes, start_id, end_id, |i, (_, _, z)| coords[i] = z)
    }

    /// Virtual-pool variant of the bulk extraction, 1-based over the
    /// sorted virtual sequence.
    pub fn get_virtual_coordinates_array<T: DataValue>(
        &self,
        start_id: LocalId,
        end_id: LocalId,
        coords_x: &mut [T],
        coords_y: &mut [T],
        coords_z: &mut [T],
    ) -> usize {
        copy_range(&self.virtual_nodes, start_id, end_id, |i, (x, y, z)| {
            coords_x[i] = x;
            coords_y[i] = y;
            coords_z[i] = z;
        })
    }

    pub fn get_grid_coordinates<T: DataValue>(&self, node_id: LocalId) -> Result<(T, T, T)> {
        let node = self
            .node_by_id(node_id)
            .ok_or_else(|| Error::InvalidParameter(format!("node id {node_id} out of range")))?;
        let coords = node.borrow().get_coords();
        Ok(coords)
    }

    pub fn set_grid_coordinates<T: DataValue>(
        &mut self,
        node_id: LocalId,
        x: T,
        y: T,
        z: T,
    ) -> Result<()> {
        let node = self
            .node_by_id(node_id)
            .ok_or_else(|| Error::InvalidParameter(format!("node id {node_id} out of range")))?;
        node.borrow_mut().set_coords(x, y, z);
        Ok(())
    }

    pub fn clear_nodes(&mut self) {
        self.nodes.clear();
        self.max_node_id = 0;
    }

    pub fn clear_virtual_nodes(&mut self) {
        for node in &self.virtual_nodes {
            node.borrow_mut().clear_parent_cells();
        }
        self.virtual_nodes.clear();
    }

    /// Remove nodes with no remaining parent cells. A node still wired into
    /// a cell is kept; removing it would leave the cell malformed.
    pub fn remove_nodes(&mut self, remove_nodes: &[NodeRef]) {
        for node in remove_nodes {
            if node.borrow().num_parent_cells() > 0 {
                warn!(
                    "skip removal of node {}: still referenced by {} cells",
                    node.borrow().entity.id(),
                    node.borrow().num_parent_cells()
                );
                continue;
            }
            node.borrow_mut().entity.set_remove_entity(true);
        }
        self.nodes.retain(|n| !n.borrow().entity.is_remove_entity());
    }

    /// Renumber owned nodes 1..N. Each node records its former identity in
    /// its previous-rank list and becomes owned by this rank.
    pub fn rebuild_nodes(&mut self) {
        let mut node_id: LocalId = 0;
        for node in &self.nodes {
            node_id += 1;
            let mut n = node.borrow_mut();
            let old_rank = n.entity.my_rankno();
            let old_id = n.entity.id();
            n.entity.add_previous_rankinfo(old_rank, old_id);
            n.entity.set_id(node_id);
            n.entity.set_local_id(node_id);
            n.entity.set_my_rankno(self.my_rankno);
        }
        self.max_node_id = node_id;
    }

    /// Assign virtual-local sequence ids starting at |actual|+1. Global
    /// identity of the halo copies is untouched.
    pub fn rebuild_virtual_nodes(&mut self) {
        let mut local_id = self.nodes.len() as LocalId;
        for node in &self.virtual_nodes {
            local_id += 1;
            node.borrow_mut().entity.set_local_id(local_id);
        }
    }

    pub fn clear_previous_infos(&mut self) {
        for node in self.nodes.iter().chain(self.virtual_nodes.iter()) {
            node.borrow_mut().entity.clear_previous_infos();
        }
    }
}

fn copy_range<T: DataValue>(
    nodes: &[NodeRef],
    start_id: LocalId,
    end_id: LocalId,
    mut write: impl FnMut(usize, (T, T, T)),
) -> usize {
    if start_id == 0 || end_id < start_id {
        return 0;
    }
    let start = start_id as usize - 1;
    let end = (end_id as usize).min(nodes.len());
    if start >= end {
        return 0;
    }
    for (i, node) in nodes[start..end].iter().enumerate() {
        write(i, node.borrow().get_coords());
    }
    end - start
}

/// Coordinate hash key for exact-equality joins.
pub(crate) fn coords_bits(coords: &CoordsValue) -> [u64; 3] {
    let (x, y, z): (f64, f64, f64) = coords.get();
    [x.to_bits(), y.to_bits(), z.to_bits()]
}
