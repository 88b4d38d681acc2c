//! Mesh nodes: coordinates plus the shared entity core and non-owning
//! back references to parent cells.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use rustc_hash::FxHashSet;

use crate::archive::{Serializable, SerializeArchive};
use crate::error::Result;
use crate::model::cell::{CellRef, CellWeakRef};
use crate::model::coords::CoordsValue;
use crate::model::element_type::ElementType;
use crate::model::entity::Entity;
use crate::model::types::DataValue;

pub type NodeRef = Rc<RefCell<Node>>;
pub type NodeWeakRef = Weak<RefCell<Node>>;

#[derive(Debug, Default)]
pub struct Node {
    pub entity: Entity,
    coords: CoordsValue,
    /// Non-owning back references; pruned by the owning container's remove
    /// operations, never by the node itself.
    parent_cells: Vec<CellWeakRef>,
    /// Link to the node this one was merged into during a join read, set
    /// when two ranks' files overlap at a shared node.
    common_node: Option<NodeWeakRef>,
}

impl Node {
    pub fn new(coords: CoordsValue) -> Self {
        Node {
            entity: Entity::new(ElementType::Node),
            coords,
            parent_cells: Vec::new(),
            common_node: None,
        }
    }

    pub fn from_coords<T: DataValue>(x: T, y: T, z: T) -> Self {
        Node::new(CoordsValue::from_values(x, y, z))
    }

    pub fn into_ref(self) -> NodeRef {
        Rc::new(RefCell::new(self))
    }

    pub fn coords(&self) -> &CoordsValue {
        &self.coords
    }

    pub fn coords_mut(&mut self) -> &mut CoordsValue {
        &mut self.coords
    }

    pub fn get_coords<T: DataValue>(&self) -> (T, T, T) {
        self.coords.get()
    }

    pub fn set_coords<T: DataValue>(&mut self, x: T, y: T, z: T) {
        self.coords.set(x, y, z);
    }

    // --- parent cells ------------------------------------------------------

    pub fn num_parent_cells(&self) -> usize {
        self.parent_cells
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Alive parent cells in registration order.
    pub fn parent_cells(&self) -> Vec<CellRef> {
        self.parent_cells.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn add_parent_cell(&mut self, cell: &CellRef) {
        let exists = self
            .parent_cells
            .iter()
            .any(|w| w.as_ptr() == Rc::as_ptr(cell));
        if !exists {
            self.parent_cells.push(Rc::downgrade(cell));
        }
    }

    pub fn remove_parent_cell(&mut self, cell: &CellRef) {
        self.parent_cells.retain(|w| w.as_ptr() != Rc::as_ptr(cell));
    }

    pub fn clear_parent_cells(&mut self) {
        self.parent_cells.clear();
    }

    /// Drop back references whose cells are gone.
    pub fn prune_parent_cells(&mut self) {
        self.parent_cells.retain(|w| w.strong_count() > 0);
    }

    // --- common node -------------------------------------------------------

    pub fn common_node(&self) -> Option<NodeRef> {
        self.common_node.as_ref().and_then(Weak::upgrade)
    }

    pub fn set_common_node(&mut self, node: &NodeRef) {
        self.common_node = Some(Rc::downgrade(node));
    }

    pub fn clear_common_node(&mut self) {
        self.common_node = None;
    }

    /// Copy identity, solutions, rank bookkeeping and coordinates. Parent
    /// cells and the common-node link stay behind.
    pub fn clone_node(&self) -> Node {
        Node {
            entity: self.entity.clone(),
            coords: self.coords.clone(),
            parent_cells: Vec::new(),
            common_node: None,
        }
    }
}

impl Serializable for Node {
    fn serialize(&self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        self.entity.serialize(archive)?;
        self.coords.serialize(archive)
    }

    fn deserialize(&mut self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        self.entity.deserialize(archive)?;
        self.coords.deserialize(archive)
    }
}

/// Unique cells adjacent to `node`, i.e. its alive parent cells.
pub fn connectivity_cells(node: &NodeRef) -> Vec<CellRef> {
    node.borrow().parent_cells()
}

/// Unique peer nodes sharing at least one parent cell with `node`.
pub fn neighbor_nodes(node: &NodeRef) -> Vec<NodeRef> {
    let mut seen: FxHashSet<*const RefCell<Node>> = FxHashSet::default();
    seen.insert(Rc::as_ptr(node));
    let mut neighbors = Vec::new();
    for cell in node.borrow().parent_cells() {
        for peer in cell.borrow().nodes() {
            if seen.insert(Rc::as_ptr(peer)) {
                neighbors.push(Rc::clone(peer));
            }
        }
    }
    neighbors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive;
    use crate::model::cell::Cell;

    #[test]
    fn test_coords_access() {
        let mut node = Node::from_coords(1.0f64, 2.0, 3.0);
        let (x, y, z) = node.get_coords::<f64>();
        assert_eq!((x, y, z), (1.0, 2.0, 3.0));
        node.set_coords(4.0f64, 5.0, 6.0);
        assert_eq!(node.get_coords::<f64>(), (4.0, 5.0, 6.0));
    }

    #[test]
    fn test_parent_cell_backrefs_are_weak() {
        let node = Node::from_coords(0.0f64, 0.0, 0.0).into_ref();
        let cell = Cell::new(ElementType::Bar2).unwrap().into_ref();
        node.borrow_mut().add_parent_cell(&cell);
        node.borrow_mut().add_parent_cell(&cell); // dedup
        assert_eq!(node.borrow().num_parent_cells(), 1);
        drop(cell);
        assert_eq!(node.borrow().num_parent_cells(), 0);
        node.borrow_mut().prune_parent_cells();
        assert!(node.borrow().parent_cells().is_empty());
    }

    #[test]
    fn test_clone_node_drops_graph_links() {
        let node = Node::from_coords(1.0f64, 1.0, 1.0).into_ref();
        let other = Node::from_coords(2.0f64, 2.0, 2.0).into_ref();
        let cell = Cell::new(ElementType::Bar2).unwrap().into_ref();
        node.borrow_mut().entity.set_id(7);
        node.borrow_mut().entity.set_my_rankno(1);
        node.borrow_mut().add_parent_cell(&cell);
        node.borrow_mut().set_common_node(&other);

        let clone = node.borrow().clone_node();
        assert_eq!(clone.entity.id(), 7);
        assert_eq!(clone.entity.my_rankno(), 1);
        assert_eq!(clone.num_parent_cells(), 0);
        assert!(clone.common_node().is_none());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut node = Node::from_coords(0.5f64, -1.5, 2.5);
        node.entity.set_id(3);
        node.entity.set_my_rankno(2);
        node.entity.add_mpi_rankinfo(0, 9);
        let bytes = archive::to_bytes(&node).unwrap();
        let mut back = Node::default();
        archive::read_into(&mut back, &bytes).unwrap();
        assert_eq!(back.entity.id(), 3);
        assert_eq!(back.entity.my_rankno(), 2);
        assert!(back.entity.exists_mpi_rankinfo(0, 9));
        assert_eq!(back.get_coords::<f64>(), (0.5, -1.5, 2.5));
    }
}
