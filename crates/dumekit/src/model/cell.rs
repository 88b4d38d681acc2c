//! Cells and their component sub-cells.
//!
//! Three dimensional classes share one cell type: solids generate face
//! components, shells generate edge components, bars generate nothing. The
//! class is derived from the element type; no other behavior varies per
//! variant (dimensionality, node count, component generation).

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use arrayvec::ArrayVec;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::archive::{Serializable, SerializeArchive};
use crate::error::{Error, Result};
use crate::ids::{GlobalRankId, LocalId};
use crate::model::element_type::{ElementClass, ElementType};
use crate::model::entity::Entity;
use crate::model::node::{Node, NodeRef};

pub type CellRef = Rc<RefCell<Cell>>;
pub type CellWeakRef = Weak<RefCell<Cell>>;
pub type ComponentRef = Rc<RefCell<Component>>;

/// Largest entity connectivity (hexahedron).
const MAX_CELL_NODES: usize = 8;

#[derive(Debug)]
pub struct Cell {
    pub entity: Entity,
    /// Ordered connectivity. Non-owning in spirit: the zone's grid owns the
    /// nodes, the cell shares handles.
    nodes: SmallVec<[NodeRef; MAX_CELL_NODES]>,
    /// Faces or edges, shared with sibling cells through the section pool.
    components: Vec<ComponentRef>,
    /// Identity of the section the cell came from, carried over the wire.
    parent_section: Option<(LocalId, ElementType)>,
}

impl Cell {
    /// A cell of one of the supported entity element types.
    pub fn new(element_type: ElementType) -> Result<Cell> {
        if !element_type.is_supported_cell() {
            return Err(Error::InvalidElementType(format!(
                "{element_type} is not an entity cell type"
            )));
        }
        Ok(Cell {
            entity: Entity::new(element_type),
            nodes: SmallVec::new(),
            components: Vec::new(),
            parent_section: None,
        })
    }

    pub fn into_ref(self) -> CellRef {
        Rc::new(RefCell::new(self))
    }

    pub fn element_type(&self) -> ElementType {
        self.entity.element_type()
    }

    pub fn class(&self) -> ElementClass {
        // supported cell types always classify
        self.entity.element_type().class().unwrap()
    }

    pub fn dimension(&self) -> i32 {
        self.entity.element_type().dimension().unwrap_or(0)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[NodeRef] {
        &self.nodes
    }

    /// Node by 1-based connectivity position, the numbering the face tables
    /// use.
    pub fn node(&self, position: usize) -> Option<&NodeRef> {
        if position == 0 {
            return None;
        }
        self.nodes.get(position - 1)
    }

    pub(crate) fn set_nodes_raw(&mut self, nodes: Vec<NodeRef>) {
        self.nodes = SmallVec::from_vec(nodes);
    }

    pub(crate) fn replace_node_raw(&mut self, index: usize, node: NodeRef) {
        self.nodes[index] = node;
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    pub fn components(&self) -> &[ComponentRef] {
        &self.components
    }

    pub(crate) fn push_component(&mut self, component: ComponentRef) {
        self.components.push(component);
    }

    pub(crate) fn clear_components_raw(&mut self) {
        self.components.clear();
    }

    pub fn parent_section(&self) -> Option<(LocalId, ElementType)> {
        self.parent_section
    }

    pub fn set_parent_section(&mut self, section_id: LocalId, element_type: ElementType) {
        self.parent_section = Some((section_id, element_type));
    }

    /// Sorted node global ids; the order-insensitive connectivity key.
    pub fn node_global_ids(&self) -> Vec<GlobalRankId> {
        let mut ids: Vec<GlobalRankId> = self
            .nodes
            .iter()
            .map(|n| n.borrow().entity.global_id())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Connectivity expressed in the nodes' current local ids.
    pub fn node_local_ids(&self) -> Vec<LocalId> {
        self.nodes.iter().map(|n| n.borrow().entity.local_id()).collect()
    }

    /// The connectivity node count the element type requires.
    pub fn has_expected_node_count(&self) -> bool {
        self.entity.element_type().num_nodes() == Some(self.nodes.len())
    }
}

/// Wire the connectivity of `cell` and register the parent back reference
/// on every node.
pub fn set_cell_nodes(cell: &CellRef, nodes: &[NodeRef]) {
    cell.borrow_mut().nodes = nodes.iter().cloned().collect();
    for node in nodes {
        node.borrow_mut().add_parent_cell(cell);
    }
}

/// Remove the cell from every node's parent list and drop the connectivity.
pub fn detach_cell_nodes(cell: &CellRef) {
    let nodes: Vec<NodeRef> = cell.borrow().nodes.to_vec();
    for node in &nodes {
        node.borrow_mut().remove_parent_cell(cell);
    }
    cell.borrow_mut().nodes.clear();
}

/// Swap one connectivity slot to a different node, maintaining back
/// references on both sides.
pub fn rewire_cell_node(cell: &CellRef, index: usize, node: &NodeRef) {
    let old = cell.borrow().nodes[index].clone();
    if Rc::ptr_eq(&old, node) {
        return;
    }
    cell.borrow_mut().replace_node_raw(index, Rc::clone(node));
    let still_used = cell
        .borrow()
        .nodes
        .iter()
        .any(|n| Rc::ptr_eq(n, &old));
    if !still_used {
        old.borrow_mut().remove_parent_cell(cell);
    }
    node.borrow_mut().add_parent_cell(cell);
}

/// Neighbor cells: for each component, every parent cell of that component
/// other than the cell itself.
pub fn neighbor_cells(cell: &CellRef) -> Vec<CellRef> {
    let mut seen: FxHashSet<*const RefCell<Cell>> = FxHashSet::default();
    seen.insert(Rc::as_ptr(cell));
    let mut neighbors = Vec::new();
    let components = cell.borrow().components.clone();
    for component in components {
        for parent in component.borrow().parent_cells() {
            if seen.insert(Rc::as_ptr(&parent)) {
                neighbors.push(parent);
            }
        }
    }
    neighbors
}

impl Serializable for Cell {
    fn serialize(&self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        self.entity.serialize(archive)?;
        match self.parent_section {
            Some((id, element_type)) => {
                archive.write_u64(id);
                archive.write_i32(element_type.tag());
            }
            None => {
                archive.write_u64(0);
                archive.write_i32(self.entity.element_type().tag());
            }
        }
        archive.write_u64(self.nodes.len() as u64);
        for node in &self.nodes {
            node.borrow().serialize(archive)?;
        }
        Ok(())
    }

    fn deserialize(&mut self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        self.entity.deserialize(archive)?;
        let section_id = archive.read_u64()?;
        let section_type = ElementType::from_tag(archive.read_i32()?)
            .map_err(|e| Error::Deserialize(format!("cell section type: {e}")))?;
        self.parent_section = (section_id > 0).then_some((section_id, section_type));
        let num_nodes = archive.read_u64()? as usize;
        self.nodes.clear();
        for _ in 0..num_nodes {
            let mut node = Node::default();
            node.deserialize(archive)?;
            self.nodes.push(node.into_ref());
        }
        self.components.clear();
        Ok(())
    }
}

/// Largest component node count (quadrilateral face).
pub const MAX_COMPONENT_NODES: usize = 4;

/// A face (for solids) or an edge (for shells), deduplicated across parents
/// within a section.
#[derive(Debug)]
pub struct Component {
    id: LocalId,
    element_type: ElementType,
    nodes: SmallVec<[NodeRef; MAX_COMPONENT_NODES]>,
    parent_cells: Vec<CellWeakRef>,
    remove: bool,
}

impl Component {
    pub fn new(element_type: ElementType) -> Result<Component> {
        if !matches!(
            element_type,
            ElementType::Bar2 | ElementType::Tri3 | ElementType::Quad4
        ) {
            return Err(Error::InvalidElementType(format!(
                "{element_type} is not a component cell type"
            )));
        }
        Ok(Component {
            id: 0,
            element_type,
            nodes: SmallVec::new(),
            parent_cells: Vec::new(),
            remove: false,
        })
    }

    pub fn into_ref(self) -> ComponentRef {
        Rc::new(RefCell::new(self))
    }

    pub fn id(&self) -> LocalId {
        self.id
    }

    pub fn set_id(&mut self, id: LocalId) {
        self.id = id;
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[NodeRef] {
        &self.nodes
    }

    pub fn insert_node(&mut self, node: NodeRef) {
        self.nodes.push(node);
    }

    pub fn is_remove(&self) -> bool {
        self.remove
    }

    pub fn set_remove(&mut self, remove: bool) {
        self.remove = remove;
    }

    /// Sorted node global ids. Two components with equal key sets are the
    /// same face/edge regardless of traversal order.
    pub fn node_id_key(&self) -> ArrayVec<GlobalRankId, MAX_COMPONENT_NODES> {
        let mut key: ArrayVec<GlobalRankId, MAX_COMPONENT_NODES> = self
            .nodes
            .iter()
            .map(|n| n.borrow().entity.global_id())
            .collect();
        key.sort_unstable();
        key
    }

    pub fn num_parent_cells(&self) -> usize {
        self.parent_cells
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn parent_cells(&self) -> Vec<CellRef> {
        self.parent_cells.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn insert_parent_cell(&mut self, cell: &CellRef) {
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

    pub fn prune_parent_cells(&mut self) {
        self.parent_cells.retain(|w| w.strong_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::node::Node;

    fn make_nodes(n: usize) -> Vec<NodeRef> {
        (0..n)
            .map(|i| {
                let node = Node::from_coords(i as f64, 0.0, 0.0).into_ref();
                node.borrow_mut().entity.set_id(i as u64 + 1);
                node.borrow_mut().entity.set_my_rankno(0);
                node
            })
            .collect()
    }

    #[test]
    fn test_unsupported_cell_types_are_rejected() {
        assert!(Cell::new(ElementType::Mixed).is_err());
        assert!(Cell::new(ElementType::Node).is_err());
        assert!(Cell::new(ElementType::Tetra4).is_ok());
    }

    #[test]
    fn test_set_nodes_wires_backrefs() {
        let nodes = make_nodes(4);
        let cell = Cell::new(ElementType::Tetra4).unwrap().into_ref();
        set_cell_nodes(&cell, &nodes);
        assert_eq!(cell.borrow().num_nodes(), 4);
        for node in &nodes {
            assert_eq!(node.borrow().num_parent_cells(), 1);
        }
        detach_cell_nodes(&cell);
        for node in &nodes {
            assert_eq!(node.borrow().num_parent_cells(), 0);
        }
    }

    #[test]
    fn test_one_based_node_access() {
        let nodes = make_nodes(2);
        let cell = Cell::new(ElementType::Bar2).unwrap().into_ref();
        set_cell_nodes(&cell, &nodes);
        let cell = cell.borrow();
        assert!(cell.node(0).is_none());
        assert!(Rc::ptr_eq(cell.node(1).unwrap(), &nodes[0]));
        assert!(Rc::ptr_eq(cell.node(2).unwrap(), &nodes[1]));
        assert!(cell.node(3).is_none());
    }

    #[test]
    fn test_component_key_is_order_insensitive() {
        let nodes = make_nodes(4);
        let mut a = Component::new(ElementType::Quad4).unwrap();
        let mut b = Component::new(ElementType::Quad4).unwrap();
        for node in &nodes {
            a.insert_node(Rc::clone(node));
        }
        for node in nodes.iter().rev() {
            b.insert_node(Rc::clone(node));
        }
        assert_eq!(a.node_id_key(), b.node_id_key());
    }

    #[test]
    fn test_component_parent_tracking() {
        let mut component = Component::new(ElementType::Tri3).unwrap();
        let cell = Cell::new(ElementType::Tetra4).unwrap().into_ref();
        component.insert_parent_cell(&cell);
        component.insert_parent_cell(&cell);
        assert_eq!(component.num_parent_cells(), 1);
        drop(cell);
        assert_eq!(component.num_parent_cells(), 0);
    }

    #[test]
    fn test_cell_serialize_roundtrip_carries_nodes() {
        let nodes = make_nodes(4);
        let cell = Cell::new(ElementType::Tetra4).unwrap().into_ref();
        set_cell_nodes(&cell, &nodes);
        {
            let mut c = cell.borrow_mut();
            c.entity.set_id(9);
            c.entity.set_my_rankno(1);
            c.set_parent_section(2, ElementType::Tetra4);
        }

        let bytes = crate::archive::to_bytes(&*cell.borrow()).unwrap();
        let mut back = Cell::new(ElementType::Tetra4).unwrap();
        crate::archive::read_into(&mut back, &bytes).unwrap();
        assert_eq!(back.entity.id(), 9);
        assert_eq!(back.entity.my_rankno(), 1);
        assert_eq!(back.parent_section(), Some((2, ElementType::Tetra4)));
        assert_eq!(back.num_nodes(), 4);
        // deserialized nodes are fresh standalone objects
        assert_eq!(back.nodes()[0].borrow().entity.id(), 1);
        assert_eq!(back.nodes()[0].borrow().num_parent_cells(), 0);
    }
}
