//! Cell containers of a zone: element sections, the owned entity pool, the
//! virtual halo pool, and the deduplicated component (face/edge) pool.

use std::rc::Rc;

use arrayvec::ArrayVec;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::ids::{GlobalRankId, LocalId, RankNo};
use crate::model::cell::{
    detach_cell_nodes, Cell, CellRef, Component, ComponentRef, MAX_COMPONENT_NODES,
};
use crate::model::element_type::ElementType;
use crate::model::node::NodeRef;
use crate::model::types::RealityType;

type ComponentKey = ArrayVec<GlobalRankId, MAX_COMPONENT_NODES>;

/// One declared element block: homogeneous, or `Mixed` with per-cell types.
#[derive(Debug)]
pub struct ElementsSection {
    id: LocalId,
    name: String,
    element_type: ElementType,
    cells: Vec<CellRef>,
    start_elemid: LocalId,
    end_elemid: LocalId,
}

impl ElementsSection {
    pub fn id(&self) -> LocalId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> &[CellRef] {
        &self.cells
    }

    pub fn elem_id_range(&self) -> (LocalId, LocalId) {
        (self.start_elemid, self.end_elemid)
    }

    /// A homogeneous section takes exactly its own type; `Mixed` takes any
    /// supported cell type.
    pub fn accepts(&self, element_type: ElementType) -> bool {
        match self.element_type {
            ElementType::Mixed => element_type.is_supported_cell(),
            own => own == element_type,
        }
    }

    fn insert_sorted(&mut self, cell: CellRef) {
        let id = cell.borrow().entity.id();
        let pos = self.cells.partition_point(|c| c.borrow().entity.id() < id);
        self.cells.insert(pos, cell);
        self.refresh_range();
    }

    fn refresh_range(&mut self) {
        self.start_elemid = self
            .cells
            .first()
            .map_or(0, |c| c.borrow().entity.id());
        self.end_elemid = self.cells.last().map_or(0, |c| c.borrow().entity.id());
    }
}

#[derive(Debug, Default)]
pub struct Sections {
    sections: Vec<ElementsSection>,
    /// All owned cells, ordered by section-assigned element id.
    entity_cells: Vec<CellRef>,
    /// Halo cells, ordered by global id.
    virtual_cells: Vec<CellRef>,
    /// Faces/edges shared between sibling cells.
    component_cells: Vec<ComponentRef>,
    max_component_id: LocalId,
    my_rankno: RankNo,
}

impl Sections {
    pub fn new() -> Self {
        Sections::default()
    }

    pub fn my_rankno(&self) -> RankNo {
        self.my_rankno
    }

    pub fn set_my_rankno(&mut self, rankno: RankNo) {
        self.my_rankno = rankno;
    }

    // --- sections ----------------------------------------------------------

    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }

    pub fn sections(&self) -> &[ElementsSection] {
        &self.sections
    }

    pub fn exists_section(&self, name: &str) -> bool {
        self.sections.iter().any(|s| s.name == name)
    }

    pub fn section_by_name(&self, name: &str) -> Option<&ElementsSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn section_by_id(&self, section_id: LocalId) -> Option<&ElementsSection> {
        self.sections.iter().find(|s| s.id == section_id)
    }

    pub fn create_section(&mut self, name: &str, element_type: ElementType) -> Result<LocalId> {
        if element_type != ElementType::Mixed && !element_type.is_supported_cell() {
            return Err(Error::NotSupportedElementType(format!(
                "{element_type} cannot form a section"
            )));
        }
        if self.exists_section(name) {
            return Err(Error::InvalidElements(format!(
                "section {name} already exists"
            )));
        }
        let id = self.sections.len() as LocalId + 1;
        self.sections.push(ElementsSection {
            id,
            name: name.to_string(),
            element_type,
            cells: Vec::new(),
            start_elemid: 0,
            end_elemid: 0,
        });
        Ok(id)
    }

    pub fn clear_sections(&mut self) {
        self.clear_component_cells();
        self.clear_virtual_cells();
        for cell in &self.entity_cells {
            detach_cell_nodes(cell);
        }
        self.entity_cells.clear();
        self.sections.clear();
    }

    // --- entity cells ------------------------------------------------------

    pub fn num_entity_cells(&self) -> usize {
        self.entity_cells.len()
    }

    pub fn entity_cells(&self) -> &[CellRef] {
        &self.entity_cells
    }

    pub fn max_entity_elem_id(&self) -> LocalId {
        self.entity_cells
            .last()
            .map_or(0, |c| c.borrow().entity.id())
    }

    /// Cell by 1-based element id: direct index probe, then scan.
    pub fn entity_cell_by_id(&self, elem_id: LocalId) -> Option<CellRef> {
        if elem_id == 0 {
            return None;
        }
        if let Some(cell) = self.entity_cells.get(elem_id as usize - 1) {
            if cell.borrow().entity.id() == elem_id {
                return Some(Rc::clone(cell));
            }
        }
        self.entity_cells
            .iter()
            .find(|c| c.borrow().entity.id() == elem_id)
            .cloned()
    }

    pub fn cell_by_local_id(&self, local_id: LocalId) -> Option<CellRef> {
        let actual = self.entity_cells.len() as LocalId;
        if local_id == 0 {
            None
        } else if local_id <= actual {
            self.entity_cells.get(local_id as usize - 1).cloned()
        } else {
            self.virtual_cells
                .get((local_id - actual) as usize - 1)
                .cloned()
        }
    }

    pub fn find_entity_cell_by_global_id(&self, rankno: RankNo, localid: LocalId) -> Option<CellRef> {
        self.entity_cells
            .iter()
            .find(|c| {
                let entity = &c.borrow().entity;
                entity.global_id().equals(rankno, localid)
                    || entity.exists_previous_rankinfo(rankno, localid)
            })
            .cloned()
    }

    /// Register an owned cell. Element id 0 means "assign the next one";
    /// interior ids are placed by binary search.
    pub fn insert_cell(&mut self, cell: CellRef) -> Result<LocalId> {
        let element_type = cell.borrow().entity.element_type();
        if !element_type.is_supported_cell() {
            return Err(Error::InvalidElementType(format!(
                "cannot insert {element_type} cell"
            )));
        }
        let section_pos = match self
            .sections
            .iter()
            .position(|s| s.accepts(element_type))
        {
            Some(pos) => pos,
            None => {
                let name = format!("{element_type}");
                self.create_section(&name, element_type)?;
                self.sections.len() - 1
            }
        };

        let mut elem_id = cell.borrow().entity.id();
        if elem_id == 0 {
            elem_id = self.max_entity_elem_id() + 1;
        }
        {
            let mut c = cell.borrow_mut();
            c.entity.set_id(elem_id);
            c.entity.set_local_id(elem_id);
            if c.entity.my_rankno() < 0 {
                c.entity.set_my_rankno(self.my_rankno);
            }
            let section = &self.sections[section_pos];
            c.set_parent_section(section.id, section.element_type);
        }

        let pos = self
            .entity_cells
            .partition_point(|c| c.borrow().entity.id() < elem_id);
        if let Some(existing) = self.entity_cells.get(pos) {
            if existing.borrow().entity.id() == elem_id {
                return Err(Error::InvalidElements(format!(
                    "element id {elem_id} already occupied"
                )));
            }
        }
        self.entity_cells.insert(pos, Rc::clone(&cell));
        self.sections[section_pos].insert_sorted(cell);
        Ok(elem_id)
    }

    /// Flag and sweep the given cells, erasing their node back references
    /// and component parent links.
    pub fn remove_cells(&mut self, remove_cells: &[CellRef]) {
        for cell in remove_cells {
            cell.borrow_mut().entity.set_remove_entity(true);
            detach_cell_nodes(cell);
            let components = cell.borrow().components().to_vec();
            for component in components {
                component.borrow_mut().remove_parent_cell(cell);
            }
            cell.borrow_mut().clear_components_raw();
        }
        self.entity_cells
            .retain(|c| !c.borrow().entity.is_remove_entity());
        for section in &mut self.sections {
            section
                .cells
                .retain(|c| !c.borrow().entity.is_remove_entity());
            section.refresh_range();
        }
        for cell in remove_cells {
            cell.borrow_mut().entity.set_remove_entity(false);
        }
        self.sweep_orphan_components();
    }

    /// Renumber owned cells contiguously, recording former identities.
    pub fn rebuild_cell_id(&mut self) {
        let mut cell_id: LocalId = 0;
        for cell in &self.entity_cells {
            cell_id += 1;
            let mut c = cell.borrow_mut();
            let old_rank = c.entity.my_rankno();
            let old_id = c.entity.id();
            c.entity.add_previous_rankinfo(old_rank, old_id);
            c.entity.set_id(cell_id);
            c.entity.set_local_id(cell_id);
            c.entity.set_my_rankno(self.my_rankno);
        }
        for section in &mut self.sections {
            section.cells.sort_by_key(|c| c.borrow().entity.id());
            section.refresh_range();
        }
    }

    /// Virtual-local sequence ids continue past the entity count.
    pub fn rebuild_virtual_cells(&mut self) {
        let mut local_id = self.entity_cells.len() as LocalId;
        for cell in &self.virtual_cells {
            local_id += 1;
            cell.borrow_mut().entity.set_local_id(local_id);
        }
    }

    pub fn clear_previous_infos(&mut self) {
        for cell in self.entity_cells.iter().chain(self.virtual_cells.iter()) {
            cell.borrow_mut().entity.clear_previous_infos();
        }
    }

    pub fn clear_partition_weights(&mut self) {
        for cell in &self.entity_cells {
            cell.borrow_mut().entity.clear_partition_weight();
        }
    }

    // --- virtual cells -----------------------------------------------------

    pub fn num_virtual_cells(&self) -> usize {
        self.virtual_cells.len()
    }

    pub fn virtual_cells(&self) -> &[CellRef] {
        &self.virtual_cells
    }

    pub fn insert_virtual_cell(&mut self, cell: CellRef) -> usize {
        cell.borrow_mut().entity.set_reality_type(RealityType::Virtual);
        let key = cell.borrow().entity.global_id();
        let pos = self
            .virtual_cells
            .partition_point(|c| c.borrow().entity.global_id() < key);
        self.virtual_cells.insert(pos, cell);
        self.virtual_cells.len()
    }

    pub fn find_virtual_cell_by_global_id(
        &self,
        rankno: RankNo,
        localid: LocalId,
    ) -> Option<CellRef> {
        let key = GlobalRankId::new(rankno, localid);
        let pos = self
            .virtual_cells
            .partition_point(|c| c.borrow().entity.global_id() < key);
        let cell = self.virtual_cells.get(pos)?;
        (cell.borrow().entity.global_id() == key).then(|| Rc::clone(cell))
    }

    pub fn clear_virtual_cells(&mut self) {
        for cell in &self.virtual_cells {
            detach_cell_nodes(cell);
        }
        self.virtual_cells.clear();
    }

    // --- component cells ---------------------------------------------------

    pub fn num_component_cells(&self) -> usize {
        self.component_cells.len()
    }

    pub fn component_cells(&self) -> &[ComponentRef] {
        &self.component_cells
    }

    /// Generate faces/edges for every owned cell. Idempotent: a cell whose
    /// component set already has the expected cardinality is untouched.
    pub fn create_component_cells(&mut self) -> Result<()> {
        let cells = self.entity_cells.clone();
        self.create_component_cells_for(&cells)
    }

    /// Generation restricted to cells touching the given nodes (import
    /// path: only the neighborhood of new nodes needs regeneration).
    pub fn create_component_cells_touching(&mut self, nodes: &[NodeRef]) -> Result<()> {
        let mut seen = rustc_hash::FxHashSet::default();
        let mut cells = Vec::new();
        for node in nodes {
            for cell in node.borrow().parent_cells() {
                if seen.insert(Rc::as_ptr(&cell)) {
                    cells.push(cell);
                }
            }
        }
        self.create_component_cells_for(&cells)
    }

    fn create_component_cells_for(&mut self, cells: &[CellRef]) -> Result<()> {
        let mut index: FxHashMap<ComponentKey, ComponentRef> = FxHashMap::default();
        for component in &self.component_cells {
            index.insert(component.borrow().node_id_key(), Rc::clone(component));
        }
        for cell in cells {
            self.create_components_of(cell, &mut index)?;
        }
        self.sweep_orphan_components();
        Ok(())
    }

    fn create_components_of(
        &mut self,
        cell: &CellRef,
        index: &mut FxHashMap<ComponentKey, ComponentRef>,
    ) -> Result<()> {
        let element_type = cell.borrow().entity.element_type();
        if !cell.borrow().has_expected_node_count() {
            return Err(Error::InvalidElementType(format!(
                "{element_type} cell {} has {} nodes",
                cell.borrow().entity.id(),
                cell.borrow().num_nodes()
            )));
        }
        let table = element_type.component_table();
        if cell.borrow().num_components() == table.len() {
            return Ok(());
        }

        // regenerate from scratch for this cell
        let stale = cell.borrow().components().to_vec();
        for component in stale {
            component.borrow_mut().remove_parent_cell(cell);
        }
        cell.borrow_mut().clear_components_raw();

        for def in table {
            let face_nodes: Vec<NodeRef> = {
                let c = cell.borrow();
                def.nodes
                    .iter()
                    .map(|&local| {
                        c.node(local).cloned().ok_or_else(|| {
                            Error::InvalidElementType(format!(
                                "{element_type} face references node position {local} beyond connectivity"
                            ))
                        })
                    })
                    .collect::<Result<_>>()?
            };
            let mut candidate = Component::new(def.element_type)?;
            for node in &face_nodes {
                candidate.insert_node(Rc::clone(node));
            }
            let key = candidate.node_id_key();

            let component = match index.get(&key) {
                Some(existing) => Rc::clone(existing),
                None => {
                    self.max_component_id += 1;
                    candidate.set_id(self.max_component_id);
                    let adopted = candidate.into_ref();
                    self.component_cells.push(Rc::clone(&adopted));
                    index.insert(key, Rc::clone(&adopted));
                    adopted
                }
            };
            component.borrow_mut().insert_parent_cell(cell);
            cell.borrow_mut().push_component(component);
        }
        Ok(())
    }

    pub fn find_component_cell(&self, candidate: &Component) -> Option<ComponentRef> {
        let key = candidate.node_id_key();
        self.component_cells
            .iter()
            .find(|c| c.borrow().node_id_key() == key)
            .cloned()
    }

    pub fn clear_component_cells(&mut self) {
        for cell in &self.entity_cells {
            cell.borrow_mut().clear_components_raw();
        }
        self.component_cells.clear();
        self.max_component_id = 0;
    }

    /// A component with no remaining parents is deleted.
    fn sweep_orphan_components(&mut self) {
        self.component_cells.retain(|component| {
            component.borrow_mut().prune_parent_cells();
            component.borrow().num_parent_cells() > 0
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::cell::set_cell_nodes;
    use crate::model::node::Node;

    fn make_node(id: u64, x: f64, y: f64, z: f64) -> NodeRef {
        let node = Node::from_coords(x, y, z).into_ref();
        node.borrow_mut().entity.set_id(id);
        node.borrow_mut().entity.set_my_rankno(0);
        node
    }

    fn tetra(sections: &mut Sections, nodes: &[NodeRef; 4]) -> CellRef {
        let cell = Cell::new(ElementType::Tetra4).unwrap().into_ref();
        set_cell_nodes(&cell, nodes.as_slice());
        sections.insert_cell(Rc::clone(&cell)).unwrap();
        cell
    }

    #[test]
    fn test_insert_cell_assigns_element_ids() {
        let mut sections = Sections::new();
        let nodes: [NodeRef; 4] = std::array::from_fn(|i| make_node(i as u64 + 1, i as f64, 0.0, 0.0));
        let c1 = tetra(&mut sections, &nodes);
        let c2 = tetra(&mut sections, &nodes);
        assert_eq!(c1.borrow().entity.id(), 1);
        assert_eq!(c2.borrow().entity.id(), 2);
        assert_eq!(sections.num_sections(), 1);
        assert_eq!(sections.max_entity_elem_id(), 2);
        let section = &sections.sections()[0];
        assert_eq!(section.elem_id_range(), (1, 2));
    }

    #[test]
    fn test_unsupported_insert_does_not_mutate() {
        let mut sections = Sections::new();
        let cell = Cell::new(ElementType::Bar2).unwrap().into_ref();
        cell.borrow_mut().entity.set_element_type(ElementType::Mixed);
        assert!(sections.insert_cell(Rc::clone(&cell)).is_err());
        assert_eq!(sections.num_entity_cells(), 0);
        assert_eq!(sections.num_sections(), 0);
    }

    #[test]
    fn test_single_tetra_components() {
        let mut sections = Sections::new();
        let nodes: [NodeRef; 4] = [
            make_node(1, 0.0, 0.0, 0.0),
            make_node(2, 1.0, 0.0, 0.0),
            make_node(3, 0.0, 1.0, 0.0),
            make_node(4, 0.0, 0.0, 1.0),
        ];
        let cell = tetra(&mut sections, &nodes);
        sections.create_component_cells().unwrap();
        assert_eq!(sections.num_component_cells(), 4);
        assert_eq!(cell.borrow().num_components(), 4);
        for component in sections.component_cells() {
            assert_eq!(component.borrow().element_type(), ElementType::Tri3);
            assert_eq!(component.borrow().num_parent_cells(), 1);
        }
    }

    #[test]
    fn test_create_component_cells_is_idempotent() {
        let mut sections = Sections::new();
        let nodes: [NodeRef; 4] = [
            make_node(1, 0.0, 0.0, 0.0),
            make_node(2, 1.0, 0.0, 0.0),
            make_node(3, 0.0, 1.0, 0.0),
            make_node(4, 0.0, 0.0, 1.0),
        ];
        tetra(&mut sections, &nodes);
        sections.create_component_cells().unwrap();
        let ids_before: Vec<u64> = sections
            .component_cells()
            .iter()
            .map(|c| c.borrow().id())
            .collect();
        sections.create_component_cells().unwrap();
        let ids_after: Vec<u64> = sections
            .component_cells()
            .iter()
            .map(|c| c.borrow().id())
            .collect();
        assert_eq!(ids_before, ids_after);
    }

    #[test]
    fn test_two_hexa_share_one_face() {
        let mut sections = Sections::new();
        let nodes: Vec<NodeRef> = (0..12)
            .map(|i| make_node(i as u64 + 1, (i % 4) as f64, (i / 4) as f64, 0.0))
            .collect();
        let bottom: Vec<NodeRef> = (0..8).map(|i| Rc::clone(&nodes[i])).collect();
        let top: Vec<NodeRef> = (4..12).map(|i| Rc::clone(&nodes[i])).collect();

        let c1 = Cell::new(ElementType::Hexa8).unwrap().into_ref();
        set_cell_nodes(&c1, &bottom);
        sections.insert_cell(Rc::clone(&c1)).unwrap();
        let c2 = Cell::new(ElementType::Hexa8).unwrap().into_ref();
        set_cell_nodes(&c2, &top);
        sections.insert_cell(Rc::clone(&c2)).unwrap();

        sections.create_component_cells().unwrap();
        assert_eq!(sections.num_component_cells(), 11);

        let shared: Vec<ComponentRef> = sections
            .component_cells()
            .iter()
            .filter(|c| c.borrow().num_parent_cells() == 2)
            .cloned()
            .collect();
        assert_eq!(shared.len(), 1);
        // insertion order of parents: first cell first
        let parents = shared[0].borrow().parent_cells();
        assert!(Rc::ptr_eq(&parents[0], &c1));
        assert!(Rc::ptr_eq(&parents[1], &c2));

        // neighbor query finds the other hexahedron through the shared face
        let neighbors = crate::model::cell::neighbor_cells(&c1);
        assert_eq!(neighbors.len(), 1);
        assert!(Rc::ptr_eq(&neighbors[0], &c2));
    }

    #[test]
    fn test_remove_cells_sweeps_orphan_components() {
        let mut sections = Sections::new();
        let nodes: [NodeRef; 4] = [
            make_node(1, 0.0, 0.0, 0.0),
            make_node(2, 1.0, 0.0, 0.0),
            make_node(3, 0.0, 1.0, 0.0),
            make_node(4, 0.0, 0.0, 1.0),
        ];
        let cell = tetra(&mut sections, &nodes);
        sections.create_component_cells().unwrap();
        assert_eq!(sections.num_component_cells(), 4);

        sections.remove_cells(&[Rc::clone(&cell)]);
        assert_eq!(sections.num_entity_cells(), 0);
        assert_eq!(sections.num_component_cells(), 0);
        for node in &nodes {
            assert_eq!(node.borrow().num_parent_cells(), 0);
        }
    }

    #[test]
    fn test_rebuild_cell_id_renumbers_contiguously() {
        let mut sections = Sections::new();
        sections.set_my_rankno(2);
        let nodes: [NodeRef; 4] = std::array::from_fn(|i| make_node(i as u64 + 1, i as f64, 0.0, 0.0));
        let c1 = tetra(&mut sections, &nodes);
        let c2 = tetra(&mut sections, &nodes);
        let c3 = tetra(&mut sections, &nodes);
        sections.remove_cells(&[Rc::clone(&c2)]);

        sections.rebuild_cell_id();
        assert_eq!(c1.borrow().entity.id(), 1);
        assert_eq!(c3.borrow().entity.id(), 2);
        assert_eq!(c3.borrow().entity.my_rankno(), 2);
        assert!(c3.borrow().entity.exists_previous_rankinfo(0, 3));
    }

    #[test]
    fn test_virtual_pool_sorted_and_searchable() {
        let mut sections = Sections::new();
        for (rank, id) in [(1, 4), (0, 9), (1, 2)] {
            let cell = Cell::new(ElementType::Tetra4).unwrap().into_ref();
            cell.borrow_mut().entity.set_my_rankno(rank);
            cell.borrow_mut().entity.set_id(id);
            sections.insert_virtual_cell(cell);
        }
        let keys: Vec<(i32, u64)> = sections
            .virtual_cells()
            .iter()
            .map(|c| {
                let g = c.borrow().entity.global_id();
                (g.rankno, g.localid)
            })
            .collect();
        assert_eq!(keys, vec![(0, 9), (1, 2), (1, 4)]);
        assert!(sections.find_virtual_cell_by_global_id(1, 2).is_some());
        assert!(sections.find_virtual_cell_by_global_id(2, 2).is_none());
    }
}
