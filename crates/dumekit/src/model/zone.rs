//! A zone: one topologically connected submesh and the orchestration of
//! every cross-rank protocol over it.
//!
//! The zone exclusively owns its node pools, cell pools, solution catalog,
//! user data and boundary bookkeeping. All repartitioning rounds run in a
//! fixed order: export/import → boundary migration → rebuild → id
//! propagation → virtual-halo transfer. Every collective step is wrapped in
//! an ACK so the ranks cannot diverge.

use std::collections::BTreeMap;
use std::rc::Rc;

use itertools::Itertools;
use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::archive::{self, Serializable, SerializeArchive};
use crate::comm::{ack, Communicator};
use crate::error::{Error, Result};
use crate::ids::{GlobalRankId, GlobalRankIdPairList, LocalId, RankNo};
use crate::model::cell::{neighbor_cells, rewire_cell_node, set_cell_nodes, Cell, CellRef};
use crate::model::element_type::ElementType;
use crate::model::grid::{coords_bits, GridCoordinates};
use crate::model::node::{neighbor_nodes, NodeRef};
use crate::model::rank_connectivity::RankConnectivity;
use crate::model::sections::Sections;
use crate::model::solution::FlowSolutions;
use crate::model::types::{DataValue, GridLocation, RealityType, VectorType, ZoneType};
use crate::model::user_data::UserDataList;

pub struct Zone {
    id: LocalId,
    name: String,
    zone_type: ZoneType,
    vertex_size: u64,
    cell_size: u64,
    grid: GridCoordinates,
    sections: Sections,
    solutions: FlowSolutions,
    user_data: UserDataList,
    connectivity: RankConnectivity,
    comm: Rc<dyn Communicator>,
}

impl Zone {
    pub fn new(name: &str, id: LocalId, comm: Rc<dyn Communicator>) -> Self {
        let mut zone = Zone {
            id,
            name: name.to_string(),
            zone_type: ZoneType::Unstructured,
            vertex_size: 0,
            cell_size: 0,
            grid: GridCoordinates::new(),
            sections: Sections::new(),
            solutions: FlowSolutions::new(),
            user_data: UserDataList::new(),
            connectivity: RankConnectivity::new(),
            comm,
        };
        let rankno = zone.comm.rank();
        zone.set_my_rankno(rankno);
        zone
    }

    pub fn id(&self) -> LocalId {
        self.id
    }

    pub fn set_id(&mut self, id: LocalId) {
        self.id = id;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn zone_type(&self) -> ZoneType {
        self.zone_type
    }

    pub fn comm(&self) -> &Rc<dyn Communicator> {
        &self.comm
    }

    pub fn my_rankno(&self) -> RankNo {
        self.comm.rank()
    }

    fn set_my_rankno(&mut self, rankno: RankNo) {
        self.grid.set_my_rankno(rankno);
        self.sections.set_my_rankno(rankno);
        self.connectivity.set_my_rankno(rankno);
    }

    pub fn grid(&self) -> &GridCoordinates {
        &self.grid
    }

    pub fn grid_mut(&mut self) -> &mut GridCoordinates {
        &mut self.grid
    }

    pub fn sections(&self) -> &Sections {
        &self.sections
    }

    pub fn sections_mut(&mut self) -> &mut Sections {
        &mut self.sections
    }

    pub fn solutions(&self) -> &FlowSolutions {
        &self.solutions
    }

    pub fn solutions_mut(&mut self) -> &mut FlowSolutions {
        &mut self.solutions
    }

    pub fn user_data(&self) -> &UserDataList {
        &self.user_data
    }

    pub fn user_data_mut(&mut self) -> &mut UserDataList {
        &mut self.user_data
    }

    pub fn connectivity(&self) -> &RankConnectivity {
        &self.connectivity
    }

    pub fn connectivity_mut(&mut self) -> &mut RankConnectivity {
        &mut self.connectivity
    }

    pub fn vertex_size(&self) -> u64 {
        self.vertex_size
    }

    pub fn set_vertex_size(&mut self, size: u64) {
        self.vertex_size = size;
    }

    pub fn cell_size(&self) -> u64 {
        self.cell_size
    }

    pub fn set_cell_size(&mut self, size: u64) {
        self.cell_size = size;
    }

    pub fn update_vertex_size(&mut self) {
        self.vertex_size = self.grid.num_nodes() as u64;
    }

    pub fn update_cell_size(&mut self) {
        self.cell_size = self.sections.num_entity_cells() as u64;
    }

    /// Largest topological dimension among the owned cells.
    pub fn cell_dimension(&self) -> i32 {
        self.sections
            .entity_cells()
            .iter()
            .map(|c| c.borrow().dimension())
            .max()
            .unwrap_or(0)
    }

    pub fn num_nodes(&self) -> usize {
        self.grid.num_nodes()
    }

    pub fn num_cells(&self) -> usize {
        self.sections.num_entity_cells()
    }

    pub fn node(&self, node_id: LocalId) -> Option<NodeRef> {
        self.grid.node_by_id(node_id)
    }

    pub fn cell(&self, cell_id: LocalId) -> Option<CellRef> {
        self.sections.entity_cell_by_id(cell_id)
    }

    // --- construction ------------------------------------------------------

    pub fn insert_grid_coordinates<T: DataValue>(&mut self, x: T, y: T, z: T) -> LocalId {
        self.grid.insert_grid_coordinates(x, y, z)
    }

    /// Declare that `node_id` is shared with peer `rankno`, which knows it
    /// as `localid`. The node joins the boundary set.
    pub fn insert_rank_connectivity(
        &mut self,
        node_id: LocalId,
        rankno: RankNo,
        localid: LocalId,
    ) -> Result<()> {
        let node = self
            .grid
            .node_by_id(node_id)
            .ok_or_else(|| Error::InvalidParameter(format!("node id {node_id} out of range")))?;
        node.borrow_mut().entity.add_mpi_rankinfo(rankno, localid);
        self.connectivity.insert_node(node);
        Ok(())
    }

    /// Insert one cell from node local ids. Unsupported element types and
    /// non-degenerate duplicate connectivity are rejected without mutating
    /// the sections.
    pub fn insert_cell(&mut self, element_type: ElementType, node_ids: &[LocalId]) -> Result<LocalId> {
        if !element_type.is_supported_cell() {
            return Err(Error::InvalidElementType(format!(
                "cannot insert {element_type} cell"
            )));
        }
        if element_type.num_nodes() != Some(node_ids.len()) {
            return Err(Error::InvalidElementType(format!(
                "{element_type} expects {:?} nodes, got {}",
                element_type.num_nodes(),
                node_ids.len()
            )));
        }
        let mut distinct = node_ids.to_vec();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() != node_ids.len() && !element_type.allows_duplicate_nodes() {
            return Err(Error::InvalidElementType(format!(
                "{element_type} connectivity repeats a node"
            )));
        }
        let mut nodes = Vec::with_capacity(node_ids.len());
        for &node_id in node_ids {
            let node = self.grid.node_by_id(node_id).ok_or_else(|| {
                Error::InvalidParameter(format!("connectivity references unknown node {node_id}"))
            })?;
            nodes.push(node);
        }
        let cell = Cell::new(element_type)?.into_ref();
        set_cell_nodes(&cell, &nodes);
        self.sections.insert_cell(cell)
    }

    /// Bulk connectivity: fixed-size chunks for homogeneous streams, inline
    /// element-type tags for `Mixed`.
    pub fn insert_cells_connectivity(
        &mut self,
        element_type: ElementType,
        stream: &[LocalId],
    ) -> Result<usize> {
        let mut inserted = 0;
        if element_type == ElementType::Mixed {
            let mut pos = 0;
            while pos < stream.len() {
                let tagged = ElementType::from_tag(stream[pos] as i32)?;
                let nnodes = tagged.num_nodes().ok_or_else(|| {
                    Error::InvalidElementType(format!("{tagged} in mixed stream"))
                })?;
                if pos + 1 + nnodes > stream.len() {
                    return Err(Error::InvalidElements(
                        "mixed connectivity stream truncated".into(),
                    ));
                }
                self.insert_cell(tagged, &stream[pos + 1..pos + 1 + nnodes])?;
                inserted += 1;
                pos += 1 + nnodes;
            }
        } else {
            let nnodes = element_type
                .num_nodes()
                .filter(|_| element_type.is_supported_cell())
                .ok_or_else(|| {
                    Error::InvalidElementType(format!("{element_type} in connectivity stream"))
                })?;
            if !stream.len().is_multiple_of(nnodes) {
                return Err(Error::InvalidElements(format!(
                    "connectivity stream length {} not a multiple of {nnodes}",
                    stream.len()
                )));
            }
            for chunk in stream.chunks(nnodes) {
                self.insert_cell(element_type, chunk)?;
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    pub fn create_component_cells(&mut self) -> Result<()> {
        self.sections.create_component_cells()
    }

    // --- solution access ---------------------------------------------------

    pub fn get_solution_scalar_in_node<T: DataValue>(
        &self,
        node_id: LocalId,
        name: &str,
    ) -> Result<T> {
        self.validate_location(name, GridLocation::Vertex)?;
        let node = self
            .grid
            .node_by_local_id(node_id)
            .ok_or_else(|| Error::InvalidParameter(format!("node id {node_id} out of range")))?;
        let value = node.borrow().entity.solution_scalar(name)?;
        Ok(value)
    }

    pub fn set_solution_scalar_in_node<T: DataValue>(
        &mut self,
        node_id: LocalId,
        name: &str,
        value: T,
    ) -> Result<()> {
        let datatype = self.validate_location(name, GridLocation::Vertex)?;
        let node = self
            .grid
            .node_by_local_id(node_id)
            .ok_or_else(|| Error::InvalidParameter(format!("node id {node_id} out of range")))?;
        node.borrow_mut()
            .entity
            .set_solution_scalar_as(name, datatype, value);
        Ok(())
    }

    pub fn get_solution_vector_in_node<T: DataValue>(
        &self,
        node_id: LocalId,
        name: &str,
    ) -> Result<Vec<T>> {
        self.validate_location(name, GridLocation::Vertex)?;
        let node = self
            .grid
            .node_by_local_id(node_id)
            .ok_or_else(|| Error::InvalidParameter(format!("node id {node_id} out of range")))?;
        let values = node.borrow().entity.solution_vector(name)?;
        Ok(values)
    }

    pub fn set_solution_vector_in_node<T: DataValue>(
        &mut self,
        node_id: LocalId,
        name: &str,
        values: &[T],
    ) -> Result<()> {
        let datatype = self.validate_location(name, GridLocation::Vertex)?;
        let node = self
            .grid
            .node_by_local_id(node_id)
            .ok_or_else(|| Error::InvalidParameter(format!("node id {node_id} out of range")))?;
        node.borrow_mut()
            .entity
            .set_solution_vector_as(name, datatype, values);
        Ok(())
    }

    pub fn get_solution_scalar_in_cell<T: DataValue>(
        &self,
        cell_id: LocalId,
        name: &str,
    ) -> Result<T> {
        self.validate_location(name, GridLocation::CellCenter)?;
        let cell = self
            .sections
            .cell_by_local_id(cell_id)
            .ok_or_else(|| Error::InvalidParameter(format!("cell id {cell_id} out of range")))?;
        let value = cell.borrow().entity.solution_scalar(name)?;
        Ok(value)
    }

    pub fn set_solution_scalar_in_cell<T: DataValue>(
        &mut self,
        cell_id: LocalId,
        name: &str,
        value: T,
    ) -> Result<()> {
        let datatype = self.validate_location(name, GridLocation::CellCenter)?;
        let cell = self
            .sections
            .cell_by_local_id(cell_id)
            .ok_or_else(|| Error::InvalidParameter(format!("cell id {cell_id} out of range")))?;
        cell.borrow_mut()
            .entity
            .set_solution_scalar_as(name, datatype, value);
        Ok(())
    }

    pub fn get_solution_vector_in_cell<T: DataValue>(
        &self,
        cell_id: LocalId,
        name: &str,
    ) -> Result<Vec<T>> {
        self.validate_location(name, GridLocation::CellCenter)?;
        let cell = self
            .sections
            .cell_by_local_id(cell_id)
            .ok_or_else(|| Error::InvalidParameter(format!("cell id {cell_id} out of range")))?;
        let values = cell.borrow().entity.solution_vector(name)?;
        Ok(values)
    }

    pub fn set_solution_vector_in_cell<T: DataValue>(
        &mut self,
        cell_id: LocalId,
        name: &str,
        values: &[T],
    ) -> Result<()> {
        let datatype = self.validate_location(name, GridLocation::CellCenter)?;
        let cell = self
            .sections
            .cell_by_local_id(cell_id)
            .ok_or_else(|| Error::InvalidParameter(format!("cell id {cell_id} out of range")))?;
        cell.borrow_mut()
            .entity
            .set_solution_vector_as(name, datatype, values);
        Ok(())
    }

    /// Broadcast one value over the declared vector size of `name` on every
    /// entity at the field's grid location.
    pub fn initialize_value_entities<T: DataValue>(&mut self, name: &str, value: T) -> Result<()> {
        let config = self
            .solutions
            .field(name)
            .ok_or_else(|| Error::NotFoundSolution(name.to_string()))?
            .clone();
        match config.grid_location {
            GridLocation::Vertex => {
                for node in self.grid.nodes() {
                    node.borrow_mut().entity.initialize_value_as(
                        name,
                        config.data_type,
                        config.vector_type,
                        config.nvector_size,
                        value,
                    );
                }
            }
            GridLocation::CellCenter => {
                for cell in self.sections.entity_cells() {
                    cell.borrow_mut().entity.initialize_value_as(
                        name,
                        config.data_type,
                        config.vector_type,
                        config.nvector_size,
                        value,
                    );
                }
            }
        }
        Ok(())
    }

    /// Catalog lookup for one access: the name must be declared and live at
    /// the expected location. Returns the declared datatype, which wins
    /// over the caller's value type.
    fn validate_location(
        &self,
        name: &str,
        expected: GridLocation,
    ) -> Result<crate::model::types::DataType> {
        let config = self
            .solutions
            .field(name)
            .ok_or_else(|| Error::NotFoundSolution(name.to_string()))?;
        if config.grid_location != expected {
            return Err(Error::InvalidFlowSolution(format!(
                "field {name} lives at {:?}, not {:?}",
                config.grid_location, expected
            )));
        }
        Ok(config.data_type)
    }

    pub fn solution_info(&self, name: &str) -> Result<&crate::model::solution::SolutionFieldConfig> {
        self.solutions
            .field(name)
            .ok_or_else(|| Error::NotFoundSolution(name.to_string()))
    }

    // --- neighbor queries --------------------------------------------------

    pub fn connectivity_cells_of_node(&self, node_id: LocalId) -> Result<Vec<CellRef>> {
        let node = self
            .grid
            .node_by_local_id(node_id)
            .ok_or_else(|| Error::InvalidParameter(format!("node id {node_id} out of range")))?;
        Ok(crate::model::node::connectivity_cells(&node))
    }

    pub fn neighbor_nodes_of_node(&self, node_id: LocalId) -> Result<Vec<NodeRef>> {
        let node = self
            .grid
            .node_by_local_id(node_id)
            .ok_or_else(|| Error::InvalidParameter(format!("node id {node_id} out of range")))?;
        Ok(neighbor_nodes(&node))
    }

    pub fn neighbor_cells_of_cell(&self, cell_id: LocalId) -> Result<Vec<CellRef>> {
        let cell = self
            .sections
            .cell_by_local_id(cell_id)
            .ok_or_else(|| Error::InvalidParameter(format!("cell id {cell_id} out of range")))?;
        Ok(neighbor_cells(&cell))
    }

    // --- export / import ---------------------------------------------------

    /// Remove the given cells from this rank ahead of their migration.
    /// Induced nodes still referenced by remaining cells become boundary
    /// nodes (self-marked as shared); orphaned nodes are removed outright.
    /// Returns the surviving boundary nodes.
    pub fn export_cells(&mut self, export_cells: &[CellRef]) -> Result<Vec<NodeRef>> {
        self.connectivity.clear_search_table();
        self.sections.clear_component_cells();

        // induced nodes, collected before the connectivity is torn down
        let mut seen = rustc_hash::FxHashSet::default();
        let mut induced: Vec<NodeRef> = Vec::new();
        for cell in export_cells {
            for node in cell.borrow().nodes() {
                if seen.insert(Rc::as_ptr(node)) {
                    induced.push(Rc::clone(node));
                }
            }
        }

        self.sections.remove_cells(export_cells);

        let mut removed = Vec::new();
        let mut boundary = Vec::new();
        for node in induced {
            if node.borrow().num_parent_cells() == 0 {
                removed.push(node);
            } else {
                boundary.push(node);
            }
        }
        self.connectivity.remove_boundary_nodes(&removed);
        self.grid.remove_nodes(&removed);

        for node in &boundary {
            let (rankno, id) = {
                let entity = &node.borrow().entity;
                (entity.my_rankno(), entity.id())
            };
            node.borrow_mut().entity.add_mpi_rankinfo(rankno, id);
            self.connectivity.insert_node(Rc::clone(node));
        }

        self.sections.create_component_cells()?;
        debug!(
            "rank {}: exported {} cells, removed {} nodes, {} boundary nodes kept",
            self.my_rankno(),
            export_cells.len(),
            removed.len(),
            boundary.len()
        );
        Ok(boundary)
    }

    /// Integrate cells received from peers. Incoming node instances that
    /// correspond to known boundary nodes are discarded and the cells are
    /// rewired to the local instance; the rest are adopted under their
    /// foreign identity. Returns the adopted nodes, sorted by global id.
    pub fn import_cells(&mut self, import_cells: &[CellRef]) -> Result<Vec<NodeRef>> {
        self.connectivity.clear_search_table();
        self.connectivity.create_search_table();

        let mut canonical: FxHashMap<GlobalRankId, NodeRef> = FxHashMap::default();
        let mut import_nodes: Vec<NodeRef> = Vec::new();

        for cell in import_cells {
            let num_nodes = cell.borrow().num_nodes();
            for slot in 0..num_nodes {
                let incoming = Rc::clone(&cell.borrow().nodes()[slot]);
                let incoming_gid = incoming.borrow().entity.global_id();

                let dest = if let Some(found) = canonical.get(&incoming_gid) {
                    Rc::clone(found)
                } else {
                    let local = self.connectivity.find_node_like(&incoming).map(|found| {
                        // reuse the canonical handle when the local node was
                        // already adopted under its own identity
                        let own_gid = found.borrow().entity.global_id();
                        canonical.get(&own_gid).cloned().unwrap_or(found)
                    });
                    let (dest, is_new) = match local {
                        Some(existing) => (existing, false),
                        None => (incoming.borrow().clone_node().into_ref(), true),
                    };
                    dest.borrow_mut()
                        .entity
                        .add_mpi_rankinfo(incoming_gid.rankno, incoming_gid.localid);
                    dest.borrow_mut()
                        .entity
                        .add_previous_rankinfo(incoming_gid.rankno, incoming_gid.localid);
                    if is_new {
                        let key = dest.borrow().entity.global_id();
                        let pos = import_nodes
                            .partition_point(|n| n.borrow().entity.global_id() <= key);
                        import_nodes.insert(pos, Rc::clone(&dest));
                    }
                    canonical.insert(incoming_gid, Rc::clone(&dest));
                    let own_gid = dest.borrow().entity.global_id();
                    canonical.entry(own_gid).or_insert_with(|| Rc::clone(&dest));
                    dest
                };
                rewire_cell_node(cell, slot, &dest);
                dest.borrow_mut().add_parent_cell(cell);
            }
        }

        // adopt the cells: reset identity markers, auto-assign element ids
        for cell in import_cells {
            {
                let mut c = cell.borrow_mut();
                c.entity.set_reality_type(RealityType::Actual);
                c.entity.erase_invalid_mpi_rankinfos();
                let gid = c.entity.global_id();
                c.entity.add_previous_rankinfo(gid.rankno, gid.localid);
                c.entity.set_id(0);
            }
            self.sections.insert_cell(Rc::clone(cell))?;
        }

        for node in &import_nodes {
            self.grid.push_node(Rc::clone(node));
        }

        // every touched node is provisionally boundary; migration drops the
        // ones that are not actually shared
        for node in &import_nodes {
            if node.borrow().entity.num_mpi_rankinfos() > 0 {
                self.connectivity.insert_node(Rc::clone(node));
            }
        }

        self.sections.create_component_cells_touching(&import_nodes)?;
        debug!(
            "rank {}: imported {} cells, adopted {} nodes",
            self.my_rankno(),
            import_cells.len(),
            import_nodes.len()
        );
        Ok(import_nodes)
    }

    /// One full repartitioning round from an explicit plan: serialize the
    /// leaving cells while they are intact, exchange, then export, import,
    /// reconcile boundaries, rebuild, and refresh the halo, in that order.
    pub fn repartition(&mut self, plan: &crate::partition::PartitionPlan) -> Result<()> {
        let mut per_dest: BTreeMap<RankNo, Vec<CellRef>> = BTreeMap::new();
        let mut local: Result<()> = Ok(());
        'resolve: for (&dest, gids) in &plan.exports {
            for gid in gids {
                match self
                    .sections
                    .find_entity_cell_by_global_id(gid.rankno, gid.localid)
                {
                    Some(cell) => {
                        // destination marker, dropped on the receiving side
                        cell.borrow_mut().entity.add_mpi_rankinfo(dest, 0);
                        per_dest.entry(dest).or_default().push(cell);
                    }
                    None => {
                        local = Err(Error::InvalidParameter(format!(
                            "export cell {gid} not found on rank {}",
                            self.my_rankno()
                        )));
                        break 'resolve;
                    }
                }
            }
        }
        ack(self.comm.as_ref(), local)?;

        let buffers = serialize_cell_map(&per_dest);
        ack(self.comm.as_ref(), buffers.as_ref().map(|_| ()).map_err(Clone::clone))?;
        let received = self.comm.exchange(&buffers?)?;
        let incoming = deserialize_cell_map(&received);
        ack(self.comm.as_ref(), incoming.as_ref().map(|_| ()).map_err(Clone::clone))?;

        let all_exports: Vec<CellRef> = per_dest.into_values().flatten().collect();
        self.export_cells(&all_exports)?;

        let mut imports = Vec::new();
        for (_, cells) in incoming? {
            imports.extend(cells);
        }
        let import_nodes = self.import_cells(&imports)?;

        self.migration_boundary()?;
        self.rebuild_zone(&import_nodes)?;
        self.transfer_virtual_cells()?;
        Ok(())
    }

    // --- boundary migration ------------------------------------------------

    /// Reconcile the symmetry of the boundary maps after an import/export
    /// round. Pairs (my current id → peer expected id) travel to every
    /// foreign peer; unresolvable entries are reported back and dropped on
    /// the sender. Nodes whose mpi lists empty out cease to be boundary
    /// nodes.
    pub fn migration_boundary(&mut self) -> Result<()> {
        let sends = self.connectivity.build_boundary_pairs();
        let buffers = serialize_pair_map(&sends);
        ack(self.comm.as_ref(), buffers.as_ref().map(|_| ()).map_err(Clone::clone))?;
        let received = self.comm.exchange(&buffers?)?;
        let incoming = deserialize_pair_map(&received);
        ack(self.comm.as_ref(), incoming.as_ref().map(|_| ()).map_err(Clone::clone))?;
        let incoming = incoming?;

        // resolve incoming expectations; collect what cannot be resolved
        let mut unresolved: BTreeMap<RankNo, GlobalRankIdPairList> = BTreeMap::new();
        for (&src_rank, pairs) in &incoming {
            for pair in pairs.iter() {
                match self
                    .grid
                    .find_node_by_global_id(pair.dest.rankno, pair.dest.localid)
                {
                    Some(node) => {
                        node.borrow_mut()
                            .entity
                            .add_mpi_rankinfo(pair.src.rankno, pair.src.localid);
                        self.connectivity.insert_node(node);
                    }
                    None => {
                        unresolved.entry(src_rank).or_default().push_back(*pair);
                    }
                }
            }
        }

        let reply_buffers = serialize_pair_map(&unresolved);
        ack(self.comm.as_ref(), reply_buffers.as_ref().map(|_| ()).map_err(Clone::clone))?;
        let replies = self.comm.exchange(&reply_buffers?)?;
        let replies = deserialize_pair_map(&replies);
        ack(self.comm.as_ref(), replies.as_ref().map(|_| ()).map_err(Clone::clone))?;
        for pairs in replies?.values() {
            for pair in pairs.iter() {
                // the peer cannot resolve pair.dest: drop that entry from
                // the node we advertised as pair.src
                if let Some(node) = self
                    .grid
                    .find_node_by_global_id(pair.src.rankno, pair.src.localid)
                {
                    let _ = node
                        .borrow_mut()
                        .entity
                        .remove_mpi_rankinfo(pair.dest.rankno, pair.dest.localid);
                }
            }
        }

        self.connectivity.drop_empty_boundary_nodes();
        self.connectivity.sort_boundary_nodes();
        self.connectivity.clear_search_table();
        ack(self.comm.as_ref(), Ok(()))
    }

    // --- id propagation ----------------------------------------------------

    /// Publish (previous → new) identities to every peer after a rebuild.
    /// Two rounds: the first rewrites entries for ranks the peers already
    /// knew, the second covers entries that only became addressable once
    /// the first round repaired the maps.
    pub fn transfer_updated_ids(&mut self) -> Result<()> {
        for round in 0..2 {
            let sends = self.connectivity.build_updated_id_pairs();
            let buffers = serialize_pair_map(&sends);
            ack(self.comm.as_ref(), buffers.as_ref().map(|_| ()).map_err(Clone::clone))?;
            let received = self.comm.exchange(&buffers?)?;
            let incoming = deserialize_pair_map(&received);
            ack(self.comm.as_ref(), incoming.as_ref().map(|_| ()).map_err(Clone::clone))?;

            self.connectivity.create_search_table();
            let mut applied = 0usize;
            for pairs in incoming?.values() {
                for pair in pairs.iter() {
                    if pair.src == pair.dest {
                        continue;
                    }
                    if let Some(node) = self
                        .connectivity
                        .find_mpi_rankinfo(pair.dest.rankno, pair.dest.localid)
                    {
                        if node
                            .borrow_mut()
                            .entity
                            .update_mpi_rankinfo(pair.dest, pair.src)
                            .is_ok()
                        {
                            applied += 1;
                        }
                    }
                }
            }
            self.connectivity.create_search_table();
            if round == 1 && applied > 0 {
                warn!(
                    "rank {}: id propagation applied {applied} updates in the confirmation round",
                    self.my_rankno()
                );
            }
        }

        self.connectivity.erase_rank_connectivity();
        self.connectivity.sort_boundary_nodes();
        self.connectivity.clear_search_table();
        ack(self.comm.as_ref(), Ok(()))
    }

    // --- rebuild -----------------------------------------------------------

    /// Renumber everything after an import/export round and propagate the
    /// new ids. The order is fixed; the first failing step aborts the
    /// sequence and the model must be discarded.
    pub fn rebuild_zone(&mut self, import_nodes: &[NodeRef]) -> Result<()> {
        if import_nodes.is_empty() {
            self.sections.create_component_cells()?;
        } else {
            self.sections.create_component_cells_touching(import_nodes)?;
        }
        self.grid.rebuild_nodes();
        self.grid.rebuild_virtual_nodes();
        self.sections.rebuild_cell_id();
        self.connectivity.sort_boundary_nodes();
        self.transfer_updated_ids()?;
        self.update_vertex_size();
        self.update_cell_size();
        self.clear_previous_infos();
        Ok(())
    }

    pub fn clear_previous_infos(&mut self) {
        self.grid.clear_previous_infos();
        self.sections.clear_previous_infos();
    }

    // --- virtual halo ------------------------------------------------------

    pub fn clear_virtual_cells(&mut self) {
        self.sections.clear_virtual_cells();
        self.grid.clear_virtual_nodes();
    }

    /// Rebuild the one-layer halo: for every boundary node, ship the owned
    /// adjacent cells to every peer sharing that node. Returns the virtual
    /// nodes adopted on this rank.
    pub fn transfer_virtual_cells(&mut self) -> Result<Vec<NodeRef>> {
        self.clear_virtual_cells();

        let my_rank = self.my_rankno();
        let mut per_peer: BTreeMap<RankNo, Vec<CellRef>> = BTreeMap::new();
        let mut seen: BTreeMap<RankNo, rustc_hash::FxHashSet<*const std::cell::RefCell<Cell>>> =
            BTreeMap::new();
        for node in self.connectivity.boundary_nodes() {
            let peers: Vec<RankNo> = node
                .borrow()
                .entity
                .mpi_rankinfos()
                .iter()
                .map(|info| info.rankno)
                .filter(|&r| r != my_rank && r >= 0)
                .unique()
                .collect();
            if peers.is_empty() {
                continue;
            }
            for cell in node.borrow().parent_cells() {
                let owned = {
                    let entity = &cell.borrow().entity;
                    entity.reality_type() == RealityType::Actual && entity.my_rankno() == my_rank
                };
                if !owned {
                    continue;
                }
                for &peer in &peers {
                    if seen.entry(peer).or_default().insert(Rc::as_ptr(&cell)) {
                        per_peer.entry(peer).or_default().push(Rc::clone(&cell));
                    }
                }
            }
        }

        let buffers = serialize_cell_map(&per_peer);
        ack(self.comm.as_ref(), buffers.as_ref().map(|_| ()).map_err(Clone::clone))?;
        let received = self.comm.exchange(&buffers?)?;
        let incoming = deserialize_cell_map(&received);
        ack(self.comm.as_ref(), incoming.as_ref().map(|_| ()).map_err(Clone::clone))?;

        let mut all_virtuals = Vec::new();
        for (_, cells) in incoming? {
            all_virtuals.extend(cells);
        }
        let virtual_nodes = self.import_virtual_cells(&all_virtuals)?;

        self.grid.rebuild_virtual_nodes();
        self.sections.rebuild_virtual_cells();
        ack(self.comm.as_ref(), Ok(()))?;
        Ok(virtual_nodes)
    }

    /// Wire received halo cells into the virtual pools. Nodes the rank
    /// already holds (its own boundary nodes, or previously adopted virtual
    /// nodes) are reused; the rest are adopted as virtual nodes.
    pub fn import_virtual_cells(&mut self, import_virtuals: &[CellRef]) -> Result<Vec<NodeRef>> {
        let my_rank = self.my_rankno();
        self.connectivity.create_search_table();
        let mut adopted: Vec<NodeRef> = Vec::new();

        for cell in import_virtuals {
            let gid = cell.borrow().entity.global_id();
            if gid.rankno == my_rank {
                continue;
            }
            if self
                .sections
                .find_virtual_cell_by_global_id(gid.rankno, gid.localid)
                .is_some()
            {
                continue;
            }

            let num_nodes = cell.borrow().num_nodes();
            for slot in 0..num_nodes {
                let incoming = Rc::clone(&cell.borrow().nodes()[slot]);
                let node_gid = incoming.borrow().entity.global_id();

                let dest = if node_gid.rankno == my_rank {
                    self.grid
                        .find_node_by_global_id(node_gid.rankno, node_gid.localid)
                } else {
                    find_sorted_by_gid(&adopted, node_gid)
                        .or_else(|| {
                            self.grid
                                .find_virtual_node_by_global_id(node_gid.rankno, node_gid.localid)
                        })
                        .or_else(|| {
                            self.connectivity
                                .find_mpi_rankinfo(node_gid.rankno, node_gid.localid)
                        })
                };
                let dest = match dest {
                    Some(found) => found,
                    None => {
                        incoming
                            .borrow_mut()
                            .entity
                            .set_reality_type(RealityType::Virtual);
                        let pos = adopted
                            .partition_point(|n| n.borrow().entity.global_id() <= node_gid);
                        adopted.insert(pos, Rc::clone(&incoming));
                        incoming
                    }
                };
                rewire_cell_node(cell, slot, &dest);
                dest.borrow_mut().add_parent_cell(cell);
            }
            self.sections.insert_virtual_cell(Rc::clone(cell));
        }

        for node in &adopted {
            self.grid.insert_virtual_node(Rc::clone(node));
        }
        self.connectivity.clear_search_table();
        Ok(adopted)
    }

    // --- join --------------------------------------------------------------

    /// Merge another zone read on this process into this one. Coincident
    /// coordinates collapse to the first arrival; the duplicate keeps a
    /// common-node link and its cells are rewired.
    pub fn join_zone(&mut self, other: Zone) -> Result<()> {
        let mut by_coords: FxHashMap<[u64; 3], NodeRef> = FxHashMap::default();
        for node in self.grid.nodes() {
            by_coords.insert(coords_bits(node.borrow().coords()), Rc::clone(node));
        }

        let mut merged = 0usize;
        for node in other.grid.nodes() {
            let key = coords_bits(node.borrow().coords());
            match by_coords.get(&key) {
                Some(kept) => {
                    // silent merge; the collision may or may not be a
                    // declared shared node
                    let gid = node.borrow().entity.global_id();
                    kept.borrow_mut()
                        .entity
                        .add_previous_rankinfo(gid.rankno, gid.localid);
                    let infos: Vec<GlobalRankId> = node
                        .borrow()
                        .entity
                        .mpi_rankinfos()
                        .iter()
                        .copied()
                        .collect();
                    for info in infos {
                        kept.borrow_mut()
                            .entity
                            .add_mpi_rankinfo(info.rankno, info.localid);
                    }
                    node.borrow_mut().set_common_node(kept);
                    merged += 1;
                }
                None => {
                    by_coords.insert(key, Rc::clone(node));
                    self.grid.push_node(Rc::clone(node));
                }
            }
        }
        debug!(
            "rank {}: join merged {merged} coincident nodes from zone {}",
            self.my_rankno(),
            other.name()
        );

        for cell in other.sections.entity_cells() {
            let num_nodes = cell.borrow().num_nodes();
            for slot in 0..num_nodes {
                let current = Rc::clone(&cell.borrow().nodes()[slot]);
                let target = current.borrow().common_node();
                if let Some(kept) = target {
                    rewire_cell_node(cell, slot, &kept);
                    kept.borrow_mut().add_parent_cell(cell);
                }
            }
            cell.borrow_mut().entity.set_id(0);
            self.sections.insert_cell(Rc::clone(cell))?;
        }

        if self.solutions.is_empty() {
            self.solutions = other.solutions.clone();
        } else if !other.solutions.is_empty() && self.solutions != other.solutions {
            return Err(Error::InvalidFlowSolution(
                "joined zones declare different solution catalogs".into(),
            ));
        }
        for data in other.user_data.iter() {
            if !self.user_data.exists(&data.name) {
                match &data.values {
                    crate::model::solution::SolutionValues::Integer(v) => {
                        self.user_data.set_array(&data.name, &data.dims, v)?
                    }
                    crate::model::solution::SolutionValues::LongInteger(v) => {
                        self.user_data.set_array(&data.name, &data.dims, v)?
                    }
                    crate::model::solution::SolutionValues::RealSingle(v) => {
                        self.user_data.set_array(&data.name, &data.dims, v)?
                    }
                    crate::model::solution::SolutionValues::RealDouble(v) => {
                        self.user_data.set_array(&data.name, &data.dims, v)?
                    }
                }
            }
        }

        // boundary registrations for merged-in shared nodes
        let boundary: Vec<NodeRef> = self
            .grid
            .nodes()
            .iter()
            .filter(|n| n.borrow().entity.num_mpi_rankinfos() > 0)
            .cloned()
            .collect();
        for node in boundary {
            self.connectivity.insert_node(node);
        }
        Ok(())
    }

    // --- broadcast ---------------------------------------------------------

    /// Share the structural skeleton from rank 0. Empty peers adopt it;
    /// non-empty peers verify equality and fail on mismatch.
    pub fn broadcast_zone(&mut self) -> Result<()> {
        let root: RankNo = 0;
        let mut buf = if self.comm.rank() == root {
            archive::to_bytes(&ZoneSkeleton::capture(self))?
        } else {
            Vec::new()
        };
        self.comm.broadcast_bytes(root, &mut buf)?;

        let local: Result<()> = if self.comm.rank() == root {
            Ok(())
        } else {
            let mut skeleton = ZoneSkeleton::default();
            archive::read_into(&mut skeleton, &buf).and_then(|()| skeleton.apply(self))
        };
        ack(self.comm.as_ref(), local)
    }

    // --- validation --------------------------------------------------------

    /// Structural invariant check over ids, components and boundary state.
    pub fn validate(&self) -> bool {
        let mut ok = true;
        for (i, node) in self.grid.nodes().iter().enumerate() {
            if node.borrow().entity.id() != i as LocalId + 1 {
                debug!("node at index {i} has id {}", node.borrow().entity.id());
                ok = false;
                break;
            }
        }
        for (i, cell) in self.sections.entity_cells().iter().enumerate() {
            if cell.borrow().entity.id() != i as LocalId + 1 {
                debug!("cell at index {i} has id {}", cell.borrow().entity.id());
                ok = false;
                break;
            }
        }
        for component in self.sections.component_cells() {
            if component.borrow().num_parent_cells() == 0 {
                debug!("orphan component cell {}", component.borrow().id());
                ok = false;
            }
        }
        if !self.connectivity.validate_boundary() {
            ok = false;
        }
        let my_rank = self.my_rankno();
        for cell in self.sections.virtual_cells() {
            if cell.borrow().entity.my_rankno() == my_rank {
                debug!("virtual cell owned by this rank");
                ok = false;
            }
        }
        ok
    }
}

// --- wire helpers ----------------------------------------------------------

fn serialize_pair_map(
    map: &BTreeMap<RankNo, GlobalRankIdPairList>,
) -> Result<BTreeMap<RankNo, Vec<u8>>> {
    let mut buffers = BTreeMap::new();
    for (&rank, pairs) in map {
        let bytes = archive::to_bytes(pairs)?;
        debug_assert_eq!(bytes.len(), pairs.comm_size());
        buffers.insert(rank, bytes);
    }
    Ok(buffers)
}

fn deserialize_pair_map(
    buffers: &BTreeMap<RankNo, Vec<u8>>,
) -> Result<BTreeMap<RankNo, GlobalRankIdPairList>> {
    let mut map = BTreeMap::new();
    for (&rank, bytes) in buffers {
        let mut pairs = GlobalRankIdPairList::new();
        archive::read_into(&mut pairs, bytes)?;
        map.insert(rank, pairs);
    }
    Ok(map)
}

fn serialize_cell_map(map: &BTreeMap<RankNo, Vec<CellRef>>) -> Result<BTreeMap<RankNo, Vec<u8>>> {
    let mut buffers = BTreeMap::new();
    for (&rank, cells) in map {
        // two-pass sizing over the whole batch
        let mut counting = SerializeArchive::counting();
        counting.write_u64(cells.len() as u64);
        for cell in cells {
            cell.borrow().serialize(&mut counting)?;
        }
        let mut buf = vec![0u8; counting.overflow_size()];
        let mut writer = SerializeArchive::writer(&mut buf);
        writer.write_u64(cells.len() as u64);
        for cell in cells {
            cell.borrow().serialize(&mut writer)?;
        }
        if !writer.validate_finish() {
            return Err(Error::Serialize("cell batch overflowed sized buffer".into()));
        }
        buffers.insert(rank, buf);
    }
    Ok(buffers)
}

fn deserialize_cell_map(
    buffers: &BTreeMap<RankNo, Vec<u8>>,
) -> Result<BTreeMap<RankNo, Vec<CellRef>>> {
    let mut map = BTreeMap::new();
    for (&rank, bytes) in buffers {
        let mut reader = SerializeArchive::reader(bytes);
        let count = reader.read_u64()? as usize;
        let mut cells = Vec::with_capacity(count);
        for _ in 0..count {
            let mut cell = Cell::new(ElementType::Bar2)?;
            cell.deserialize(&mut reader)?;
            cells.push(cell.into_ref());
        }
        if !reader.validate_finish() {
            return Err(Error::Deserialize("cell batch read failed".into()));
        }
        map.insert(rank, cells);
    }
    Ok(map)
}

fn find_sorted_by_gid(nodes: &[NodeRef], gid: GlobalRankId) -> Option<NodeRef> {
    let pos = nodes.partition_point(|n| n.borrow().entity.global_id() < gid);
    let node = nodes.get(pos)?;
    (node.borrow().entity.global_id() == gid).then(|| Rc::clone(node))
}

// --- structural skeleton ----------------------------------------------------

/// The broadcastable shape of a zone: identity, sections, solution catalog
/// and user data. No entities travel here.
#[derive(Default)]
struct ZoneSkeleton {
    id: LocalId,
    name: String,
    vertex_size: u64,
    cell_size: u64,
    sections: Vec<(LocalId, String, ElementType)>,
    solutions: FlowSolutions,
    user_data: UserDataList,
}

impl ZoneSkeleton {
    fn capture(zone: &Zone) -> ZoneSkeleton {
        ZoneSkeleton {
            id: zone.id,
            name: zone.name.clone(),
            vertex_size: zone.vertex_size,
            cell_size: zone.cell_size,
            sections: zone
                .sections
                .sections()
                .iter()
                .map(|s| (s.id(), s.name().to_string(), s.element_type()))
                .collect(),
            solutions: zone.solutions.clone(),
            user_data: zone.user_data.clone(),
        }
    }

    /// Adopt into an empty zone, or verify an already-populated one.
    fn apply(self, zone: &mut Zone) -> Result<()> {
        let empty = zone.sections.num_sections() == 0
            && zone.solutions.is_empty()
            && zone.grid.num_nodes() == 0;
        if empty {
            zone.id = self.id;
            zone.name = self.name;
            zone.vertex_size = self.vertex_size;
            zone.cell_size = self.cell_size;
            for (_, name, element_type) in &self.sections {
                zone.sections.create_section(name, *element_type)?;
            }
            zone.solutions = self.solutions;
            zone.user_data = self.user_data;
            return Ok(());
        }
        let mine = ZoneSkeleton::capture(zone);
        if mine.name != self.name || mine.solutions != self.solutions {
            return Err(Error::InvalidZone(format!(
                "zone {} structure differs from the broadcast skeleton",
                zone.name
            )));
        }
        Ok(())
    }
}

impl Serializable for ZoneSkeleton {
    fn serialize(&self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        archive.write_u64(self.id);
        archive.write_str(&self.name);
        archive.write_i32(ZoneType::Unstructured as i32);
        archive.write_u64(self.vertex_size);
        archive.write_u64(self.cell_size);
        archive.write_u64(self.sections.len() as u64);
        for (id, name, element_type) in &self.sections {
            archive.write_u64(*id);
            archive.write_str(name);
            archive.write_i32(element_type.tag());
        }
        self.solutions.serialize(archive)?;
        self.user_data.serialize(archive)
    }

    fn deserialize(&mut self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        self.id = archive.read_u64()?;
        self.name = archive.read_str()?;
        let _zone_type = archive.read_i32()?;
        self.vertex_size = archive.read_u64()?;
        self.cell_size = archive.read_u64()?;
        let count = archive.read_u64()? as usize;
        self.sections.clear();
        for _ in 0..count {
            let id = archive.read_u64()?;
            let name = archive.read_str()?;
            let element_type = ElementType::from_tag(archive.read_i32()?)
                .map_err(|e| Error::Deserialize(format!("section element type: {e}")))?;
            self.sections.push((id, name, element_type));
        }
        self.solutions.deserialize(archive)?;
        self.user_data.deserialize(archive)
    }
}
