//! The in-memory mesh model: a multi-zone root object holding the
//! communicator, the time-series state and the index-file configuration,
//! and orchestrating load, store, broadcast and repartitioning.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, warn};

use crate::archive::{self, Serializable, SerializeArchive};
use crate::comm::{ack, Communicator, SerialComm};
use crate::error::{Error, Result, Warning};
use crate::ids::{LocalId, RankNo};
use crate::io::{
    self, BaseDoc, BaseIterativeDoc, DfiConfig, LinkDocument, MeshDocument, WriteOptions,
    WriterInfo,
};
use crate::partition::{plan_from_assignment, CellGraph, GreedyPartitioner, Partitioner};

pub mod cell;
pub mod coords;
pub mod element_type;
pub mod entity;
pub mod grid;
pub mod node;
pub mod rank_connectivity;
pub mod sections;
pub mod solution;
pub mod types;
pub mod user_data;
pub mod zone;

pub use cell::{Cell, CellRef, Component, ComponentRef};
pub use coords::CoordsValue;
pub use element_type::{ElementClass, ElementType};
pub use entity::Entity;
pub use grid::GridCoordinates;
pub use node::{Node, NodeRef};
pub use rank_connectivity::RankConnectivity;
pub use sections::{ElementsSection, Sections};
pub use solution::{FlowSolutions, SolutionField, SolutionFieldConfig};
pub use types::{DataType, DataValue, GridLocation, RealityType, SimulationType, VectorType};
pub use user_data::{UserData, UserDataList};
pub use zone::Zone;

/// Current time-series position of the model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterativeData {
    pub step: u64,
    pub time: f64,
    pub average: Option<(u64, f64)>,
}

pub struct Model {
    name: String,
    cell_dimension: i32,
    physical_dimension: i32,
    simulation_type: SimulationType,
    zones: Vec<Zone>,
    iterative: Option<IterativeData>,
    config: DfiConfig,
    base_dir: PathBuf,
    comm: Rc<dyn Communicator>,
    writer_info: WriterInfo,
    partitioner: Option<Box<dyn Partitioner>>,
}

impl Default for Model {
    fn default() -> Self {
        Model::new(Rc::new(SerialComm))
    }
}

impl Model {
    pub fn new(comm: Rc<dyn Communicator>) -> Self {
        let writer_info = WriterInfo {
            version: io::WRITER_VERSION.to_string(),
            process_size: comm.size(),
            rankno: comm.rank(),
        };
        Model {
            name: "Base".to_string(),
            cell_dimension: 3,
            physical_dimension: 3,
            simulation_type: SimulationType::Unknown,
            zones: Vec::new(),
            iterative: None,
            config: DfiConfig::default(),
            base_dir: PathBuf::from("."),
            comm,
            writer_info,
            partitioner: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn cell_dimension(&self) -> i32 {
        self.cell_dimension
    }

    pub fn set_cell_dimension(&mut self, dimension: i32) {
        self.cell_dimension = dimension;
    }

    pub fn physical_dimension(&self) -> i32 {
        self.physical_dimension
    }

    pub fn set_physical_dimension(&mut self, dimension: i32) {
        self.physical_dimension = dimension;
    }

    pub fn simulation_type(&self) -> SimulationType {
        self.simulation_type
    }

    pub fn set_simulation_type(&mut self, simulation_type: SimulationType) {
        self.simulation_type = simulation_type;
    }

    pub fn comm(&self) -> &Rc<dyn Communicator> {
        &self.comm
    }

    pub fn rankno(&self) -> RankNo {
        self.comm.rank()
    }

    pub fn process_size(&self) -> i32 {
        self.comm.size()
    }

    pub fn config(&self) -> &DfiConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut DfiConfig {
        &mut self.config
    }

    pub fn writer_info(&self) -> &WriterInfo {
        &self.writer_info
    }

    pub fn set_output_path(&mut self, path: &Path) {
        self.base_dir = path.to_path_buf();
    }

    pub fn set_partitioner(&mut self, partitioner: Box<dyn Partitioner>) {
        self.partitioner = Some(partitioner);
    }

    // --- zones -------------------------------------------------------------

    pub fn num_zones(&self) -> usize {
        self.zones.len()
    }

    pub fn create_zone(&mut self) -> LocalId {
        let id = self.zones.len() as LocalId + 1;
        let name = format!("Zone{id}");
        self.create_zone_named(&name)
    }

    pub fn create_zone_named(&mut self, name: &str) -> LocalId {
        let id = self.zones.len() as LocalId + 1;
        self.zones.push(Zone::new(name, id, Rc::clone(&self.comm)));
        id
    }

    /// Zone by 1-based id.
    pub fn zone(&self, zone_id: LocalId) -> Result<&Zone> {
        self.zones
            .get(zone_id as usize - 1)
            .ok_or_else(|| Error::InvalidZone(format!("zone id {zone_id} out of range")))
    }

    pub fn zone_mut(&mut self, zone_id: LocalId) -> Result<&mut Zone> {
        self.zones
            .get_mut(zone_id as usize - 1)
            .ok_or_else(|| Error::InvalidZone(format!("zone id {zone_id} out of range")))
    }

    pub fn zone_by_name(&self, name: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.name() == name)
    }

    pub fn zone_id(&self, name: &str) -> Option<LocalId> {
        self.zones
            .iter()
            .position(|z| z.name() == name)
            .map(|pos| pos as LocalId + 1)
    }

    pub fn exists_zone(&self, name: &str) -> bool {
        self.zone_by_name(name).is_some()
    }

    pub fn remove_zone(&mut self, zone_id: LocalId) -> Result<()> {
        if zone_id == 0 || zone_id as usize > self.zones.len() {
            return Err(Error::InvalidZone(format!("zone id {zone_id} out of range")));
        }
        self.zones.remove(zone_id as usize - 1);
        for (index, zone) in self.zones.iter_mut().enumerate() {
            zone.set_id(index as LocalId + 1);
        }
        Ok(())
    }

    pub fn clear_zones(&mut self) {
        self.zones.clear();
    }

    // --- iterative data ----------------------------------------------------

    pub fn is_set_iterative_data(&self) -> bool {
        self.iterative.is_some()
    }

    pub fn iterative_data(&self) -> Result<IterativeData> {
        self.iterative
            .ok_or_else(|| Error::InvalidIterativeData("no time slice set".into()))
    }

    pub fn set_iterative_data(&mut self, step: u64, time: f64) {
        self.iterative = Some(IterativeData {
            step,
            time,
            average: None,
        });
    }

    pub fn set_iterative_data_with_average(
        &mut self,
        step: u64,
        time: f64,
        average_step: u64,
        average_time: f64,
    ) {
        self.iterative = Some(IterativeData {
            step,
            time,
            average: Some((average_step, average_time)),
        });
    }

    pub fn clear_iterative_data(&mut self) {
        self.iterative = None;
    }

    // --- broadcast ---------------------------------------------------------

    /// Share the structural skeleton from rank 0: base identity, zone
    /// names, then each zone's recursive skeleton broadcast. Empty ranks
    /// adopt the structure, populated ranks verify it.
    pub fn broadcast_model(&mut self) -> Result<()> {
        let root: RankNo = 0;
        let mut buf = if self.comm.rank() == root {
            archive::to_bytes(&ModelSkeleton::capture(self))?
        } else {
            Vec::new()
        };
        self.comm.broadcast_bytes(root, &mut buf)?;

        let local: Result<()> = if self.comm.rank() == root {
            Ok(())
        } else {
            let mut skeleton = ModelSkeleton::default();
            archive::read_into(&mut skeleton, &buf).and_then(|()| skeleton.apply(self))
        };
        ack(self.comm.as_ref(), local)?;

        for zone in &mut self.zones {
            zone.broadcast_zone()?;
        }
        Ok(())
    }

    // --- load --------------------------------------------------------------

    /// Read the index file, load the mesh files this rank is responsible
    /// for (joining when one rank reads several), then rebuild the
    /// distributed state. `step` picks a time slice; the last one recorded
    /// is used when absent.
    pub fn load_model(&mut self, dfi_path: &Path, step: Option<u64>) -> Result<Vec<Warning>> {
        let local = self.load_model_files(dfi_path, step);
        ack(
            self.comm.as_ref(),
            local.as_ref().map(|_| ()).map_err(Clone::clone),
        )?;
        let warnings = local?;
        self.rebuild_model()?;
        Ok(warnings)
    }

    fn load_model_files(&mut self, dfi_path: &Path, step: Option<u64>) -> Result<Vec<Warning>> {
        self.config = DfiConfig::read(dfi_path)?;
        self.base_dir = dfi_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let step = step.or_else(|| self.config.last_time_slice().map(|slice| slice.step));
        let mut warnings = Vec::new();

        let files = self.config.io_rank_files(self.comm.rank(), self.comm.size());
        let mut first = true;
        for file_rank in files {
            let path = self.config.mesh_file_path(&self.base_dir, file_rank, step);
            let document = io::read_mesh_file(&path)?;
            if document.iterative.is_none() {
                warn!("{}: no iterative data, continuing at step 0", path.display());
                warnings.push(Warning::MissingIterativeData);
            }
            if first {
                self.name = document.base.name.clone();
                self.cell_dimension = document.base.cell_dimension;
                self.physical_dimension = document.base.physical_dimension;
                self.simulation_type = document.base.simulation_type;
            }
            for (index, zone_doc) in document.zones.iter().enumerate() {
                if first {
                    if self.zones.len() <= index {
                        self.create_zone_named(&zone_doc.name);
                    }
                    let catalog = self.config.flow_solutions.clone();
                    let zone = &mut self.zones[index];
                    *zone.solutions_mut() = catalog;
                    warnings.extend(apply_with_solutions(zone, zone_doc, file_rank, &self.config, &self.base_dir, step)?);
                } else {
                    if index >= self.zones.len() {
                        return Err(Error::InvalidZone(format!(
                            "{}: more zones than the first file of this rank",
                            path.display()
                        )));
                    }
                    let mut extra = Zone::new(&zone_doc.name, 0, Rc::clone(&self.comm));
                    *extra.solutions_mut() = self.config.flow_solutions.clone();
                    warnings.extend(apply_with_solutions(
                        &mut extra,
                        zone_doc,
                        file_rank,
                        &self.config,
                        &self.base_dir,
                        step,
                    )?);
                    self.zones[index].join_zone(extra)?;
                }
            }
            first = false;
        }

        if let Some(step) = step {
            let time = self
                .config
                .find_time_slice(step)
                .map_or(0.0, |slice| slice.time);
            self.set_iterative_data(step, time);
        }
        Ok(warnings)
    }

    /// Rebuild the distributed state: broadcast structure, reconcile
    /// boundary maps, renumber, propagate ids and refresh the halo. Also
    /// the tail of every repartitioning round.
    pub fn rebuild_model(&mut self) -> Result<()> {
        self.broadcast_model()?;
        for zone in &mut self.zones {
            zone.migration_boundary()?;
            zone.rebuild_zone(&[])?;
            zone.transfer_virtual_cells()?;
        }
        Ok(())
    }

    // --- write -------------------------------------------------------------

    /// Write one time slice. The output mode comes from the file-info
    /// configuration: combined, or grid/solution split plus a link file.
    /// Rank 0 re-emits the index file with the updated records.
    pub fn write_model(&mut self, step: u64, time: f64) -> Result<Vec<Warning>> {
        self.write_model_with_average(step, time, None)
    }

    pub fn write_model_with_average(
        &mut self,
        step: u64,
        time: f64,
        average: Option<(u64, f64)>,
    ) -> Result<Vec<Warning>> {
        self.iterative = Some(IterativeData {
            step,
            time,
            average,
        });

        let node_counts = self
            .comm
            .allgather_u64(self.zones.iter().map(|z| z.num_nodes() as u64).sum())?;
        let cell_counts = self
            .comm
            .allgather_u64(self.zones.iter().map(|z| z.num_cells() as u64).sum())?;
        self.config.update_process_counts(&node_counts, &cell_counts);
        self.config.domain.cell_dimension = self.cell_dimension;
        self.config.add_time_slice(step, time, average);
        if self.config.flow_solutions.is_empty() {
            if let Some(zone) = self.zones.first() {
                self.config.flow_solutions = zone.solutions().clone();
            }
        }

        let my_rank = self.comm.rank();
        let mut warnings = Vec::new();
        let local: Result<()> = (|| {
            if self.config.file_info.split_solution {
                warnings.extend(self.write_split_files(step)?);
            } else {
                warnings.extend(self.write_combined_file(step)?);
            }
            Ok(())
        })();
        ack(self.comm.as_ref(), local)?;

        let dfi_result = if my_rank == 0 {
            let dfi_path = self
                .base_dir
                .join(format!("{}.dfi", self.config.file_info.prefix));
            self.config.write(&dfi_path)
        } else {
            Ok(())
        };
        ack(self.comm.as_ref(), dfi_result)?;
        Ok(warnings)
    }

    fn base_doc(&self) -> BaseDoc {
        BaseDoc {
            name: self.name.clone(),
            cell_dimension: self.cell_dimension,
            physical_dimension: self.physical_dimension,
            simulation_type: self.simulation_type,
        }
    }

    fn iterative_doc(&self) -> Option<BaseIterativeDoc> {
        self.iterative.map(|data| BaseIterativeDoc {
            steps: vec![data.step],
            times: vec![data.time],
        })
    }

    fn write_combined_file(&self, step: u64) -> Result<Vec<Warning>> {
        let mut warnings = Vec::new();
        let options = WriteOptions {
            timeslice_step: Some(step),
            ..WriteOptions::default()
        };
        let mut zones = Vec::new();
        for zone in &self.zones {
            let (doc, zone_warnings) = io::zone_to_doc(zone, options);
            warnings.extend(zone_warnings);
            zones.push(doc);
        }
        let document = MeshDocument {
            base: self.base_doc(),
            writer_info: self.writer_info.clone(),
            zones,
            iterative: self.iterative_doc(),
        };
        let path = self.config.mesh_file_path(
            &self.base_dir,
            self.comm.rank(),
            self.config.file_info.grid_per_step.then_some(step),
        );
        io::write_mesh_file(&path, &document)?;
        debug!("rank {}: wrote {}", self.comm.rank(), path.display());
        Ok(warnings)
    }

    fn write_split_files(&self, step: u64) -> Result<Vec<Warning>> {
        let mut warnings = Vec::new();
        let my_rank = self.comm.rank();

        // grid file: constant grid is written once, time-sliced grids per step
        let grid_path = self.config.mesh_file_path(
            &self.base_dir,
            my_rank,
            self.config.file_info.grid_per_step.then_some(step),
        );
        if self.config.file_info.grid_per_step || !grid_path.exists() {
            let options = WriteOptions {
                with_solutions: false,
                timeslice_step: Some(step),
                ..WriteOptions::default()
            };
            let mut zones = Vec::new();
            for zone in &self.zones {
                let (doc, zone_warnings) = io::zone_to_doc(zone, options);
                warnings.extend(zone_warnings);
                zones.push(doc);
            }
            let document = MeshDocument {
                base: self.base_doc(),
                writer_info: self.writer_info.clone(),
                zones,
                iterative: self.iterative_doc(),
            };
            io::write_mesh_file(&grid_path, &document)?;
        }

        // solution file for this step
        let options = WriteOptions {
            with_grid: false,
            timeslice_step: Some(step),
            ..WriteOptions::default()
        };
        let mut zones = Vec::new();
        for zone in &self.zones {
            let (doc, zone_warnings) = io::zone_to_doc(zone, options);
            warnings.extend(zone_warnings);
            zones.push(doc);
        }
        let solution_document = MeshDocument {
            base: self.base_doc(),
            writer_info: self.writer_info.clone(),
            zones,
            iterative: self.iterative_doc(),
        };
        let solution_path = self.config.solution_file_path(&self.base_dir, my_rank, step);
        io::write_mesh_file(&solution_path, &solution_document)?;

        // link file referencing both by name, relative to its own location
        let link = LinkDocument {
            step,
            grid_file: grid_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            solution_files: solution_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .into_iter()
                .collect(),
        };
        let link_path = self.config.link_file_path(&self.base_dir, my_rank, step);
        io::write_link_file(&link_path, &link)?;
        Ok(warnings)
    }

    // --- partitioning ------------------------------------------------------

    /// One repartitioning round driven by the configured partitioner
    /// (weight-balanced greedy growth by default). Returns the no-change
    /// warning when every rank keeps all of its cells.
    pub fn partition_zone(&mut self, zone_id: LocalId) -> Result<Option<Warning>> {
        let my_rank = self.comm.rank();
        let num_parts = self.comm.size();
        let plan = {
            let zone = self.zone(zone_id)?;
            let graph = CellGraph::from_zone(zone);
            let targets = match &self.partitioner {
                Some(partitioner) => partitioner.assign(&graph)?,
                None => GreedyPartitioner::new(num_parts).assign(&graph)?,
            };
            plan_from_assignment(&graph, &targets, my_rank)?
        };
        self.repartition_zone_with_plan(zone_id, &plan)
    }

    /// One repartitioning round from an explicit plan (the path a real
    /// partitioning engine feeds).
    pub fn repartition_zone_with_plan(
        &mut self,
        zone_id: LocalId,
        plan: &crate::partition::PartitionPlan,
    ) -> Result<Option<Warning>> {
        let moved = self
            .comm
            .allgather_u64(plan.num_exported() as u64)?
            .into_iter()
            .sum::<u64>();
        if moved == 0 {
            warn!("rank {}: partitioner requested no change", self.comm.rank());
            return Ok(Some(Warning::NoChangePartition));
        }
        let zone = self
            .zones
            .get_mut(zone_id as usize - 1)
            .ok_or_else(|| Error::InvalidZone(format!("zone id {zone_id} out of range")))?;
        zone.repartition(plan)?;
        Ok(None)
    }

    /// Refresh the virtual halo of every zone.
    pub fn transfer_virtual_cells(&mut self) -> Result<()> {
        for zone in &mut self.zones {
            zone.transfer_virtual_cells()?;
        }
        Ok(())
    }

    /// Structural validation of every zone.
    pub fn validate(&self) -> bool {
        self.zones.iter().all(Zone::validate)
    }
}

fn apply_with_solutions(
    zone: &mut Zone,
    zone_doc: &io::ZoneDoc,
    file_rank: RankNo,
    config: &DfiConfig,
    base_dir: &Path,
    step: Option<u64>,
) -> Result<Vec<Warning>> {
    let mut warnings = io::apply_doc_to_zone(zone_doc, zone, file_rank)?;
    if config.file_info.split_solution {
        if let Some(step) = step {
            let solution_path = config.solution_file_path(base_dir, file_rank, step);
            if solution_path.exists() {
                let solution_document = io::read_mesh_file(&solution_path)?;
                for doc in &solution_document.zones {
                    if doc.name == zone_doc.name {
                        io::apply_solutions_to_zone(doc, zone)?;
                    }
                }
            } else {
                warn!("no solution file {} for step {step}", solution_path.display());
            }
        }
    }
    Ok(warnings)
}

// --- structural skeleton -----------------------------------------------------

#[derive(Default)]
struct ModelSkeleton {
    name: String,
    cell_dimension: i32,
    physical_dimension: i32,
    simulation_type: SimulationType,
    zone_names: Vec<String>,
}

impl ModelSkeleton {
    fn capture(model: &Model) -> ModelSkeleton {
        ModelSkeleton {
            name: model.name.clone(),
            cell_dimension: model.cell_dimension,
            physical_dimension: model.physical_dimension,
            simulation_type: model.simulation_type,
            zone_names: model.zones.iter().map(|z| z.name().to_string()).collect(),
        }
    }

    fn apply(self, model: &mut Model) -> Result<()> {
        if model.zones.is_empty() {
            model.name = self.name;
            model.cell_dimension = self.cell_dimension;
            model.physical_dimension = self.physical_dimension;
            model.simulation_type = self.simulation_type;
            for name in &self.zone_names {
                model.create_zone_named(name);
            }
            return Ok(());
        }
        if model.zones.len() != self.zone_names.len()
            || model
                .zones
                .iter()
                .zip(&self.zone_names)
                .any(|(zone, name)| zone.name() != name)
        {
            return Err(Error::InvalidBase(format!(
                "model {} zone layout differs from the broadcast skeleton",
                model.name
            )));
        }
        Ok(())
    }
}

impl Serializable for ModelSkeleton {
    fn serialize(&self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        archive.write_str(&self.name);
        archive.write_i32(self.cell_dimension);
        archive.write_i32(self.physical_dimension);
        archive.write_i32(match self.simulation_type {
            SimulationType::Unknown => 0,
            SimulationType::TimeAccurate => 1,
            SimulationType::NonTimeAccurate => 2,
        });
        archive.write_u64(self.zone_names.len() as u64);
        for name in &self.zone_names {
            archive.write_str(name);
        }
        Ok(())
    }

    fn deserialize(&mut self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        self.name = archive.read_str()?;
        self.cell_dimension = archive.read_i32()?;
        self.physical_dimension = archive.read_i32()?;
        self.simulation_type = match archive.read_i32()? {
            1 => SimulationType::TimeAccurate,
            2 => SimulationType::NonTimeAccurate,
            _ => SimulationType::Unknown,
        };
        let count = archive.read_u64()? as usize;
        self.zone_names.clear();
        for _ in 0..count {
            self.zone_names.push(archive.read_str()?);
        }
        Ok(())
    }
}
