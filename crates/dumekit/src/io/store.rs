//! Serde-backed mesh store.
//!
//! The real deployment target is a CGNS/HDF5 codec, which stays outside
//! this crate; the core only needs the document shapes below (they mirror
//! the CGNS node layout: base, zone, grid coordinates, element sections,
//! flow-solution nodes, iterative pointers, writer info and the
//! rank-connectivity user data). The bundled backend persists the documents
//! as JSON or YAML, chosen by file extension, and supports the same output
//! modes: combined, grid-only, solution-only, and link files referencing
//! the split parts by relative name.

use std::fs::File;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, Warning};
use crate::ids::{LocalId, RankNo};
use crate::model::element_type::ElementType;
use crate::model::solution::{SolutionFieldConfig, SolutionValues};
use crate::model::types::{DataType, GridLocation, SimulationType, VectorType};
use crate::model::user_data::UserDataList;
use crate::model::zone::Zone;

/// Version string recorded in every written file.
pub const WRITER_VERSION: &str = concat!("dumekit-", env!("CARGO_PKG_VERSION"));

/// Writer identity: which rank of how many produced this file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterInfo {
    pub version: String,
    pub process_size: i32,
    pub rankno: RankNo,
}

impl Default for WriterInfo {
    fn default() -> Self {
        WriterInfo {
            version: WRITER_VERSION.to_string(),
            process_size: 1,
            rankno: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseDoc {
    pub name: String,
    pub cell_dimension: i32,
    pub physical_dimension: i32,
    pub simulation_type: SimulationType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseIterativeDoc {
    pub steps: Vec<u64>,
    pub times: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridDoc {
    pub data_type: DataType,
    pub coords_x: Vec<f64>,
    pub coords_y: Vec<f64>,
    pub coords_z: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionDoc {
    pub name: String,
    /// Element-type wire tag; `Mixed` sections carry per-cell tags inline
    /// in the connectivity stream.
    pub element_type: i32,
    pub connectivity: Vec<LocalId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDoc {
    /// Component field name (`VelocityX`, …) as stored in the file.
    pub name: String,
    pub values: SolutionValues,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionNodeDoc {
    pub name: String,
    pub location: GridLocation,
    pub fields: Vec<FieldDoc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankConnectivityEntry {
    pub localid: LocalId,
    pub rankno: RankNo,
    pub peer_localid: LocalId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneIterativeDoc {
    pub grid_pointer: String,
    pub solution_pointers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneDoc {
    pub name: String,
    pub vertex_size: u64,
    pub cell_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<GridDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<SectionDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub solutions: Vec<SolutionNodeDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rank_connectivity: Vec<RankConnectivityEntry>,
    #[serde(default, skip_serializing_if = "UserDataList::is_empty")]
    pub user_data: UserDataList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterative: Option<ZoneIterativeDoc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshDocument {
    pub base: BaseDoc,
    pub writer_info: WriterInfo,
    pub zones: Vec<ZoneDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterative: Option<BaseIterativeDoc>,
}

/// Link file: a thin document referencing grid and solution files by name
/// relative to its own location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkDocument {
    pub step: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_file: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub solution_files: Vec<String>,
}

// --- file io ----------------------------------------------------------------

fn format_of(path: &Path) -> Result<&'static str> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
        .as_str()
    {
        "json" => Ok("json"),
        "yaml" | "yml" => Ok("yaml"),
        other => Err(Error::FileOpen(format!(
            "unsupported mesh file extension {other:?}: {}",
            path.display()
        ))),
    }
}

pub fn write_mesh_file(path: &Path, document: &MeshDocument) -> Result<()> {
    write_document(path, document)
}

pub fn read_mesh_file(path: &Path) -> Result<MeshDocument> {
    read_document(path)
}

pub fn write_link_file(path: &Path, document: &LinkDocument) -> Result<()> {
    write_document(path, document)
}

pub fn read_link_file(path: &Path) -> Result<LinkDocument> {
    read_document(path)
}

fn write_document<T: Serialize>(path: &Path, document: &T) -> Result<()> {
    let format = format_of(path)?;
    let file =
        File::create(path).map_err(|e| Error::FileOpen(format!("{}: {e}", path.display())))?;
    match format {
        "json" => serde_json::to_writer_pretty(&file, document)
            .map_err(|e| Error::Serialize(format!("{}: {e}", path.display()))),
        _ => serde_yaml::to_writer(&file, document)
            .map_err(|e| Error::Serialize(format!("{}: {e}", path.display()))),
    }
}

fn read_document<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let format = format_of(path)?;
    let file =
        File::open(path).map_err(|e| Error::FileOpen(format!("{}: {e}", path.display())))?;
    match format {
        "json" => serde_json::from_reader(file)
            .map_err(|e| Error::Deserialize(format!("{}: {e}", path.display()))),
        _ => serde_yaml::from_reader(file)
            .map_err(|e| Error::Deserialize(format!("{}: {e}", path.display()))),
    }
}

// --- zone → document --------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    pub with_grid: bool,
    pub with_solutions: bool,
    pub write_constants: bool,
    pub timeslice_step: Option<u64>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            with_grid: true,
            with_solutions: true,
            write_constants: true,
            timeslice_step: None,
        }
    }
}

/// Capture a zone into its document form. Vertex-only zones are legal;
/// they are written as-is with the empty-cell warning surfaced.
pub fn zone_to_doc(zone: &Zone, options: WriteOptions) -> (ZoneDoc, Vec<Warning>) {
    let mut warnings = Vec::new();
    if zone.num_cells() == 0 {
        warn!("zone {} is written without cells", zone.name());
        warnings.push(Warning::EmptyCell);
    }

    let mut doc = ZoneDoc {
        name: zone.name().to_string(),
        vertex_size: zone.num_nodes() as u64,
        cell_size: zone.num_cells() as u64,
        ..ZoneDoc::default()
    };

    if options.with_grid {
        let n = zone.num_nodes();
        let mut coords_x = vec![0.0f64; n];
        let mut coords_y = vec![0.0f64; n];
        let mut coords_z = vec![0.0f64; n];
        zone.grid().get_grid_coordinates_array(
            1,
            n as LocalId,
            &mut coords_x,
            &mut coords_y,
            &mut coords_z,
        );
        let data_type = zone
            .grid()
            .nodes()
            .first()
            .map_or(DataType::RealDouble, |node| {
                node.borrow().coords().data_type()
            });
        doc.grid = Some(GridDoc {
            data_type,
            coords_x,
            coords_y,
            coords_z,
        });

        for section in zone.sections().sections() {
            let mixed = section.element_type() == ElementType::Mixed;
            let mut connectivity = Vec::new();
            for cell in section.cells() {
                if mixed {
                    connectivity.push(cell.borrow().entity.element_type().tag() as LocalId);
                }
                connectivity.extend(cell.borrow().node_local_ids());
            }
            doc.sections.push(SectionDoc {
                name: section.name().to_string(),
                element_type: section.element_type().tag(),
                connectivity,
            });
        }

        for node in zone.connectivity().boundary_nodes() {
            let localid = node.borrow().entity.id();
            for info in node.borrow().entity.mpi_rankinfos().iter() {
                doc.rank_connectivity.push(RankConnectivityEntry {
                    localid,
                    rankno: info.rankno,
                    peer_localid: info.localid,
                });
            }
        }

        doc.user_data = zone.user_data().clone();
    }

    if options.with_solutions {
        doc.solutions = collect_solution_nodes(zone, options);
        doc.iterative = Some(ZoneIterativeDoc {
            grid_pointer: "GridCoordinates".to_string(),
            solution_pointers: doc.solutions.iter().map(|s| s.name.clone()).collect(),
        });
    }

    (doc, warnings)
}

fn collect_solution_nodes(zone: &Zone, options: WriteOptions) -> Vec<SolutionNodeDoc> {
    let mut nodes: Vec<SolutionNodeDoc> = Vec::new();
    for config in zone.solutions().iter() {
        if config.constant_flag && !options.write_constants {
            continue;
        }
        let node_name = config.solution_node_name(options.timeslice_step);
        let components = config.component_names();
        let count = match config.grid_location {
            GridLocation::Vertex => zone.num_nodes(),
            GridLocation::CellCenter => zone.num_cells(),
        };

        let mut fields = Vec::with_capacity(components.len());
        for (component, component_name) in components.iter().enumerate() {
            let mut values = SolutionValues::with_data_type(config.data_type, count);
            for index in 0..count {
                let value = entity_component_value(zone, config, index, component);
                values.set(index, value);
            }
            fields.push(FieldDoc {
                name: component_name.clone(),
                values,
            });
        }

        match nodes.iter_mut().find(|n| n.name == node_name) {
            Some(node) => node.fields.extend(fields),
            None => nodes.push(SolutionNodeDoc {
                name: node_name,
                location: config.grid_location,
                fields,
            }),
        }
    }
    nodes
}

fn entity_component_value(
    zone: &Zone,
    config: &SolutionFieldConfig,
    index: usize,
    component: usize,
) -> f64 {
    let read = |entity: &crate::model::entity::Entity| -> f64 {
        entity
            .solution_field(&config.name)
            .and_then(|field| field.vector::<f64>().get(component).copied())
            .unwrap_or(0.0)
    };
    match config.grid_location {
        GridLocation::Vertex => zone
            .grid()
            .nodes()
            .get(index)
            .map_or(0.0, |n| read(&n.borrow().entity)),
        GridLocation::CellCenter => zone
            .sections()
            .entity_cells()
            .get(index)
            .map_or(0.0, |c| read(&c.borrow().entity)),
    }
}

// --- document → zone --------------------------------------------------------

/// Populate a zone from a document. `source_rankno` identifies the file's
/// writer rank and becomes each node's previous identity, so peers can
/// still address the node before the first renumbering.
pub fn apply_doc_to_zone(
    doc: &ZoneDoc,
    zone: &mut Zone,
    source_rankno: RankNo,
) -> Result<Vec<Warning>> {
    let mut warnings = Vec::new();
    zone.set_name(&doc.name);

    if let Some(grid) = &doc.grid {
        let n = grid.coords_x.len();
        if grid.coords_y.len() != n || grid.coords_z.len() != n {
            return Err(Error::InvalidGridCoordinates(format!(
                "zone {}: coordinate arrays of unequal length",
                doc.name
            )));
        }
        match grid.data_type {
            DataType::Integer => {
                let xs: Vec<i32> = grid.coords_x.iter().map(|&v| v as i32).collect();
                let ys: Vec<i32> = grid.coords_y.iter().map(|&v| v as i32).collect();
                let zs: Vec<i32> = grid.coords_z.iter().map(|&v| v as i32).collect();
                zone.grid_mut()
                    .set_grid_coordinates_array(n, &xs, &ys, &zs, source_rankno)?;
            }
            DataType::LongInteger => {
                let xs: Vec<i64> = grid.coords_x.iter().map(|&v| v as i64).collect();
                let ys: Vec<i64> = grid.coords_y.iter().map(|&v| v as i64).collect();
                let zs: Vec<i64> = grid.coords_z.iter().map(|&v| v as i64).collect();
                zone.grid_mut()
                    .set_grid_coordinates_array(n, &xs, &ys, &zs, source_rankno)?;
            }
            DataType::RealSingle => {
                let xs: Vec<f32> = grid.coords_x.iter().map(|&v| v as f32).collect();
                let ys: Vec<f32> = grid.coords_y.iter().map(|&v| v as f32).collect();
                let zs: Vec<f32> = grid.coords_z.iter().map(|&v| v as f32).collect();
                zone.grid_mut()
                    .set_grid_coordinates_array(n, &xs, &ys, &zs, source_rankno)?;
            }
            DataType::RealDouble => {
                zone.grid_mut().set_grid_coordinates_array(
                    n,
                    &grid.coords_x,
                    &grid.coords_y,
                    &grid.coords_z,
                    source_rankno,
                )?;
            }
        }

        for section in &doc.sections {
            let element_type = ElementType::from_tag(section.element_type)?;
            if !zone.sections().exists_section(&section.name) {
                zone.sections_mut().create_section(&section.name, element_type)?;
            }
            zone.insert_cells_connectivity(element_type, &section.connectivity)?;
        }

        for entry in &doc.rank_connectivity {
            zone.insert_rank_connectivity(entry.localid, entry.rankno, entry.peer_localid)?;
        }

        *zone.user_data_mut() = doc.user_data.clone();
    }

    if doc.iterative.is_none() {
        warnings.push(Warning::MissingIterativeData);
    }

    apply_solutions_to_zone(doc, zone)?;
    zone.update_vertex_size();
    zone.update_cell_size();
    Ok(warnings)
}

/// Merge the solution fields of a document into an already-gridded zone
/// (the solution-only read path).
pub fn apply_solutions_to_zone(doc: &ZoneDoc, zone: &mut Zone) -> Result<()> {
    let catalog: Vec<SolutionFieldConfig> = zone.solutions().iter().cloned().collect();
    for solution_node in &doc.solutions {
        for config in catalog
            .iter()
            .filter(|c| c.grid_location == solution_node.location)
        {
            let components = config.component_names();
            let mut component_fields = Vec::new();
            for component_name in &components {
                match solution_node
                    .fields
                    .iter()
                    .find(|f| &f.name == component_name)
                {
                    Some(field) => component_fields.push(field),
                    None => break,
                }
            }
            if component_fields.len() != components.len() {
                continue; // this solution node does not carry the field
            }
            let count = component_fields
                .iter()
                .map(|f| f.values.len())
                .min()
                .unwrap_or(0);
            for index in 0..count {
                apply_entity_value(zone, config, &component_fields, index)?;
            }
        }
    }
    Ok(())
}

fn apply_entity_value(
    zone: &mut Zone,
    config: &SolutionFieldConfig,
    component_fields: &[&FieldDoc],
    index: usize,
) -> Result<()> {
    let entity_id = index as LocalId + 1;
    match config.data_type {
        DataType::Integer => set_typed::<i32>(zone, config, component_fields, index, entity_id),
        DataType::LongInteger => set_typed::<i64>(zone, config, component_fields, index, entity_id),
        DataType::RealSingle => set_typed::<f32>(zone, config, component_fields, index, entity_id),
        DataType::RealDouble => set_typed::<f64>(zone, config, component_fields, index, entity_id),
    }
}

fn set_typed<T: crate::model::types::DataValue>(
    zone: &mut Zone,
    config: &SolutionFieldConfig,
    component_fields: &[&FieldDoc],
    index: usize,
    entity_id: LocalId,
) -> Result<()> {
    let values: Vec<T> = component_fields
        .iter()
        .map(|f| f.values.get::<T>(index).unwrap_or_default())
        .collect();
    match (config.grid_location, config.vector_type) {
        (GridLocation::Vertex, VectorType::Scalar) => {
            zone.set_solution_scalar_in_node(entity_id, &config.name, values[0])
        }
        (GridLocation::Vertex, VectorType::Vector) => {
            zone.set_solution_vector_in_node(entity_id, &config.name, &values)
        }
        (GridLocation::CellCenter, VectorType::Scalar) => {
            zone.set_solution_scalar_in_cell(entity_id, &config.name, values[0])
        }
        (GridLocation::CellCenter, VectorType::Vector) => {
            zone.set_solution_vector_in_cell(entity_id, &config.name, &values)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;
    use std::rc::Rc;

    fn sample_zone() -> Zone {
        let mut zone = Zone::new("duct", 1, Rc::new(SerialComm));
        zone.insert_grid_coordinates(0.0f64, 0.0, 0.0);
        zone.insert_grid_coordinates(1.0f64, 0.0, 0.0);
        zone.insert_grid_coordinates(0.0f64, 1.0, 0.0);
        zone.insert_grid_coordinates(0.0f64, 0.0, 1.0);
        zone.insert_cell(ElementType::Tetra4, &[1, 2, 3, 4]).unwrap();
        zone.solutions_mut()
            .create_field("pressure", DataType::RealSingle, GridLocation::Vertex)
            .unwrap();
        for node_id in 1..=4u64 {
            zone.set_solution_scalar_in_node(node_id, "pressure", node_id as f32)
                .unwrap();
        }
        zone
    }

    #[test]
    fn test_zone_document_roundtrip() {
        let zone = sample_zone();
        let (doc, warnings) = zone_to_doc(&zone, WriteOptions::default());
        assert!(warnings.is_empty());
        assert_eq!(doc.vertex_size, 4);
        assert_eq!(doc.cell_size, 1);
        assert_eq!(doc.sections.len(), 1);
        assert_eq!(doc.sections[0].connectivity, vec![1, 2, 3, 4]);
        assert_eq!(doc.solutions.len(), 1);
        assert_eq!(doc.solutions[0].name, "UdmSol_Node");
        assert_eq!(doc.solutions[0].fields[0].name, "pressure");

        let mut back = Zone::new("", 1, Rc::new(SerialComm));
        *back.solutions_mut() = zone.solutions().clone();
        let warnings = apply_doc_to_zone(&doc, &mut back, 0).unwrap();
        assert!(warnings.contains(&Warning::MissingIterativeData) == doc.iterative.is_none());
        assert_eq!(back.num_nodes(), 4);
        assert_eq!(back.num_cells(), 1);
        for node_id in 1..=4u64 {
            assert_eq!(
                back.get_solution_scalar_in_node::<f32>(node_id, "pressure")
                    .unwrap(),
                node_id as f32
            );
        }
    }

    #[test]
    fn test_vector_field_written_as_component_fields() {
        let mut zone = sample_zone();
        zone.solutions_mut()
            .create_field_detail(
                "Velocity",
                DataType::RealDouble,
                GridLocation::CellCenter,
                VectorType::Vector,
                3,
                false,
            )
            .unwrap();
        zone.set_solution_vector_in_cell(1, "Velocity", &[1.0f64, 2.0, 3.0])
            .unwrap();

        let (doc, _) = zone_to_doc(&zone, WriteOptions::default());
        let cell_node = doc
            .solutions
            .iter()
            .find(|n| n.location == GridLocation::CellCenter)
            .unwrap();
        assert_eq!(cell_node.name, "UdmSol_Cell");
        let names: Vec<&str> = cell_node.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["VelocityX", "VelocityY", "VelocityZ"]);

        let mut back = Zone::new("", 1, Rc::new(SerialComm));
        *back.solutions_mut() = zone.solutions().clone();
        apply_doc_to_zone(&doc, &mut back, 0).unwrap();
        assert_eq!(
            back.get_solution_vector_in_cell::<f64>(1, "Velocity").unwrap(),
            vec![1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn test_single_precision_grid_roundtrip() {
        use approx::assert_abs_diff_eq;

        let mut zone = Zone::new("wing", 1, Rc::new(SerialComm));
        zone.insert_grid_coordinates(0.1f32, 0.2, 0.3);
        zone.insert_grid_coordinates(1.5f32, -2.5, 3.5);
        let (doc, _) = zone_to_doc(&zone, WriteOptions::default());
        assert_eq!(doc.grid.as_ref().unwrap().data_type, DataType::RealSingle);

        let mut back = Zone::new("", 1, Rc::new(SerialComm));
        apply_doc_to_zone(&doc, &mut back, 0).unwrap();
        let node = back.grid().node_by_id(1).unwrap();
        let (x, y, z) = node.borrow().get_coords::<f32>();
        assert_abs_diff_eq!(x, 0.1f32);
        assert_abs_diff_eq!(y, 0.2f32);
        assert_abs_diff_eq!(z, 0.3f32);
    }

    #[test]
    fn test_mesh_file_json_roundtrip() {
        let zone = sample_zone();
        let (zone_doc, _) = zone_to_doc(&zone, WriteOptions::default());
        let document = MeshDocument {
            base: BaseDoc {
                name: "base".into(),
                cell_dimension: 3,
                physical_dimension: 3,
                simulation_type: SimulationType::TimeAccurate,
            },
            writer_info: WriterInfo::default(),
            zones: vec![zone_doc],
            iterative: Some(BaseIterativeDoc {
                steps: vec![0],
                times: vec![0.0],
            }),
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("duct_id000000.json");
        write_mesh_file(&path, &document).unwrap();
        let back = read_mesh_file(&path).unwrap();
        assert_eq!(back, document);
    }

    #[test]
    fn test_unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.cgns");
        assert!(write_mesh_file(&path, &MeshDocument::default()).is_err());
    }

    #[test]
    fn test_link_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh_link.yaml");
        let link = LinkDocument {
            step: 4,
            grid_file: Some("mesh_grid_id000000.yaml".into()),
            solution_files: vec!["mesh_sol_0000000004_id000000.yaml".into()],
        };
        write_link_file(&path, &link).unwrap();
        assert_eq!(read_link_file(&path).unwrap(), link);
    }

    #[test]
    fn test_rank_connectivity_entries_roundtrip() {
        let mut zone = sample_zone();
        zone.insert_rank_connectivity(2, 1, 11).unwrap();
        zone.insert_rank_connectivity(3, 1, 12).unwrap();
        let (doc, _) = zone_to_doc(&zone, WriteOptions::default());
        assert_eq!(doc.rank_connectivity.len(), 2);

        let mut back = Zone::new("", 1, Rc::new(SerialComm));
        *back.solutions_mut() = zone.solutions().clone();
        apply_doc_to_zone(&doc, &mut back, 0).unwrap();
        assert_eq!(back.connectivity().num_boundary_nodes(), 2);
        let node = back.grid().node_by_id(2).unwrap();
        assert!(node.borrow().entity.exists_mpi_rankinfo(1, 11));
    }
}
