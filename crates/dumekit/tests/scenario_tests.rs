//! End-to-end scenarios on a single rank: component generation, field
//! round trips through the store, partitioner no-change handling and the
//! permissive vertex-only write path.

use std::rc::Rc;

use dumekit::model::{DataType, ElementType, GridLocation, Model, VectorType};
use dumekit::prelude::*;

fn serial_model() -> Model {
    Model::new(Rc::new(SerialComm))
}

fn tetra_zone(model: &mut Model) -> u64 {
    let zone_id = model.create_zone_named("fluid");
    let zone = model.zone_mut(zone_id).unwrap();
    zone.insert_grid_coordinates(0.0f64, 0.0, 0.0);
    zone.insert_grid_coordinates(1.0f64, 0.0, 0.0);
    zone.insert_grid_coordinates(0.0f64, 1.0, 0.0);
    zone.insert_grid_coordinates(0.0f64, 0.0, 1.0);
    zone.insert_cell(ElementType::Tetra4, &[1, 2, 3, 4]).unwrap();
    zone_id
}

#[test]
fn single_tetrahedron_components() {
    let mut model = serial_model();
    let zone_id = tetra_zone(&mut model);
    let zone = model.zone_mut(zone_id).unwrap();
    zone.create_component_cells().unwrap();

    assert_eq!(zone.num_cells(), 1);
    assert_eq!(zone.sections().num_component_cells(), 4);
    for component in zone.sections().component_cells() {
        assert_eq!(component.borrow().element_type(), ElementType::Tri3);
        assert_eq!(component.borrow().num_parent_cells(), 1);
    }
    // a solid generates faces only; no edges appear
    assert!(zone
        .sections()
        .component_cells()
        .iter()
        .all(|c| c.borrow().element_type() != ElementType::Bar2));

    // generation is idempotent
    let ids: Vec<u64> = zone
        .sections()
        .component_cells()
        .iter()
        .map(|c| c.borrow().id())
        .collect();
    zone.create_component_cells().unwrap();
    let again: Vec<u64> = zone
        .sections()
        .component_cells()
        .iter()
        .map(|c| c.borrow().id())
        .collect();
    assert_eq!(ids, again);
}

#[test]
fn two_hexahedra_share_a_face() {
    let mut model = serial_model();
    let zone_id = model.create_zone_named("fluid");
    let zone = model.zone_mut(zone_id).unwrap();
    // 12 nodes in two stacked layers of a 2x2 column
    for layer in 0..3 {
        zone.insert_grid_coordinates(0.0f64, 0.0, layer as f64);
        zone.insert_grid_coordinates(1.0f64, 0.0, layer as f64);
        zone.insert_grid_coordinates(1.0f64, 1.0, layer as f64);
        zone.insert_grid_coordinates(0.0f64, 1.0, layer as f64);
    }
    zone.insert_cell(ElementType::Hexa8, &[1, 2, 3, 4, 5, 6, 7, 8])
        .unwrap();
    zone.insert_cell(ElementType::Hexa8, &[5, 6, 7, 8, 9, 10, 11, 12])
        .unwrap();
    zone.create_component_cells().unwrap();

    assert_eq!(zone.num_cells(), 2);
    assert_eq!(zone.sections().num_component_cells(), 11);

    let shared: Vec<_> = zone
        .sections()
        .component_cells()
        .iter()
        .filter(|c| c.borrow().num_parent_cells() == 2)
        .collect();
    assert_eq!(shared.len(), 1);
    // parents in insertion order
    let parents = shared[0].borrow().parent_cells();
    assert_eq!(parents[0].borrow().entity.id(), 1);
    assert_eq!(parents[1].borrow().entity.id(), 2);

    // the shared face makes the cells neighbors
    let neighbors = zone.neighbor_cells_of_cell(1).unwrap();
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].borrow().entity.id(), 2);
}

#[test]
fn unknown_element_type_does_not_mutate_sections() {
    let mut model = serial_model();
    let zone_id = tetra_zone(&mut model);
    let zone = model.zone_mut(zone_id).unwrap();
    let cells_before = zone.num_cells();
    let sections_before = zone.sections().num_sections();

    // 99 is no element-type tag
    let err = zone.insert_cells_connectivity(ElementType::Mixed, &[99, 1, 2, 3, 4]);
    assert!(matches!(err, Err(Error::InvalidElementType(_))));
    assert_eq!(zone.num_cells(), cells_before);
    assert_eq!(zone.sections().num_sections(), sections_before);
}

#[test]
fn duplicate_nodes_only_for_degenerate_types() {
    let mut model = serial_model();
    let zone_id = tetra_zone(&mut model);
    let zone = model.zone_mut(zone_id).unwrap();
    assert!(matches!(
        zone.insert_cell(ElementType::Quad4, &[1, 2, 2, 3]),
        Err(Error::InvalidElementType(_))
    ));
    assert!(zone.insert_cell(ElementType::Bar2, &[2, 2]).is_ok());
}

#[test]
fn partitioner_round_with_no_change() {
    let mut model = serial_model();
    let zone_id = tetra_zone(&mut model);
    model.zone_mut(zone_id).unwrap().create_component_cells().unwrap();
    let nodes_before = model.zone(zone_id).unwrap().num_nodes();
    let cells_before = model.zone(zone_id).unwrap().num_cells();

    let plan = PartitionPlan::new();
    let outcome = model.repartition_zone_with_plan(zone_id, &plan).unwrap();
    assert_eq!(outcome, Some(Warning::NoChangePartition));

    assert!(model.validate());
    assert_eq!(model.zone(zone_id).unwrap().num_nodes(), nodes_before);
    assert_eq!(model.zone(zone_id).unwrap().num_cells(), cells_before);
}

#[test]
fn scalar_field_roundtrip_through_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = serial_model();
    model.set_output_path(dir.path());
    let zone_id = model.create_zone_named("fluid");
    {
        let zone = model.zone_mut(zone_id).unwrap();
        for i in 0..10 {
            zone.insert_grid_coordinates(i as f64, 0.0, 0.0);
        }
        zone.solutions_mut()
            .create_field("pressure", DataType::RealSingle, GridLocation::Vertex)
            .unwrap();
        for i in 1..=10u64 {
            zone.set_solution_scalar_in_node(i, "pressure", i as f32).unwrap();
        }
    }
    let warnings = model.write_model(0, 0.0).unwrap();
    // vertex-only zones are written permissively
    assert!(warnings.contains(&Warning::EmptyCell));

    let mut reloaded = serial_model();
    reloaded
        .load_model(&dir.path().join("mesh.dfi"), None)
        .unwrap();
    let zone = reloaded.zone(1).unwrap();
    assert_eq!(zone.num_nodes(), 10);
    for i in 1..=10u64 {
        assert_eq!(
            zone.get_solution_scalar_in_node::<f32>(i, "pressure").unwrap(),
            i as f32
        );
    }
}

#[test]
fn vector_field_on_cells_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = serial_model();
    model.set_output_path(dir.path());
    let zone_id = model.create_zone_named("fluid");
    {
        let zone = model.zone_mut(zone_id).unwrap();
        zone.insert_grid_coordinates(0.0f64, 0.0, 0.0);
        zone.insert_grid_coordinates(1.0f64, 0.0, 0.0);
        zone.insert_grid_coordinates(0.0f64, 1.0, 0.0);
        zone.insert_grid_coordinates(0.0f64, 0.0, 1.0);
        zone.insert_grid_coordinates(1.0f64, 1.0, 1.0);
        zone.insert_cell(ElementType::Tetra4, &[1, 2, 3, 4]).unwrap();
        zone.insert_cell(ElementType::Tetra4, &[2, 3, 4, 5]).unwrap();
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
        for i in 1..=2u64 {
            let v = i as f64;
            zone.set_solution_vector_in_cell(i, "Velocity", &[v, 2.0 * v, 3.0 * v])
                .unwrap();
        }
    }
    model.write_model(0, 0.0).unwrap();

    // the file carries VelocityX/Y/Z under a single solution node
    let document =
        dumekit::io::read_mesh_file(&dir.path().join("mesh_id000000.json")).unwrap();
    let cell_solutions: Vec<&dumekit::io::SolutionNodeDoc> = document.zones[0]
        .solutions
        .iter()
        .filter(|node| node.location == GridLocation::CellCenter)
        .collect();
    assert_eq!(cell_solutions.len(), 1);
    let names: Vec<&str> = cell_solutions[0]
        .fields
        .iter()
        .map(|f| f.name.as_str())
        .collect();
    assert_eq!(names, vec!["VelocityX", "VelocityY", "VelocityZ"]);

    let mut reloaded = serial_model();
    reloaded
        .load_model(&dir.path().join("mesh.dfi"), None)
        .unwrap();
    let zone = reloaded.zone(1).unwrap();
    assert_eq!(zone.num_cells(), 2);
    for i in 1..=2u64 {
        let v = i as f64;
        assert_eq!(
            zone.get_solution_vector_in_cell::<f64>(i, "Velocity").unwrap(),
            vec![v, 2.0 * v, 3.0 * v]
        );
    }
}

#[test]
fn split_solution_mode_writes_link_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = serial_model();
    model.set_output_path(dir.path());
    model.config_mut().file_info.split_solution = true;
    let zone_id = tetra_zone(&mut model);
    {
        let zone = model.zone_mut(zone_id).unwrap();
        zone.solutions_mut()
            .create_field("pressure", DataType::RealDouble, GridLocation::Vertex)
            .unwrap();
        zone.set_solution_scalar_in_node(1, "pressure", 7.5f64).unwrap();
    }
    model.write_model(3, 0.3).unwrap();

    assert!(dir.path().join("mesh_id000000.json").exists());
    assert!(dir.path().join("mesh_sol_0000000003_id000000.json").exists());
    let link =
        dumekit::io::read_link_file(&dir.path().join("mesh_0000000003_id000000_link.json"))
            .unwrap();
    assert_eq!(link.step, 3);
    assert_eq!(link.grid_file.as_deref(), Some("mesh_id000000.json"));

    let mut reloaded = serial_model();
    reloaded
        .load_model(&dir.path().join("mesh.dfi"), Some(3))
        .unwrap();
    let zone = reloaded.zone(1).unwrap();
    assert_eq!(
        zone.get_solution_scalar_in_node::<f64>(1, "pressure").unwrap(),
        7.5
    );
}

#[test]
fn written_model_rereads_to_equal_document() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = serial_model();
    model.set_output_path(dir.path());
    let zone_id = tetra_zone(&mut model);
    model.zone_mut(zone_id).unwrap().create_component_cells().unwrap();
    model.write_model(0, 0.0).unwrap();

    // read back, rebuild, write again: the documents agree
    let mut reloaded = serial_model();
    reloaded
        .load_model(&dir.path().join("mesh.dfi"), None)
        .unwrap();
    let second = tempfile::tempdir().unwrap();
    reloaded.set_output_path(second.path());
    reloaded.config_mut().file_info.directory_path = ".".into();
    reloaded.write_model(0, 0.0).unwrap();

    let first_doc = dumekit::io::read_mesh_file(&dir.path().join("mesh_id000000.json")).unwrap();
    let second_doc =
        dumekit::io::read_mesh_file(&second.path().join("mesh_id000000.json")).unwrap();
    assert_eq!(first_doc.zones[0].grid, second_doc.zones[0].grid);
    assert_eq!(first_doc.zones[0].sections, second_doc.zones[0].sections);
}
