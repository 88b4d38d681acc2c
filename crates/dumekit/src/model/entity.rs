//! Shared core of nodes and cells: identity, ownership, reality, solution
//! values, and the rank bookkeeping that drives migration.

use std::cmp::Ordering;

use crate::archive::{Serializable, SerializeArchive};
use crate::error::{Error, Result};
use crate::ids::{GlobalRankId, GlobalRankIdList, LocalId, RankNo};
use crate::model::element_type::ElementType;
use crate::model::solution::SolutionField;
use crate::model::types::{DataType, DataValue, RealityType, VectorType};

#[derive(Debug, Clone)]
pub struct Entity {
    /// Container-local id, 1-based.
    id: LocalId,
    /// Sequence id over actual + virtual entities; equals `id` for actual
    /// entities, continues past the actual maximum for virtual ones.
    local_id: LocalId,
    my_rankno: RankNo,
    element_type: ElementType,
    reality: RealityType,
    solutions: Vec<SolutionField>,
    /// Peers holding the same physical entity, and the id each knows it by.
    /// On a migrating cell this temporarily records the destination rank.
    mpi_rankinfos: GlobalRankIdList,
    /// Every (rank, id) this entity was previously known under.
    previous_rankinfos: GlobalRankIdList,
    partition_weight: f32,
    remove_entity: bool,
}

impl Default for Entity {
    fn default() -> Self {
        Entity::new(ElementType::Node)
    }
}

impl Entity {
    pub fn new(element_type: ElementType) -> Self {
        Entity {
            id: 0,
            local_id: 0,
            my_rankno: -1,
            element_type,
            reality: RealityType::Actual,
            solutions: Vec::new(),
            mpi_rankinfos: GlobalRankIdList::new(),
            previous_rankinfos: GlobalRankIdList::new(),
            partition_weight: 0.0,
            remove_entity: false,
        }
    }

    pub fn id(&self) -> LocalId {
        self.id
    }

    pub fn set_id(&mut self, id: LocalId) {
        self.id = id;
    }

    pub fn local_id(&self) -> LocalId {
        self.local_id
    }

    pub fn set_local_id(&mut self, local_id: LocalId) {
        self.local_id = local_id;
    }

    pub fn my_rankno(&self) -> RankNo {
        self.my_rankno
    }

    pub fn set_my_rankno(&mut self, rankno: RankNo) {
        self.my_rankno = rankno;
    }

    pub fn global_id(&self) -> GlobalRankId {
        GlobalRankId::new(self.my_rankno, self.id)
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn set_element_type(&mut self, element_type: ElementType) {
        self.element_type = element_type;
    }

    pub fn reality_type(&self) -> RealityType {
        self.reality
    }

    pub fn set_reality_type(&mut self, reality: RealityType) {
        self.reality = reality;
    }

    pub fn partition_weight(&self) -> f32 {
        self.partition_weight
    }

    pub fn set_partition_weight(&mut self, weight: f32) {
        self.partition_weight = weight;
    }

    pub fn clear_partition_weight(&mut self) {
        self.partition_weight = 0.0;
    }

    pub fn is_remove_entity(&self) -> bool {
        self.remove_entity
    }

    pub fn set_remove_entity(&mut self, remove: bool) {
        self.remove_entity = remove;
    }

    // --- solution data -----------------------------------------------------

    pub fn num_solutions(&self) -> usize {
        self.solutions.len()
    }

    pub fn clear_solutions(&mut self) {
        self.solutions.clear();
    }

    pub fn exists_solution(&self, name: &str) -> bool {
        self.solutions.iter().any(|f| f.equals_name(name))
    }

    pub fn solution_field(&self, name: &str) -> Option<&SolutionField> {
        self.solutions.iter().find(|f| f.equals_name(name))
    }

    pub fn remove_solution(&mut self, name: &str) -> Result<()> {
        let before = self.solutions.len();
        self.solutions.retain(|f| !f.equals_name(name));
        if self.solutions.len() == before {
            return Err(Error::NotFoundSolution(name.to_string()));
        }
        Ok(())
    }

    fn insert_solution_field(&mut self, mut field: SolutionField) -> usize {
        field.set_id(self.solutions.len() as u64 + 1);
        self.solutions.push(field);
        self.solutions.len()
    }

    /// Read a scalar. Access to a name this entity does not hold is an
    /// error; reads never auto-create.
    pub fn solution_scalar<T: DataValue>(&self, name: &str) -> Result<T> {
        let field = self
            .solution_field(name)
            .ok_or_else(|| Error::NotFoundSolution(name.to_string()))?;
        field
            .scalar()
            .ok_or_else(|| Error::NotFoundSolution(format!("{name} holds no value")))
    }

    pub fn solution_vector<T: DataValue>(&self, name: &str) -> Result<Vec<T>> {
        let field = self
            .solution_field(name)
            .ok_or_else(|| Error::NotFoundSolution(name.to_string()))?;
        Ok(field.vector())
    }

    /// Write a scalar, auto-inserting a field slot at `datatype` on first
    /// write. The stored datatype wins; the value is converted into it.
    pub fn set_solution_scalar_as<T: DataValue>(
        &mut self,
        name: &str,
        datatype: DataType,
        value: T,
    ) {
        if let Some(field) = self.solutions.iter_mut().find(|f| f.equals_name(name)) {
            field.set_data_size(1);
            set_converted_scalar(field, value);
            return;
        }
        let mut field = SolutionField::with_data_type(name, datatype, VectorType::Scalar);
        set_converted_scalar(&mut field, value);
        self.insert_solution_field(field);
    }

    pub fn set_solution_scalar<T: DataValue>(&mut self, name: &str, value: T) {
        self.set_solution_scalar_as(name, T::DATA_TYPE, value);
    }

    pub fn set_solution_vector_as<T: DataValue>(
        &mut self,
        name: &str,
        datatype: DataType,
        values: &[T],
    ) {
        if let Some(field) = self.solutions.iter_mut().find(|f| f.equals_name(name)) {
            set_converted_vector(field, values);
            return;
        }
        let mut field = SolutionField::with_data_type(name, datatype, VectorType::Vector);
        set_converted_vector(&mut field, values);
        self.insert_solution_field(field);
    }

    pub fn set_solution_vector<T: DataValue>(&mut self, name: &str, values: &[T]) {
        self.set_solution_vector_as(name, T::DATA_TYPE, values);
    }

    /// Broadcast one value over all `nvector_size` components of the field,
    /// creating it when absent.
    pub fn initialize_value_as<T: DataValue>(
        &mut self,
        name: &str,
        datatype: DataType,
        vector_type: VectorType,
        nvector_size: usize,
        value: T,
    ) {
        if let Some(field) = self.solutions.iter_mut().find(|f| f.equals_name(name)) {
            field.set_data_size(nvector_size);
            field.fill(value);
            return;
        }
        let mut field = SolutionField::with_data_type(name, datatype, vector_type);
        field.set_data_size(nvector_size);
        field.fill(value);
        self.insert_solution_field(field);
    }

    // --- mpi rank info -----------------------------------------------------

    pub fn num_mpi_rankinfos(&self) -> usize {
        self.mpi_rankinfos.len()
    }

    pub fn mpi_rankinfos(&self) -> &GlobalRankIdList {
        &self.mpi_rankinfos
    }

    pub fn add_mpi_rankinfo(&mut self, rankno: RankNo, localid: LocalId) {
        let _ = self.mpi_rankinfos.add(GlobalRankId::new(rankno, localid));
    }

    pub fn remove_mpi_rankinfo(&mut self, rankno: RankNo, localid: LocalId) -> Result<()> {
        self.mpi_rankinfos.remove(rankno, localid)
    }

    pub fn exists_mpi_rankinfo(&self, rankno: RankNo, localid: LocalId) -> bool {
        self.mpi_rankinfos.exists(rankno, localid)
    }

    pub fn update_mpi_rankinfo(&mut self, old: GlobalRankId, new: GlobalRankId) -> Result<()> {
        self.mpi_rankinfos.update(old, new)
    }

    pub fn clear_mpi_rankinfos(&mut self) {
        self.mpi_rankinfos.clear();
    }

    /// Drop invalid entries and self references.
    pub fn erase_invalid_mpi_rankinfos(&mut self) {
        self.mpi_rankinfos.erase_invalids(self.my_rankno);
    }

    // --- previous rank info ------------------------------------------------

    pub fn num_previous_rankinfos(&self) -> usize {
        self.previous_rankinfos.len()
    }

    pub fn previous_rankinfos(&self) -> &GlobalRankIdList {
        &self.previous_rankinfos
    }

    pub fn add_previous_rankinfo(&mut self, rankno: RankNo, localid: LocalId) {
        self.previous_rankinfos.add_previous_rank_info(rankno, localid);
    }

    pub fn exists_previous_rankinfo(&self, rankno: RankNo, localid: LocalId) -> bool {
        self.previous_rankinfos.iter().any(|g| g.equals(rankno, localid))
    }

    pub fn clear_previous_infos(&mut self) {
        self.previous_rankinfos.clear();
    }

    // --- ordering ----------------------------------------------------------

    /// Rank first, then id.
    pub fn compare_global_id(&self, rankno: RankNo, localid: LocalId) -> Ordering {
        self.my_rankno.cmp(&rankno).then(self.id.cmp(&localid))
    }

    /// Strict-weak order on local ids, suitable for sorting entity pools.
    pub fn compare_ids(a: &Entity, b: &Entity) -> Ordering {
        a.id.cmp(&b.id)
    }
}

fn set_converted_scalar<T: DataValue>(field: &mut SolutionField, value: T) {
    match field.data_type() {
        DataType::Integer => field.set_scalar(value.into_i32()),
        DataType::LongInteger => field.set_scalar(value.into_i64()),
        DataType::RealSingle => field.set_scalar(value.into_f32()),
        DataType::RealDouble => field.set_scalar(value.into_f64()),
    }
}

fn set_converted_vector<T: DataValue>(field: &mut SolutionField, values: &[T]) {
    match field.data_type() {
        DataType::Integer => {
            field.set_vector(&values.iter().map(|v| v.into_i32()).collect::<Vec<_>>());
        }
        DataType::LongInteger => {
            field.set_vector(&values.iter().map(|v| v.into_i64()).collect::<Vec<_>>());
        }
        DataType::RealSingle => {
            field.set_vector(&values.iter().map(|v| v.into_f32()).collect::<Vec<_>>());
        }
        DataType::RealDouble => {
            field.set_vector(&values.iter().map(|v| v.into_f64()).collect::<Vec<_>>());
        }
    }
}

impl Serializable for Entity {
    fn serialize(&self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        archive.write_u64(self.id);
        archive.write_i32(self.element_type.tag());
        archive.write_i32(self.my_rankno);
        self.previous_rankinfos.serialize(archive)?;
        archive.write_i32(self.reality as i32);
        archive.write_i32(self.solutions.len() as i32);
        for field in &self.solutions {
            field.serialize(archive)?;
        }
        self.mpi_rankinfos.serialize(archive)?;
        archive.write_f32(self.partition_weight);
        Ok(())
    }

    fn deserialize(&mut self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        self.id = archive.read_u64()?;
        self.element_type = ElementType::from_tag(archive.read_i32()?)
            .map_err(|e| Error::Deserialize(format!("entity element type: {e}")))?;
        self.my_rankno = archive.read_i32()?;
        self.previous_rankinfos.deserialize(archive)?;
        self.reality = RealityType::from_tag(archive.read_i32()?)
            .map_err(|e| Error::Deserialize(format!("entity reality: {e}")))?;
        let num_fields = archive.read_i32()?;
        self.solutions.clear();
        for _ in 0..num_fields {
            let mut field = SolutionField::default();
            field.deserialize(archive)?;
            self.solutions.push(field);
        }
        self.mpi_rankinfos.deserialize(archive)?;
        self.partition_weight = archive.read_f32()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive;

    #[test]
    fn test_solution_auto_insert_on_write_only() {
        let mut entity = Entity::new(ElementType::Node);
        assert!(entity.solution_scalar::<f64>("pressure").is_err());
        entity.set_solution_scalar("pressure", 2.5f64);
        assert_eq!(entity.solution_scalar::<f64>("pressure").unwrap(), 2.5);
        // still no auto-create on read
        assert!(entity.solution_scalar::<f64>("density").is_err());
    }

    #[test]
    fn test_declared_datatype_wins_over_value_type() {
        let mut entity = Entity::new(ElementType::Node);
        entity.set_solution_scalar_as("count", DataType::Integer, 7.9f64);
        let field = entity.solution_field("count").unwrap();
        assert_eq!(field.data_type(), DataType::Integer);
        assert_eq!(entity.solution_scalar::<i32>("count").unwrap(), 7);
    }

    #[test]
    fn test_initialize_value_fills_components() {
        let mut entity = Entity::new(ElementType::Tetra4);
        entity.initialize_value_as(
            "velocity",
            DataType::RealDouble,
            VectorType::Vector,
            3,
            1.25f64,
        );
        assert_eq!(
            entity.solution_vector::<f64>("velocity").unwrap(),
            vec![1.25, 1.25, 1.25]
        );
    }

    #[test]
    fn test_mpi_rankinfo_ops() {
        let mut entity = Entity::new(ElementType::Node);
        entity.set_my_rankno(0);
        entity.set_id(5);
        entity.add_mpi_rankinfo(1, 3);
        entity.add_mpi_rankinfo(1, 3); // duplicate ignored
        entity.add_mpi_rankinfo(2, 8);
        assert_eq!(entity.num_mpi_rankinfos(), 2);
        assert!(entity.exists_mpi_rankinfo(1, 3));
        entity
            .update_mpi_rankinfo(GlobalRankId::new(1, 3), GlobalRankId::new(1, 4))
            .unwrap();
        assert!(entity.exists_mpi_rankinfo(1, 4));
        entity.remove_mpi_rankinfo(2, 8).unwrap();
        assert_eq!(entity.num_mpi_rankinfos(), 1);
    }

    #[test]
    fn test_erase_invalid_drops_self_references() {
        let mut entity = Entity::new(ElementType::Node);
        entity.set_my_rankno(1);
        entity.add_mpi_rankinfo(0, 2);
        entity.add_mpi_rankinfo(1, 9);
        entity.erase_invalid_mpi_rankinfos();
        assert!(entity.exists_mpi_rankinfo(0, 2));
        assert!(!entity.exists_mpi_rankinfo(1, 9));
    }

    #[test]
    fn test_serialize_roundtrip_with_fields_and_infos() {
        let mut entity = Entity::new(ElementType::Tetra4);
        entity.set_id(12);
        entity.set_my_rankno(3);
        entity.set_partition_weight(1.5);
        entity.add_previous_rankinfo(1, 7);
        entity.add_mpi_rankinfo(0, 2);
        entity.set_solution_scalar("pressure", 4.25f64);
        entity.set_solution_vector("velocity", &[1.0f64, 2.0, 3.0]);

        let bytes = archive::to_bytes(&entity).unwrap();
        let mut back = Entity::new(ElementType::Node);
        archive::read_into(&mut back, &bytes).unwrap();

        assert_eq!(back.id(), 12);
        assert_eq!(back.my_rankno(), 3);
        assert_eq!(back.element_type(), ElementType::Tetra4);
        assert_eq!(back.partition_weight(), 1.5);
        assert!(back.exists_previous_rankinfo(1, 7));
        assert!(back.exists_mpi_rankinfo(0, 2));
        assert_eq!(back.solution_scalar::<f64>("pressure").unwrap(), 4.25);
        assert_eq!(
            back.solution_vector::<f64>("velocity").unwrap(),
            vec![1.0, 2.0, 3.0]
        );
    }
}
