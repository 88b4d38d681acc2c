//! Per-entity solution storage and the zone-level field catalog.

use serde::{Deserialize, Serialize};

use crate::archive::{Serializable, SerializeArchive};
use crate::error::{Error, Result};
use crate::model::types::{DataType, DataValue, GridLocation, VectorType};

/// Raw value storage of a solution field at the declared datatype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SolutionValues {
    Integer(Vec<i32>),
    LongInteger(Vec<i64>),
    RealSingle(Vec<f32>),
    RealDouble(Vec<f64>),
}

impl SolutionValues {
    pub fn with_data_type(datatype: DataType, size: usize) -> Self {
        match datatype {
            DataType::Integer => SolutionValues::Integer(vec![0; size]),
            DataType::LongInteger => SolutionValues::LongInteger(vec![0; size]),
            DataType::RealSingle => SolutionValues::RealSingle(vec![0.0; size]),
            DataType::RealDouble => SolutionValues::RealDouble(vec![0.0; size]),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            SolutionValues::Integer(_) => DataType::Integer,
            SolutionValues::LongInteger(_) => DataType::LongInteger,
            SolutionValues::RealSingle(_) => DataType::RealSingle,
            SolutionValues::RealDouble(_) => DataType::RealDouble,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SolutionValues::Integer(v) => v.len(),
            SolutionValues::LongInteger(v) => v.len(),
            SolutionValues::RealSingle(v) => v.len(),
            SolutionValues::RealDouble(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get<T: DataValue>(&self, index: usize) -> Option<T> {
        match self {
            SolutionValues::Integer(v) => v.get(index).map(|&x| T::from_i32(x)),
            SolutionValues::LongInteger(v) => v.get(index).map(|&x| T::from_i64(x)),
            SolutionValues::RealSingle(v) => v.get(index).map(|&x| T::from_f32(x)),
            SolutionValues::RealDouble(v) => v.get(index).map(|&x| T::from_f64(x)),
        }
    }

    pub fn set<T: DataValue>(&mut self, index: usize, value: T) {
        match self {
            SolutionValues::Integer(v) => v[index] = value.into_i32(),
            SolutionValues::LongInteger(v) => v[index] = value.into_i64(),
            SolutionValues::RealSingle(v) => v[index] = value.into_f32(),
            SolutionValues::RealDouble(v) => v[index] = value.into_f64(),
        }
    }
}

/// A named typed array of length 1 (scalar), 3 (vector), or N (general).
#[derive(Debug, Clone, PartialEq)]
pub struct SolutionField {
    id: u64,
    name: String,
    vector_type: VectorType,
    values: SolutionValues,
}

impl Default for SolutionField {
    fn default() -> Self {
        SolutionField {
            id: 0,
            name: String::new(),
            vector_type: VectorType::Scalar,
            values: SolutionValues::with_data_type(DataType::RealDouble, 1),
        }
    }
}

impl SolutionField {
    /// Factory by datatype.
    pub fn with_data_type(name: &str, datatype: DataType, vector_type: VectorType) -> Self {
        let size = match vector_type {
            VectorType::Scalar => 1,
            VectorType::Vector => 3,
        };
        SolutionField {
            id: 0,
            name: name.to_string(),
            vector_type,
            values: SolutionValues::with_data_type(datatype, size),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn equals_name(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn data_type(&self) -> DataType {
        self.values.data_type()
    }

    pub fn vector_type(&self) -> VectorType {
        self.vector_type
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Reallocate to `size` zero-filled values. Changing the size resets the
    /// vector-type classification to match the new length.
    pub fn set_data_size(&mut self, size: usize) {
        if self.values.len() == size {
            return;
        }
        self.values = SolutionValues::with_data_type(self.values.data_type(), size);
        self.vector_type = if size == 1 {
            VectorType::Scalar
        } else {
            VectorType::Vector
        };
    }

    pub fn scalar<T: DataValue>(&self) -> Option<T> {
        self.values.get(0)
    }

    pub fn set_scalar<T: DataValue>(&mut self, value: T) {
        self.set_data_size(1);
        self.values.set(0, value);
    }

    pub fn vector<T: DataValue>(&self) -> Vec<T> {
        (0..self.values.len())
            .map(|i| self.values.get(i).unwrap_or_default())
            .collect()
    }

    pub fn set_vector<T: DataValue>(&mut self, values: &[T]) {
        self.set_data_size(values.len());
        for (i, &v) in values.iter().enumerate() {
            self.values.set(i, v);
        }
    }

    /// Broadcast one value over every component.
    pub fn fill<T: DataValue>(&mut self, value: T) {
        for i in 0..self.values.len() {
            self.values.set(i, value);
        }
    }
}

impl Serializable for SolutionField {
    fn serialize(&self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        archive.write_u64(self.id);
        archive.write_i32(self.data_type().tag());
        archive.write_str(&self.name);
        archive.write_i32(self.vector_type as i32);
        archive.write_u64(self.values.len() as u64);
        match &self.values {
            SolutionValues::Integer(v) => v.iter().for_each(|&x| archive.write_i32(x)),
            SolutionValues::LongInteger(v) => v.iter().for_each(|&x| archive.write_i64(x)),
            SolutionValues::RealSingle(v) => v.iter().for_each(|&x| archive.write_f32(x)),
            SolutionValues::RealDouble(v) => v.iter().for_each(|&x| archive.write_f64(x)),
        }
        Ok(())
    }

    fn deserialize(&mut self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        self.id = archive.read_u64()?;
        let datatype = DataType::from_tag(archive.read_i32()?)
            .map_err(|e| Error::Deserialize(format!("solution datatype: {e}")))?;
        self.name = archive.read_str()?;
        self.vector_type = VectorType::from_tag(archive.read_i32()?)
            .map_err(|e| Error::Deserialize(format!("solution vector type: {e}")))?;
        let size = archive.read_u64()? as usize;
        self.values = match datatype {
            DataType::Integer => {
                let mut v = Vec::with_capacity(size);
                for _ in 0..size {
                    v.push(archive.read_i32()?);
                }
                SolutionValues::Integer(v)
            }
            DataType::LongInteger => {
                let mut v = Vec::with_capacity(size);
                for _ in 0..size {
                    v.push(archive.read_i64()?);
                }
                SolutionValues::LongInteger(v)
            }
            DataType::RealSingle => {
                let mut v = Vec::with_capacity(size);
                for _ in 0..size {
                    v.push(archive.read_f32()?);
                }
                SolutionValues::RealSingle(v)
            }
            DataType::RealDouble => {
                let mut v = Vec::with_capacity(size);
                for _ in 0..size {
                    v.push(archive.read_f64()?);
                }
                SolutionValues::RealDouble(v)
            }
        };
        Ok(())
    }
}

/// Declared configuration of one solution field in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionFieldConfig {
    pub name: String,
    pub data_type: DataType,
    pub grid_location: GridLocation,
    pub vector_type: VectorType,
    pub nvector_size: usize,
    pub constant_flag: bool,
}

impl SolutionFieldConfig {
    /// Component field names as stored in the file: a vector field `V` of
    /// size 3 maps to `VX`, `VY`, `VZ`; larger vectors are numbered.
    pub fn component_names(&self) -> Vec<String> {
        match self.vector_type {
            VectorType::Scalar => vec![self.name.clone()],
            VectorType::Vector => {
                if self.nvector_size == 3 {
                    ["X", "Y", "Z"]
                        .iter()
                        .map(|axis| format!("{}{}", self.name, axis))
                        .collect()
                } else {
                    (1..=self.nvector_size)
                        .map(|i| format!("{}{}", self.name, i))
                        .collect()
                }
            }
        }
    }

    /// Name of the parent solution node this field is written under.
    /// Per-step fields go to `FlowSolution_%010d`.
    pub fn solution_node_name(&self, timeslice_step: Option<u64>) -> String {
        if let Some(step) = timeslice_step {
            if !self.constant_flag {
                return format!("FlowSolution_{step:010}");
            }
        }
        let base = match self.grid_location {
            GridLocation::Vertex => "UdmSol_Node",
            GridLocation::CellCenter => "UdmSol_Cell",
        };
        if self.constant_flag {
            format!("{base}_Const")
        } else {
            base.to_string()
        }
    }
}

impl Serializable for SolutionFieldConfig {
    fn serialize(&self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        archive.write_str(&self.name);
        archive.write_i32(self.data_type.tag());
        archive.write_i32(self.grid_location.tag());
        archive.write_i32(self.vector_type as i32);
        archive.write_u64(self.nvector_size as u64);
        archive.write_u8(u8::from(self.constant_flag));
        Ok(())
    }

    fn deserialize(&mut self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        self.name = archive.read_str()?;
        self.data_type = DataType::from_tag(archive.read_i32()?)?;
        self.grid_location = GridLocation::from_tag(archive.read_i32()?)?;
        self.vector_type = VectorType::from_tag(archive.read_i32()?)?;
        self.nvector_size = archive.read_u64()? as usize;
        self.constant_flag = archive.read_u8()? != 0;
        Ok(())
    }
}

/// The declared list of solution fields against which all per-entity
/// set/get operations are validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowSolutions {
    fields: Vec<SolutionFieldConfig>,
}

impl FlowSolutions {
    pub fn new() -> Self {
        FlowSolutions { fields: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SolutionFieldConfig> {
        self.fields.iter()
    }

    pub fn exists_field_name(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&SolutionFieldConfig> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Scalar, time-varying field.
    pub fn create_field(
        &mut self,
        name: &str,
        data_type: DataType,
        grid_location: GridLocation,
    ) -> Result<usize> {
        self.create_field_detail(name, data_type, grid_location, VectorType::Scalar, 1, false)
    }

    pub fn create_field_detail(
        &mut self,
        name: &str,
        data_type: DataType,
        grid_location: GridLocation,
        vector_type: VectorType,
        nvector_size: usize,
        constant_flag: bool,
    ) -> Result<usize> {
        if name.is_empty() {
            return Err(Error::InvalidParameter("empty solution field name".into()));
        }
        if self.exists_field_name(name) {
            return Err(Error::InvalidParameter(format!(
                "solution field {name} already declared"
            )));
        }
        if vector_type == VectorType::Scalar && nvector_size != 1 {
            return Err(Error::InvalidParameter(format!(
                "scalar field {name} with vector size {nvector_size}"
            )));
        }
        self.fields.push(SolutionFieldConfig {
            name: name.to_string(),
            data_type,
            grid_location,
            vector_type,
            nvector_size,
            constant_flag,
        });
        Ok(self.fields.len())
    }

    pub fn remove_field(&mut self, name: &str) -> Result<()> {
        let before = self.fields.len();
        self.fields.retain(|f| f.name != name);
        if self.fields.len() == before {
            return Err(Error::NotFoundSolution(name.to_string()));
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Catalog check for one set/get access: name known, datatype equal,
    /// location matching the entity kind.
    pub fn validate_access(
        &self,
        name: &str,
        data_type: DataType,
        grid_location: GridLocation,
    ) -> Result<&SolutionFieldConfig> {
        let config = self
            .field(name)
            .ok_or_else(|| Error::NotFoundSolution(name.to_string()))?;
        if config.data_type != data_type {
            return Err(Error::InvalidFlowSolution(format!(
                "field {name}: datatype {:?} does not match declared {:?}",
                data_type, config.data_type
            )));
        }
        if config.grid_location != grid_location {
            return Err(Error::InvalidFlowSolution(format!(
                "field {name}: grid location {:?} does not match declared {:?}",
                grid_location, config.grid_location
            )));
        }
        Ok(config)
    }
}

impl Serializable for FlowSolutions {
    fn serialize(&self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        archive.write_u64(self.fields.len() as u64);
        for field in &self.fields {
            Serializable::serialize(field, archive)?;
        }
        Ok(())
    }

    fn deserialize(&mut self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        self.fields.clear();
        let count = archive.read_u64()? as usize;
        for _ in 0..count {
            let mut config = SolutionFieldConfig {
                name: String::new(),
                data_type: DataType::RealDouble,
                grid_location: GridLocation::Vertex,
                vector_type: VectorType::Scalar,
                nvector_size: 1,
                constant_flag: false,
            };
            config.deserialize(archive)?;
            self.fields.push(config);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive;

    #[test]
    fn test_field_scalar_and_vector_access() {
        let mut field =
            SolutionField::with_data_type("pressure", DataType::RealSingle, VectorType::Scalar);
        field.set_scalar(3.5f32);
        assert_eq!(field.scalar::<f32>(), Some(3.5));
        assert_eq!(field.scalar::<f64>(), Some(3.5));

        field.set_vector(&[1.0f32, 2.0, 3.0]);
        assert_eq!(field.vector_type(), VectorType::Vector);
        assert_eq!(field.vector::<f32>(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_set_data_size_zero_fills_and_reclassifies() {
        let mut field =
            SolutionField::with_data_type("momentum", DataType::RealDouble, VectorType::Vector);
        field.set_vector(&[1.0f64, 2.0, 3.0]);
        field.set_data_size(5);
        assert_eq!(field.vector::<f64>(), vec![0.0; 5]);
        assert_eq!(field.vector_type(), VectorType::Vector);
        field.set_data_size(1);
        assert_eq!(field.vector_type(), VectorType::Scalar);
    }

    #[test]
    fn test_field_serialize_roundtrip() {
        let mut field =
            SolutionField::with_data_type("velocity", DataType::RealDouble, VectorType::Vector);
        field.set_id(4);
        field.set_vector(&[0.5f64, -1.5, 8.0]);
        let bytes = archive::to_bytes(&field).unwrap();
        let mut back = SolutionField::default();
        archive::read_into(&mut back, &bytes).unwrap();
        assert_eq!(back, field);
    }

    #[test]
    fn test_fill_broadcasts_over_components() {
        let mut field =
            SolutionField::with_data_type("flag", DataType::Integer, VectorType::Vector);
        field.fill(7i32);
        assert_eq!(field.vector::<i32>(), vec![7, 7, 7]);
    }

    #[test]
    fn test_catalog_validation() {
        let mut solutions = FlowSolutions::new();
        solutions
            .create_field("pressure", DataType::RealSingle, GridLocation::Vertex)
            .unwrap();
        assert!(solutions
            .create_field("pressure", DataType::RealSingle, GridLocation::Vertex)
            .is_err());

        assert!(solutions
            .validate_access("pressure", DataType::RealSingle, GridLocation::Vertex)
            .is_ok());
        assert!(matches!(
            solutions.validate_access("density", DataType::RealSingle, GridLocation::Vertex),
            Err(Error::NotFoundSolution(_))
        ));
        assert!(solutions
            .validate_access("pressure", DataType::RealDouble, GridLocation::Vertex)
            .is_err());
        assert!(solutions
            .validate_access("pressure", DataType::RealSingle, GridLocation::CellCenter)
            .is_err());
    }

    #[test]
    fn test_cgns_component_names() {
        let config = SolutionFieldConfig {
            name: "Velocity".into(),
            data_type: DataType::RealDouble,
            grid_location: GridLocation::CellCenter,
            vector_type: VectorType::Vector,
            nvector_size: 3,
            constant_flag: false,
        };
        assert_eq!(
            config.component_names(),
            vec!["VelocityX", "VelocityY", "VelocityZ"]
        );
        assert_eq!(config.solution_node_name(None), "UdmSol_Cell");
        assert_eq!(
            config.solution_node_name(Some(12)),
            "FlowSolution_0000000012"
        );

        let constant = SolutionFieldConfig {
            constant_flag: true,
            grid_location: GridLocation::Vertex,
            ..config
        };
        assert_eq!(constant.solution_node_name(Some(12)), "UdmSol_Node_Const");
    }

    #[test]
    fn test_catalog_serialize_roundtrip() {
        let mut solutions = FlowSolutions::new();
        solutions
            .create_field_detail(
                "velocity",
                DataType::RealDouble,
                GridLocation::CellCenter,
                VectorType::Vector,
                3,
                false,
            )
            .unwrap();
        solutions
            .create_field("pressure", DataType::RealSingle, GridLocation::Vertex)
            .unwrap();
        let bytes = archive::to_bytes(&solutions).unwrap();
        let mut back = FlowSolutions::new();
        archive::read_into(&mut back, &bytes).unwrap();
        assert_eq!(back, solutions);
    }
}
