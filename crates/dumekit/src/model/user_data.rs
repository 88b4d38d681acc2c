//! Arbitrary per-zone user arrays, persisted under the zone's user-data
//! node and carried across the structural broadcast.

use serde::{Deserialize, Serialize};

use crate::archive::{Serializable, SerializeArchive};
use crate::error::{Error, Result};
use crate::model::solution::SolutionValues;
use crate::model::types::{DataType, DataValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserData {
    pub name: String,
    /// Array dimensions, slowest first; the value count is their product.
    pub dims: Vec<usize>,
    pub values: SolutionValues,
}

impl UserData {
    pub fn data_type(&self) -> DataType {
        self.values.data_type()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDataList {
    list: Vec<UserData>,
}

impl UserDataList {
    pub fn new() -> Self {
        UserDataList { list: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserData> {
        self.list.iter()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.list.iter().any(|d| d.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&UserData> {
        self.list.iter().find(|d| d.name == name)
    }

    /// Set or replace a named typed array. The value count must match the
    /// dimension product.
    pub fn set_array<T: DataValue>(
        &mut self,
        name: &str,
        dims: &[usize],
        values: &[T],
    ) -> Result<()> {
        let expected: usize = dims.iter().product();
        if dims.is_empty() || expected != values.len() {
            return Err(Error::InvalidUserData(format!(
                "{name}: {} values for dims {:?}",
                values.len(),
                dims
            )));
        }
        let mut storage = SolutionValues::with_data_type(T::DATA_TYPE, values.len());
        for (i, &v) in values.iter().enumerate() {
            storage.set(i, v);
        }
        self.list.retain(|d| d.name != name);
        self.list.push(UserData {
            name: name.to_string(),
            dims: dims.to_vec(),
            values: storage,
        });
        Ok(())
    }

    pub fn get_array<T: DataValue>(&self, name: &str) -> Result<(Vec<usize>, Vec<T>)> {
        let data = self
            .get(name)
            .ok_or_else(|| Error::InvalidUserData(format!("{name} not defined")))?;
        let values = (0..data.len())
            .map(|i| data.values.get(i).unwrap_or_default())
            .collect();
        Ok((data.dims.clone(), values))
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        let before = self.list.len();
        self.list.retain(|d| d.name != name);
        if self.list.len() == before {
            return Err(Error::InvalidUserData(format!("{name} not defined")));
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }
}

impl Serializable for UserDataList {
    fn serialize(&self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        archive.write_u64(self.list.len() as u64);
        for data in &self.list {
            archive.write_str(&data.name);
            archive.write_i32(data.data_type().tag());
            archive.write_u64(data.dims.len() as u64);
            for &dim in &data.dims {
                archive.write_u64(dim as u64);
            }
            archive.write_u64(data.len() as u64);
            for i in 0..data.len() {
                match &data.values {
                    SolutionValues::Integer(v) => archive.write_i32(v[i]),
                    SolutionValues::LongInteger(v) => archive.write_i64(v[i]),
                    SolutionValues::RealSingle(v) => archive.write_f32(v[i]),
                    SolutionValues::RealDouble(v) => archive.write_f64(v[i]),
                }
            }
        }
        Ok(())
    }

    fn deserialize(&mut self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        self.list.clear();
        let count = archive.read_u64()? as usize;
        for _ in 0..count {
            let name = archive.read_str()?;
            let datatype = DataType::from_tag(archive.read_i32()?)?;
            let ndims = archive.read_u64()? as usize;
            let mut dims = Vec::with_capacity(ndims);
            for _ in 0..ndims {
                dims.push(archive.read_u64()? as usize);
            }
            let len = archive.read_u64()? as usize;
            let mut values = SolutionValues::with_data_type(datatype, len);
            for i in 0..len {
                match &mut values {
                    SolutionValues::Integer(v) => v[i] = archive.read_i32()?,
                    SolutionValues::LongInteger(v) => v[i] = archive.read_i64()?,
                    SolutionValues::RealSingle(v) => v[i] = archive.read_f32()?,
                    SolutionValues::RealDouble(v) => v[i] = archive.read_f64()?,
                }
            }
            self.list.push(UserData { name, dims, values });
        }
        Ok(())
    }
}
