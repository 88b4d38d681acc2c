//! Node coordinates in one of the four numeric datatypes.

use std::cmp::Ordering;

use crate::archive::{Serializable, SerializeArchive};
use crate::error::{Error, Result};
use crate::model::types::{DataType, DataValue};

/// Three coordinates stored at the declared datatype.
///
/// Comparison is lexicographic on (z, y, x), Z first, matching the spatial
/// sort convention used when joining and searching by position.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordsValue {
    Integer([i32; 3]),
    LongInteger([i64; 3]),
    RealSingle([f32; 3]),
    RealDouble([f64; 3]),
}

impl Default for CoordsValue {
    fn default() -> Self {
        CoordsValue::RealDouble([0.0; 3])
    }
}

impl CoordsValue {
    /// Factory by datatype, zero-initialized.
    pub fn with_data_type(datatype: DataType) -> Self {
        match datatype {
            DataType::Integer => CoordsValue::Integer([0; 3]),
            DataType::LongInteger => CoordsValue::LongInteger([0; 3]),
            DataType::RealSingle => CoordsValue::RealSingle([0.0; 3]),
            DataType::RealDouble => CoordsValue::RealDouble([0.0; 3]),
        }
    }

    pub fn from_values<T: DataValue>(x: T, y: T, z: T) -> Self {
        let mut coords = CoordsValue::with_data_type(T::DATA_TYPE);
        coords.set(x, y, z);
        coords
    }

    pub fn data_type(&self) -> DataType {
        match self {
            CoordsValue::Integer(_) => DataType::Integer,
            CoordsValue::LongInteger(_) => DataType::LongInteger,
            CoordsValue::RealSingle(_) => DataType::RealSingle,
            CoordsValue::RealDouble(_) => DataType::RealDouble,
        }
    }

    /// Typed read; converts from the stored datatype when they differ.
    pub fn get<T: DataValue>(&self) -> (T, T, T) {
        match self {
            CoordsValue::Integer(c) => (T::from_i32(c[0]), T::from_i32(c[1]), T::from_i32(c[2])),
            CoordsValue::LongInteger(c) => {
                (T::from_i64(c[0]), T::from_i64(c[1]), T::from_i64(c[2]))
            }
            CoordsValue::RealSingle(c) => (T::from_f32(c[0]), T::from_f32(c[1]), T::from_f32(c[2])),
            CoordsValue::RealDouble(c) => (T::from_f64(c[0]), T::from_f64(c[1]), T::from_f64(c[2])),
        }
    }

    /// Typed write into the stored datatype; the datatype is preserved.
    pub fn set<T: DataValue>(&mut self, x: T, y: T, z: T) {
        match self {
            CoordsValue::Integer(c) => *c = [x.into_i32(), y.into_i32(), z.into_i32()],
            CoordsValue::LongInteger(c) => *c = [x.into_i64(), y.into_i64(), z.into_i64()],
            CoordsValue::RealSingle(c) => *c = [x.into_f32(), y.into_f32(), z.into_f32()],
            CoordsValue::RealDouble(c) => *c = [x.into_f64(), y.into_f64(), z.into_f64()],
        }
    }

    fn as_f64(&self) -> [f64; 3] {
        match self {
            CoordsValue::Integer(c) => [c[0] as f64, c[1] as f64, c[2] as f64],
            CoordsValue::LongInteger(c) => [c[0] as f64, c[1] as f64, c[2] as f64],
            CoordsValue::RealSingle(c) => [c[0] as f64, c[1] as f64, c[2] as f64],
            CoordsValue::RealDouble(c) => *c,
        }
    }

    /// (z, y, x) lexicographic comparison.
    pub fn compare(&self, other: &CoordsValue) -> Ordering {
        let a = self.as_f64();
        let b = other.as_f64();
        a[2].total_cmp(&b[2])
            .then(a[1].total_cmp(&b[1]))
            .then(a[0].total_cmp(&b[0]))
    }

    /// Coordinate equality under the stored datatype.
    pub fn equals_coords(&self, other: &CoordsValue) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Serializable for CoordsValue {
    fn serialize(&self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        archive.write_i32(self.data_type().tag());
        match self {
            CoordsValue::Integer(c) => c.iter().for_each(|&v| archive.write_i32(v)),
            CoordsValue::LongInteger(c) => c.iter().for_each(|&v| archive.write_i64(v)),
            CoordsValue::RealSingle(c) => c.iter().for_each(|&v| archive.write_f32(v)),
            CoordsValue::RealDouble(c) => c.iter().for_each(|&v| archive.write_f64(v)),
        }
        Ok(())
    }

    fn deserialize(&mut self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        let datatype = DataType::from_tag(archive.read_i32()?)
            .map_err(|e| Error::Deserialize(format!("coords datatype: {e}")))?;
        *self = match datatype {
            DataType::Integer => CoordsValue::Integer([
                archive.read_i32()?,
                archive.read_i32()?,
                archive.read_i32()?,
            ]),
            DataType::LongInteger => CoordsValue::LongInteger([
                archive.read_i64()?,
                archive.read_i64()?,
                archive.read_i64()?,
            ]),
            DataType::RealSingle => CoordsValue::RealSingle([
                archive.read_f32()?,
                archive.read_f32()?,
                archive.read_f32()?,
            ]),
            DataType::RealDouble => CoordsValue::RealDouble([
                archive.read_f64()?,
                archive.read_f64()?,
                archive.read_f64()?,
            ]),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive;

    #[test]
    fn test_typed_get_set_with_conversion() {
        let mut c = CoordsValue::with_data_type(DataType::RealSingle);
        c.set(1.0f64, 2.0, 3.0);
        assert_eq!(c.data_type(), DataType::RealSingle);
        let (x, y, z) = c.get::<f64>();
        assert_eq!((x, y, z), (1.0, 2.0, 3.0));
        let (xi, yi, zi) = c.get::<i32>();
        assert_eq!((xi, yi, zi), (1, 2, 3));
    }

    #[test]
    fn test_compare_is_z_first() {
        let a = CoordsValue::from_values(9.0f64, 9.0, 1.0);
        let b = CoordsValue::from_values(0.0f64, 0.0, 2.0);
        assert_eq!(a.compare(&b), Ordering::Less);

        let c = CoordsValue::from_values(1.0f64, 5.0, 2.0);
        assert_eq!(b.compare(&c), Ordering::Less); // same z, y decides
    }

    #[test]
    fn test_serialize_roundtrip_each_datatype() {
        for datatype in [
            DataType::Integer,
            DataType::LongInteger,
            DataType::RealSingle,
            DataType::RealDouble,
        ] {
            let mut c = CoordsValue::with_data_type(datatype);
            c.set(1.0f64, -2.0, 3.5);
            let bytes = archive::to_bytes(&c).unwrap();
            let mut back = CoordsValue::default();
            archive::read_into(&mut back, &bytes).unwrap();
            assert_eq!(back, c);
        }
    }
}
