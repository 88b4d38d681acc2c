use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Numeric datatypes of coordinates and solution fields. A closed set; the
/// wire and file formats tag values with these.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Integer = 1,
    LongInteger = 2,
    RealSingle = 3,
    RealDouble = 4,
}

impl DataType {
    pub fn size_of(&self) -> usize {
        match self {
            DataType::Integer => 4,
            DataType::LongInteger => 8,
            DataType::RealSingle => 4,
            DataType::RealDouble => 8,
        }
    }

    pub fn from_tag(tag: i32) -> Result<DataType> {
        match tag {
            1 => Ok(DataType::Integer),
            2 => Ok(DataType::LongInteger),
            3 => Ok(DataType::RealSingle),
            4 => Ok(DataType::RealDouble),
            _ => Err(Error::InvalidParameter(format!("unknown datatype tag {tag}"))),
        }
    }

    pub fn tag(&self) -> i32 {
        *self as i32
    }
}

/// Whether an entity is owned by this rank or is a read-only ghost copy of
/// a neighbor's entity.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RealityType {
    Actual = 1,
    Virtual = 2,
}

impl RealityType {
    pub fn from_tag(tag: i32) -> Result<RealityType> {
        match tag {
            1 => Ok(RealityType::Actual),
            2 => Ok(RealityType::Virtual),
            _ => Err(Error::InvalidParameter(format!("unknown reality tag {tag}"))),
        }
    }
}

/// Where a solution field lives.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GridLocation {
    Vertex = 1,
    CellCenter = 2,
}

impl GridLocation {
    pub fn tag(&self) -> i32 {
        *self as i32
    }

    pub fn from_tag(tag: i32) -> Result<GridLocation> {
        match tag {
            1 => Ok(GridLocation::Vertex),
            2 => Ok(GridLocation::CellCenter),
            _ => Err(Error::InvalidParameter(format!("unknown location tag {tag}"))),
        }
    }
}

/// Classification of a solution field's value shape.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VectorType {
    Scalar = 1,
    Vector = 2,
}

impl VectorType {
    pub fn from_tag(tag: i32) -> Result<VectorType> {
        match tag {
            1 => Ok(VectorType::Scalar),
            2 => Ok(VectorType::Vector),
            _ => Err(Error::InvalidParameter(format!("unknown vector tag {tag}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulationType {
    #[default]
    Unknown,
    TimeAccurate,
    NonTimeAccurate,
}

/// Only unstructured zones are representable.
#[repr(i32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneType {
    #[default]
    Unstructured = 1,
}

/// Conversion seam for the four numeric value types. Conversions follow
/// plain `as` casts per source type so that each width keeps its exact
/// behavior instead of funneling through a single float type.
pub trait DataValue: Copy + Default + PartialEq + std::fmt::Debug + 'static {
    const DATA_TYPE: DataType;

    fn from_i32(v: i32) -> Self;
    fn from_i64(v: i64) -> Self;
    fn from_f32(v: f32) -> Self;
    fn from_f64(v: f64) -> Self;
    fn into_i32(self) -> i32;
    fn into_i64(self) -> i64;
    fn into_f32(self) -> f32;
    fn into_f64(self) -> f64;
}

macro_rules! impl_data_value {
    ($ty:ty, $data_type:expr) => {
        impl DataValue for $ty {
            const DATA_TYPE: DataType = $data_type;

            fn from_i32(v: i32) -> Self {
                v as $ty
            }
            fn from_i64(v: i64) -> Self {
                v as $ty
            }
            fn from_f32(v: f32) -> Self {
                v as $ty
            }
            fn from_f64(v: f64) -> Self {
                v as $ty
            }
            fn into_i32(self) -> i32 {
                self as i32
            }
            fn into_i64(self) -> i64 {
                self as i64
            }
            fn into_f32(self) -> f32 {
                self as f32
            }
            fn into_f64(self) -> f64 {
                self as f64
            }
        }
    };
}

impl_data_value!(i32, DataType::Integer);
impl_data_value!(i64, DataType::LongInteger);
impl_data_value!(f32, DataType::RealSingle);
impl_data_value!(f64, DataType::RealDouble);
