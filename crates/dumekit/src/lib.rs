//! Distributed unstructured mesh management for scientific simulation.
//!
//! A mesh is a collection of nodes (3D coordinates carrying physical
//! quantities) and cells (connectivity elements such as tetrahedra,
//! hexahedra, triangles), split into zones and distributed across parallel
//! processes. This crate provides:
//!
//! - the in-memory model (`model`): zones composing node pools, element
//!   sections, solution fields, user data and boundary bookkeeping;
//! - the rank-connectivity layer: for every boundary node, which peer
//!   ranks share the same physical node and under what (rank, local-id)
//!   each peer knows it;
//! - the import/export protocol driving repartitioning: cells (and their
//!   induced nodes) move between ranks while global identity is preserved,
//!   boundary maps are repaired, ids are renumbered and the changes are
//!   propagated to every peer;
//! - the virtual-cell protocol: each rank holds a one-layer halo of
//!   neighbor-owned cells so stencil computations have local access;
//! - the serialization archive (`archive`): the two-pass byte format every
//!   cross-rank transfer travels in;
//! - persistence (`io`): mesh documents mirroring the CGNS node layout
//!   plus the side-car index file enumerating time slices, field catalogs
//!   and the rank-to-file mapping.
//!
//! Collectives go through the `comm::Communicator` seam; the default build
//! is MPI-free and multi-rank behavior is exercised in-process through
//! `comm::LocalWorld`. The `mpi` feature plugs in rsmpi.

pub mod archive;
pub mod comm;
pub mod error;
pub mod ids;
pub mod io;
pub mod model;
pub mod partition;

pub mod prelude {
    pub use crate::archive::{Serializable, SerializeArchive};
    pub use crate::comm::{Communicator, LocalWorld, SerialComm};
    pub use crate::error::{Error, Result, Warning};
    pub use crate::ids::{GlobalRankId, GlobalRankIdList, GlobalRankIdPair, GlobalRankIdPairList};
    pub use crate::io::{DfiConfig, MeshDocument, WriteOptions, WriterInfo};
    pub use crate::model::{
        Cell, CellRef, CoordsValue, DataType, ElementType, Entity, FlowSolutions, GridLocation,
        Model, Node, NodeRef, RealityType, VectorType, Zone,
    };
    pub use crate::partition::{GreedyPartitioner, PartitionPlan, Partitioner};
}

pub use error::{Error, Result, Warning};
pub use model::Model;
