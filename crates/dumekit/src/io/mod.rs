//! Persistence: the side-car index file and the mesh-file store.

mod index;
mod store;

pub use index::{DfiConfig, DomainInfo, FileInfo, MpiInfo, ProcessInfo, TimeSlice};
pub use store::{
    apply_doc_to_zone, apply_solutions_to_zone, read_link_file, read_mesh_file, write_link_file,
    write_mesh_file, zone_to_doc, BaseDoc, BaseIterativeDoc, FieldDoc, GridDoc, LinkDocument,
    MeshDocument, RankConnectivityEntry, SectionDoc, SolutionNodeDoc, WriteOptions, WriterInfo,
    ZoneDoc, ZoneIterativeDoc, WRITER_VERSION,
};
