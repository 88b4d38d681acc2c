//! The closed set of element topologies.
//!
//! Each type has a fixed node count and a fixed face/edge table used to
//! generate component cells. The integer tags are the wire and file format
//! constants and must not be renumbered.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ElementType {
    /// Point element, used only in wire tags and user data.
    Node = 2,
    Bar2 = 3,
    Tri3 = 5,
    Quad4 = 8,
    Tetra4 = 10,
    Hexa8 = 12,
    Penta6 = 13,
    Pyra5 = 14,
    /// Section sentinel: element type is enumerated per cell inline in the
    /// connectivity stream.
    Mixed = 20,
}

/// Dimensional class deciding component generation: solids produce faces,
/// shells produce edges, bars produce nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementClass {
    Bar,
    Shell,
    Solid,
}

/// One face or edge of an element: the component's own type plus 1-based
/// local node indices into the parent connectivity.
#[derive(Debug, Clone, Copy)]
pub struct ComponentDef {
    pub element_type: ElementType,
    pub nodes: &'static [usize],
}

const TETRA4_FACES: [ComponentDef; 4] = [
    ComponentDef { element_type: ElementType::Tri3, nodes: &[1, 3, 2] },
    ComponentDef { element_type: ElementType::Tri3, nodes: &[1, 2, 4] },
    ComponentDef { element_type: ElementType::Tri3, nodes: &[2, 3, 4] },
    ComponentDef { element_type: ElementType::Tri3, nodes: &[3, 1, 4] },
];

const PYRA5_FACES: [ComponentDef; 5] = [
    ComponentDef { element_type: ElementType::Quad4, nodes: &[1, 4, 3, 2] },
    ComponentDef { element_type: ElementType::Tri3, nodes: &[1, 2, 5] },
    ComponentDef { element_type: ElementType::Tri3, nodes: &[2, 3, 5] },
    ComponentDef { element_type: ElementType::Tri3, nodes: &[3, 4, 5] },
    ComponentDef { element_type: ElementType::Tri3, nodes: &[4, 1, 5] },
];

const PENTA6_FACES: [ComponentDef; 5] = [
    ComponentDef { element_type: ElementType::Quad4, nodes: &[1, 2, 5, 4] },
    ComponentDef { element_type: ElementType::Quad4, nodes: &[2, 3, 6, 5] },
    ComponentDef { element_type: ElementType::Quad4, nodes: &[3, 1, 4, 6] },
    ComponentDef { element_type: ElementType::Tri3, nodes: &[1, 3, 2] },
    ComponentDef { element_type: ElementType::Tri3, nodes: &[4, 5, 6] },
];

const HEXA8_FACES: [ComponentDef; 6] = [
    ComponentDef { element_type: ElementType::Quad4, nodes: &[1, 4, 3, 2] },
    ComponentDef { element_type: ElementType::Quad4, nodes: &[1, 2, 6, 5] },
    ComponentDef { element_type: ElementType::Quad4, nodes: &[2, 3, 7, 6] },
    ComponentDef { element_type: ElementType::Quad4, nodes: &[3, 4, 8, 7] },
    ComponentDef { element_type: ElementType::Quad4, nodes: &[1, 5, 8, 4] },
    ComponentDef { element_type: ElementType::Quad4, nodes: &[5, 6, 7, 8] },
];

const TRI3_EDGES: [ComponentDef; 3] = [
    ComponentDef { element_type: ElementType::Bar2, nodes: &[1, 2] },
    ComponentDef { element_type: ElementType::Bar2, nodes: &[2, 3] },
    ComponentDef { element_type: ElementType::Bar2, nodes: &[3, 1] },
];

const QUAD4_EDGES: [ComponentDef; 4] = [
    ComponentDef { element_type: ElementType::Bar2, nodes: &[1, 2] },
    ComponentDef { element_type: ElementType::Bar2, nodes: &[2, 3] },
    ComponentDef { element_type: ElementType::Bar2, nodes: &[3, 4] },
    ComponentDef { element_type: ElementType::Bar2, nodes: &[4, 1] },
];

impl ElementType {
    /// Wire/file tag. Inverse of [`ElementType::from_tag`].
    pub fn tag(&self) -> i32 {
        *self as i32
    }

    pub fn from_tag(tag: i32) -> Result<ElementType> {
        match tag {
            2 => Ok(ElementType::Node),
            3 => Ok(ElementType::Bar2),
            5 => Ok(ElementType::Tri3),
            8 => Ok(ElementType::Quad4),
            10 => Ok(ElementType::Tetra4),
            // 11 is the legacy variant tag for hexahedra
            11 | 12 => Ok(ElementType::Hexa8),
            13 => Ok(ElementType::Penta6),
            14 => Ok(ElementType::Pyra5),
            20 => Ok(ElementType::Mixed),
            _ => Err(Error::InvalidElementType(format!("unknown tag {tag}"))),
        }
    }

    /// Entity element types accepted in a section. `Node` and `Mixed` are
    /// tags, not insertable cells.
    pub fn is_supported_cell(&self) -> bool {
        !matches!(self, ElementType::Node | ElementType::Mixed)
    }

    pub fn num_nodes(&self) -> Option<usize> {
        match self {
            ElementType::Node => Some(1),
            ElementType::Bar2 => Some(2),
            ElementType::Tri3 => Some(3),
            ElementType::Quad4 => Some(4),
            ElementType::Tetra4 => Some(4),
            ElementType::Pyra5 => Some(5),
            ElementType::Penta6 => Some(6),
            ElementType::Hexa8 => Some(8),
            ElementType::Mixed => None,
        }
    }

    pub fn class(&self) -> Option<ElementClass> {
        match self {
            ElementType::Bar2 => Some(ElementClass::Bar),
            ElementType::Tri3 | ElementType::Quad4 => Some(ElementClass::Shell),
            ElementType::Tetra4 | ElementType::Pyra5 | ElementType::Penta6 | ElementType::Hexa8 => {
                Some(ElementClass::Solid)
            }
            ElementType::Node | ElementType::Mixed => None,
        }
    }

    /// Topological dimension: 1 for bars, 2 for shells, 3 for solids.
    pub fn dimension(&self) -> Option<i32> {
        match self.class()? {
            ElementClass::Bar => Some(1),
            ElementClass::Shell => Some(2),
            ElementClass::Solid => Some(3),
        }
    }

    /// Face table for solids, edge table for shells, empty for bars.
    pub fn component_table(&self) -> &'static [ComponentDef] {
        match self {
            ElementType::Tetra4 => &TETRA4_FACES,
            ElementType::Pyra5 => &PYRA5_FACES,
            ElementType::Penta6 => &PENTA6_FACES,
            ElementType::Hexa8 => &HEXA8_FACES,
            ElementType::Tri3 => &TRI3_EDGES,
            ElementType::Quad4 => &QUAD4_EDGES,
            _ => &[],
        }
    }

    pub fn num_components(&self) -> usize {
        self.component_table().len()
    }

    /// Degenerate types may legally repeat a node in their connectivity.
    /// Only bars qualify here.
    pub fn allows_duplicate_nodes(&self) -> bool {
        matches!(self, ElementType::Bar2)
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ElementType::Node => "NODE",
            ElementType::Bar2 => "BAR_2",
            ElementType::Tri3 => "TRI_3",
            ElementType::Quad4 => "QUAD_4",
            ElementType::Tetra4 => "TETRA_4",
            ElementType::Pyra5 => "PYRA_5",
            ElementType::Penta6 => "PENTA_6",
            ElementType::Hexa8 => "HEXA_8",
            ElementType::Mixed => "MIXED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_roundtrip() {
        for et in [
            ElementType::Node,
            ElementType::Bar2,
            ElementType::Tri3,
            ElementType::Quad4,
            ElementType::Tetra4,
            ElementType::Hexa8,
            ElementType::Penta6,
            ElementType::Pyra5,
            ElementType::Mixed,
        ] {
            assert_eq!(ElementType::from_tag(et.tag()).unwrap(), et);
        }
        // legacy hexahedron variant
        assert_eq!(ElementType::from_tag(11).unwrap(), ElementType::Hexa8);
        assert!(ElementType::from_tag(99).is_err());
    }

    #[test]
    fn test_node_counts() {
        assert_eq!(ElementType::Bar2.num_nodes(), Some(2));
        assert_eq!(ElementType::Tetra4.num_nodes(), Some(4));
        assert_eq!(ElementType::Pyra5.num_nodes(), Some(5));
        assert_eq!(ElementType::Penta6.num_nodes(), Some(6));
        assert_eq!(ElementType::Hexa8.num_nodes(), Some(8));
        assert_eq!(ElementType::Mixed.num_nodes(), None);
    }

    #[test]
    fn test_component_tables() {
        assert_eq!(ElementType::Tetra4.num_components(), 4);
        assert_eq!(ElementType::Pyra5.num_components(), 5);
        assert_eq!(ElementType::Penta6.num_components(), 5);
        assert_eq!(ElementType::Hexa8.num_components(), 6);
        assert_eq!(ElementType::Tri3.num_components(), 3);
        assert_eq!(ElementType::Quad4.num_components(), 4);
        assert_eq!(ElementType::Bar2.num_components(), 0);

        // every face/edge references valid local node indices
        for et in [
            ElementType::Tri3,
            ElementType::Quad4,
            ElementType::Tetra4,
            ElementType::Pyra5,
            ElementType::Penta6,
            ElementType::Hexa8,
        ] {
            let n = et.num_nodes().unwrap();
            for def in et.component_table() {
                assert_eq!(def.element_type.num_nodes().unwrap(), def.nodes.len());
                for &local in def.nodes {
                    assert!(local >= 1 && local <= n, "{et}: local index {local}");
                }
            }
        }
    }

    #[test]
    fn test_solid_faces_cover_each_edge_twice() {
        // closed polyhedron: every edge appears in exactly two faces
        for et in [
            ElementType::Tetra4,
            ElementType::Pyra5,
            ElementType::Penta6,
            ElementType::Hexa8,
        ] {
            let mut edge_counts = std::collections::HashMap::new();
            for def in et.component_table() {
                let k = def.nodes.len();
                for i in 0..k {
                    let a = def.nodes[i];
                    let b = def.nodes[(i + 1) % k];
                    let key = (a.min(b), a.max(b));
                    *edge_counts.entry(key).or_insert(0) += 1;
                }
            }
            assert!(edge_counts.values().all(|&c| c == 2), "{et}");
        }
    }
}
