//! Partitioner seam.
//!
//! The graph-partitioning engine itself is an external collaborator: the
//! model hands it a weighted cell-connectivity graph and receives lists of
//! cell global-ids to move between ranks. [`GreedyPartitioner`] is the
//! bundled reference implementation, growing weight-balanced regions over
//! the petgraph adjacency; production runs plug a real engine in through
//! the [`Partitioner`] trait.

use std::collections::BTreeMap;

use petgraph::graph::{NodeIndex, UnGraph};
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::ids::{GlobalRankId, RankNo};
use crate::model::cell::neighbor_cells;
use crate::model::zone::Zone;

/// Weighted cell-connectivity graph of the cells owned by this rank.
/// Node weights are the partition weights (1.0 when unset); edges connect
/// cells sharing a component.
pub struct CellGraph {
    pub graph: UnGraph<GlobalRankId, ()>,
    pub weights: Vec<f32>,
}

impl CellGraph {
    /// Build from the zone's entity cells. Component cells must be up to
    /// date; they define the adjacency.
    pub fn from_zone(zone: &Zone) -> CellGraph {
        let cells = zone.sections().entity_cells();
        let mut graph = UnGraph::new_undirected();
        let mut weights = Vec::with_capacity(cells.len());
        let mut index_of: FxHashMap<GlobalRankId, NodeIndex> = FxHashMap::default();

        for cell in cells {
            let gid = cell.borrow().entity.global_id();
            let weight = cell.borrow().entity.partition_weight();
            let index = graph.add_node(gid);
            weights.push(if weight > 0.0 { weight } else { 1.0 });
            index_of.insert(gid, index);
        }
        for cell in cells {
            let from = index_of[&cell.borrow().entity.global_id()];
            for neighbor in neighbor_cells(cell) {
                let ngid = neighbor.borrow().entity.global_id();
                if let Some(&to) = index_of.get(&ngid) {
                    if from < to {
                        graph.add_edge(from, to, ());
                    }
                }
            }
        }
        CellGraph { graph, weights }
    }

    pub fn num_cells(&self) -> usize {
        self.graph.node_count()
    }
}

/// One repartitioning decision on this rank: which local cells leave, and
/// where to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionPlan {
    pub exports: BTreeMap<RankNo, Vec<GlobalRankId>>,
}

impl PartitionPlan {
    pub fn new() -> Self {
        PartitionPlan::default()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.values().all(Vec::is_empty)
    }

    pub fn num_exported(&self) -> usize {
        self.exports.values().map(Vec::len).sum()
    }
}

pub trait Partitioner {
    /// Assign a target rank to every node of the graph, in graph order.
    fn assign(&self, graph: &CellGraph) -> Result<Vec<RankNo>>;
}

/// Weight-balanced region growing: parts are grown breadth-first over the
/// adjacency until each reaches its share of the total weight.
pub struct GreedyPartitioner {
    pub num_parts: i32,
}

impl GreedyPartitioner {
    pub fn new(num_parts: i32) -> Self {
        GreedyPartitioner { num_parts }
    }
}

impl Partitioner for GreedyPartitioner {
    fn assign(&self, graph: &CellGraph) -> Result<Vec<RankNo>> {
        if self.num_parts <= 0 {
            return Err(Error::InvalidParameter(format!(
                "num_parts {} must be positive",
                self.num_parts
            )));
        }
        let n = graph.num_cells();
        let mut targets: Vec<RankNo> = vec![-1; n];
        if n == 0 {
            return Ok(targets);
        }
        let total: f32 = graph.weights.iter().sum();
        let share = total / self.num_parts as f32;

        let mut part: RankNo = 0;
        let mut accumulated = 0.0f32;
        let mut queue = std::collections::VecDeque::new();
        let mut assigned = 0usize;

        while assigned < n {
            let seed = match queue.pop_front() {
                Some(index) => index,
                None => {
                    // next unassigned cell seeds the region (or a new
                    // connected part of it)
                    let index = (0..n)
                        .map(NodeIndex::new)
                        .find(|i| targets[i.index()] < 0)
                        .expect("unassigned node exists");
                    index
                }
            };
            if targets[seed.index()] >= 0 {
                continue;
            }
            targets[seed.index()] = part;
            accumulated += graph.weights[seed.index()];
            assigned += 1;
            for neighbor in graph.graph.neighbors(seed) {
                if targets[neighbor.index()] < 0 {
                    queue.push_back(neighbor);
                }
            }
            if accumulated >= share && part + 1 < self.num_parts {
                part += 1;
                accumulated = 0.0;
                queue.clear();
            }
        }
        Ok(targets)
    }
}

/// Turn an assignment into this rank's export plan: every cell whose
/// target differs from `my_rank` leaves.
pub fn plan_from_assignment(
    graph: &CellGraph,
    targets: &[RankNo],
    my_rank: RankNo,
) -> Result<PartitionPlan> {
    if targets.len() != graph.num_cells() {
        return Err(Error::InvalidParameter(format!(
            "{} targets for {} cells",
            targets.len(),
            graph.num_cells()
        )));
    }
    let mut plan = PartitionPlan::new();
    for (index, &target) in targets.iter().enumerate() {
        if target < 0 {
            return Err(Error::InvalidParameter(format!(
                "cell at index {index} left unassigned"
            )));
        }
        if target != my_rank {
            let gid = graph.graph[NodeIndex::new(index)];
            plan.exports.entry(target).or_default().push(gid);
        }
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;
    use crate::model::element_type::ElementType;
    use std::rc::Rc;

    fn two_tetra_zone() -> Zone {
        let mut zone = Zone::new("fluid", 1, Rc::new(SerialComm));
        zone.insert_grid_coordinates(0.0f64, 0.0, 0.0);
        zone.insert_grid_coordinates(1.0f64, 0.0, 0.0);
        zone.insert_grid_coordinates(0.0f64, 1.0, 0.0);
        zone.insert_grid_coordinates(0.0f64, 0.0, 1.0);
        zone.insert_grid_coordinates(1.0f64, 1.0, 1.0);
        zone.insert_cell(ElementType::Tetra4, &[1, 2, 3, 4]).unwrap();
        zone.insert_cell(ElementType::Tetra4, &[2, 3, 4, 5]).unwrap();
        zone.create_component_cells().unwrap();
        zone
    }

    #[test]
    fn test_graph_from_zone_connects_face_neighbors() {
        let zone = two_tetra_zone();
        let graph = CellGraph::from_zone(&zone);
        assert_eq!(graph.num_cells(), 2);
        assert_eq!(graph.graph.edge_count(), 1);
        assert_eq!(graph.weights, vec![1.0, 1.0]);
    }

    #[test]
    fn test_greedy_assignment_covers_all_cells() {
        let zone = two_tetra_zone();
        let graph = CellGraph::from_zone(&zone);
        let targets = GreedyPartitioner::new(2).assign(&graph).unwrap();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|&t| t == 0 || t == 1));
        // both parts are used
        assert_ne!(targets[0], targets[1]);
    }

    #[test]
    fn test_plan_from_assignment_splits_by_target() {
        let zone = two_tetra_zone();
        let graph = CellGraph::from_zone(&zone);
        let targets = vec![0, 1];
        let plan = plan_from_assignment(&graph, &targets, 0).unwrap();
        assert_eq!(plan.num_exported(), 1);
        assert_eq!(plan.exports[&1].len(), 1);

        // identity assignment yields an empty plan
        let stay = plan_from_assignment(&graph, &[0, 0], 0).unwrap();
        assert!(stay.is_empty());
    }

    #[test]
    fn test_single_part_keeps_everything() {
        let zone = two_tetra_zone();
        let graph = CellGraph::from_zone(&zone);
        let targets = GreedyPartitioner::new(1).assign(&graph).unwrap();
        assert!(targets.iter().all(|&t| t == 0));
    }
}
