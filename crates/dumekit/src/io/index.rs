//! Side-car index file (`*.dfi`): the run-level description of a
//! distributed mesh, covering file naming, domain summary, process layout,
//! time-slice records and the solution-field catalog.

use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::RankNo;
use crate::model::solution::FlowSolutions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Base name of every mesh file.
    pub prefix: String,
    /// Directory holding the mesh files, relative to the index file.
    pub directory_path: String,
    /// Path inside each file to the element data (base/zone addressing).
    pub element_path: String,
    /// Whether grid coordinates are rewritten every time slice.
    pub grid_per_step: bool,
    /// Whether solutions are written separately from the grid.
    pub split_solution: bool,
    /// Mesh file extension; `json` and `yaml` are understood.
    pub file_format: String,
}

impl Default for FileInfo {
    fn default() -> Self {
        FileInfo {
            prefix: "mesh".into(),
            directory_path: ".".into(),
            element_path: String::new(),
            grid_per_step: false,
            split_solution: false,
            file_format: "json".into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub cell_dimension: i32,
    pub node_count: u64,
    pub cell_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MpiInfo {
    pub process_size: i32,
    pub group_size: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub rankno: RankNo,
    pub node_count: u64,
    pub cell_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSlice {
    pub step: u64,
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_step: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_time: Option<f64>,
}

/// The whole index-file document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DfiConfig {
    pub file_info: FileInfo,
    pub domain: DomainInfo,
    pub mpi: MpiInfo,
    pub processes: Vec<ProcessInfo>,
    pub time_slices: Vec<TimeSlice>,
    pub flow_solutions: FlowSolutions,
}

impl DfiConfig {
    pub fn read(path: &Path) -> Result<DfiConfig> {
        let file =
            File::open(path).map_err(|e| Error::FileOpen(format!("{}: {e}", path.display())))?;
        serde_json::from_reader(file)
            .map_err(|e| Error::InvalidParameter(format!("index file {}: {e}", path.display())))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let file =
            File::create(path).map_err(|e| Error::FileOpen(format!("{}: {e}", path.display())))?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| Error::InvalidParameter(format!("index file {}: {e}", path.display())))
    }

    /// Record a written time slice, replacing an existing record for the
    /// same step.
    pub fn add_time_slice(
        &mut self,
        step: u64,
        time: f64,
        average: Option<(u64, f64)>,
    ) {
        self.time_slices.retain(|slice| slice.step != step);
        self.time_slices.push(TimeSlice {
            step,
            time,
            average_step: average.map(|(s, _)| s),
            average_time: average.map(|(_, t)| t),
        });
        self.time_slices.sort_by_key(|slice| slice.step);
    }

    pub fn find_time_slice(&self, step: u64) -> Option<&TimeSlice> {
        self.time_slices.iter().find(|slice| slice.step == step)
    }

    pub fn last_time_slice(&self) -> Option<&TimeSlice> {
        self.time_slices.last()
    }

    /// Mesh file path for one source rank, resolved against the index-file
    /// location. `step` is included when grids are time-sliced.
    pub fn mesh_file_path(&self, base_dir: &Path, rankno: RankNo, step: Option<u64>) -> PathBuf {
        let name = match step {
            Some(step) if self.file_info.grid_per_step => format!(
                "{}_{:010}_id{:06}.{}",
                self.file_info.prefix, step, rankno, self.file_info.file_format
            ),
            _ => format!(
                "{}_id{:06}.{}",
                self.file_info.prefix, rankno, self.file_info.file_format
            ),
        };
        base_dir.join(&self.file_info.directory_path).join(name)
    }

    /// Solution-only file for one rank and step.
    pub fn solution_file_path(&self, base_dir: &Path, rankno: RankNo, step: u64) -> PathBuf {
        let name = format!(
            "{}_sol_{:010}_id{:06}.{}",
            self.file_info.prefix, step, rankno, self.file_info.file_format
        );
        base_dir.join(&self.file_info.directory_path).join(name)
    }

    /// Link file aggregating grid and solution files for one rank/step.
    pub fn link_file_path(&self, base_dir: &Path, rankno: RankNo, step: u64) -> PathBuf {
        let name = format!(
            "{}_{:010}_id{:06}_link.{}",
            self.file_info.prefix, step, rankno, self.file_info.file_format
        );
        base_dir.join(&self.file_info.directory_path).join(name)
    }

    /// Which source-rank files this reading rank loads: files are dealt
    /// round-robin so one file is read by exactly one rank.
    pub fn io_rank_files(&self, my_rank: RankNo, comm_size: i32) -> Vec<RankNo> {
        let num_files = self.mpi.process_size.max(self.processes.len() as i32);
        (0..num_files)
            .filter(|file_rank| file_rank % comm_size == my_rank)
            .collect()
    }

    /// Refresh the per-process and domain summaries from gathered counts.
    pub fn update_process_counts(&mut self, node_counts: &[u64], cell_counts: &[u64]) {
        self.processes = node_counts
            .iter()
            .zip(cell_counts)
            .enumerate()
            .map(|(rankno, (&nodes, &cells))| ProcessInfo {
                rankno: rankno as RankNo,
                node_count: nodes,
                cell_count: cells,
            })
            .collect();
        self.mpi.process_size = self.processes.len() as i32;
        self.domain.node_count = node_counts.iter().sum();
        self.domain.cell_count = cell_counts.iter().sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::{DataType, GridLocation};

    #[test]
    fn test_index_file_roundtrip() {
        let mut config = DfiConfig::default();
        config.file_info.prefix = "cavity".into();
        config.domain.cell_dimension = 3;
        config
            .flow_solutions
            .create_field("pressure", DataType::RealSingle, GridLocation::Vertex)
            .unwrap();
        config.add_time_slice(0, 0.0, None);
        config.add_time_slice(10, 0.5, Some((5, 0.25)));
        config.update_process_counts(&[4, 6], &[1, 2]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cavity.dfi");
        config.write(&path).unwrap();
        let back = DfiConfig::read(&path).unwrap();
        assert_eq!(back, config);
        assert_eq!(back.domain.node_count, 10);
        assert_eq!(back.domain.cell_count, 3);
        assert_eq!(back.find_time_slice(10).unwrap().average_step, Some(5));
    }

    #[test]
    fn test_time_slice_replacement_keeps_order() {
        let mut config = DfiConfig::default();
        config.add_time_slice(5, 1.0, None);
        config.add_time_slice(1, 0.1, None);
        config.add_time_slice(5, 2.0, None);
        let steps: Vec<u64> = config.time_slices.iter().map(|s| s.step).collect();
        assert_eq!(steps, vec![1, 5]);
        assert_eq!(config.find_time_slice(5).unwrap().time, 2.0);
    }

    #[test]
    fn test_mesh_file_naming() {
        let mut config = DfiConfig::default();
        config.file_info.prefix = "duct".into();
        config.file_info.directory_path = "out".into();
        let base = Path::new("/work");
        assert_eq!(
            config.mesh_file_path(base, 3, None),
            Path::new("/work/out/duct_id000003.json")
        );
        config.file_info.grid_per_step = true;
        assert_eq!(
            config.mesh_file_path(base, 3, Some(12)),
            Path::new("/work/out/duct_0000000012_id000003.json")
        );
        assert_eq!(
            config.solution_file_path(base, 0, 7),
            Path::new("/work/out/duct_sol_0000000007_id000000.json")
        );
    }

    #[test]
    fn test_io_rank_mapping_round_robin() {
        let mut config = DfiConfig::default();
        config.mpi.process_size = 4;
        // 2 reading ranks for 4 files
        assert_eq!(config.io_rank_files(0, 2), vec![0, 2]);
        assert_eq!(config.io_rank_files(1, 2), vec![1, 3]);
        // as many readers as files
        assert_eq!(config.io_rank_files(2, 4), vec![2]);
        // more readers than files
        assert_eq!(config.io_rank_files(5, 8), Vec::<RankNo>::new());
    }
}
