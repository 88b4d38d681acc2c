//! rsmpi-backed communicator, enabled with the `mpi` feature.

use std::collections::BTreeMap;

use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use crate::error::{Error, Result};
use crate::ids::RankNo;

use super::Communicator;

pub struct MpiComm {
    world: SimpleCommunicator,
}

impl MpiComm {
    /// Wrap an MPI world communicator. The caller keeps the `Universe`
    /// alive for the lifetime of this value.
    pub fn new(world: SimpleCommunicator) -> Self {
        MpiComm { world }
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> RankNo {
        self.world.rank()
    }

    fn size(&self) -> i32 {
        self.world.size()
    }

    fn broadcast_bytes(&self, root: RankNo, buf: &mut Vec<u8>) -> Result<()> {
        if root < 0 || root >= self.world.size() {
            return Err(Error::InvalidMpi(format!("broadcast root {root} out of range")));
        }
        let root_process = self.world.process_at_rank(root);
        let mut len = buf.len() as u64;
        root_process.broadcast_into(&mut len);
        if self.world.rank() != root {
            buf.resize(len as usize, 0);
        }
        if len > 0 {
            root_process.broadcast_into(&mut buf[..]);
        }
        Ok(())
    }

    fn exchange(&self, sends: &BTreeMap<RankNo, Vec<u8>>) -> Result<BTreeMap<RankNo, Vec<u8>>> {
        let size = self.world.size() as usize;
        let mut send_counts = vec![0u64; size];
        for (&dest, bytes) in sends {
            if dest < 0 || dest >= self.world.size() {
                return Err(Error::InvalidMpi(format!("send to rank {dest} out of range")));
            }
            send_counts[dest as usize] = bytes.len() as u64;
        }
        let mut recv_counts = vec![0u64; size];
        self.world
            .all_to_all_into(&send_counts[..], &mut recv_counts[..]);

        let mut received = BTreeMap::new();
        mpi::request::scope(|scope| {
            let mut guards = Vec::new();
            for (&dest, bytes) in sends {
                if !bytes.is_empty() {
                    let guard = self
                        .world
                        .process_at_rank(dest)
                        .immediate_send(scope, &bytes[..]);
                    guards.push(guard);
                }
            }
            for (src, &count) in recv_counts.iter().enumerate() {
                if count > 0 {
                    let (bytes, _status) = self
                        .world
                        .process_at_rank(src as RankNo)
                        .receive_vec::<u8>();
                    received.insert(src as RankNo, bytes);
                }
            }
            for guard in guards {
                guard.wait();
            }
        });
        Ok(received)
    }

    fn allgather_u64(&self, value: u64) -> Result<Vec<u64>> {
        let mut values = vec![0u64; self.world.size() as usize];
        self.world.all_gather_into(&value, &mut values[..]);
        Ok(values)
    }
}
