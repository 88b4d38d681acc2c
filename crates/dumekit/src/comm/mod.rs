//! Message-passing seam of the model.
//!
//! Every collective the mesh protocols need goes through [`Communicator`]:
//! a byte broadcast (size first, then payload), a sparse peer-to-peer
//! exchange, and a value allgather backing the error ACK round. The default
//! build is MPI-free: [`SerialComm`] covers single-process runs and
//! [`LocalComm`] runs a multi-rank world over in-process mailboxes, which
//! is how the protocol tests execute. The `mpi` feature adds an
//! rsmpi-backed implementation with the same contract.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::ids::RankNo;

mod local;
#[cfg(feature = "mpi")]
mod mpi_comm;

pub use local::{LocalComm, LocalWorld};
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;

pub trait Communicator {
    fn rank(&self) -> RankNo;

    fn size(&self) -> i32;

    /// Broadcast a byte buffer from `root`. The payload size travels first
    /// so receivers can allocate; `buf` is replaced on non-root ranks.
    fn broadcast_bytes(&self, root: RankNo, buf: &mut Vec<u8>) -> Result<()>;

    /// Sparse all-to-all: each rank posts buffers keyed by destination and
    /// receives the buffers addressed to it, keyed by source. A collective;
    /// ranks with nothing to send post an empty map.
    fn exchange(&self, sends: &BTreeMap<RankNo, Vec<u8>>) -> Result<BTreeMap<RankNo, Vec<u8>>>;

    /// Gather one value from every rank, in rank order.
    fn allgather_u64(&self, value: u64) -> Result<Vec<u64>>;
}

/// ACK round: agree on the first non-OK error code in rank order, so every
/// rank either continues or returns the same error from the same call site.
pub fn ack(comm: &dyn Communicator, local: Result<()>) -> Result<()> {
    let local_code = match &local {
        Ok(()) => 0,
        Err(e) => e.code(),
    };
    let codes = comm.allgather_u64(u64::from(local_code))?;
    match codes.iter().find(|&&c| c != 0) {
        None => Ok(()),
        Some(&first) => {
            if u64::from(local_code) == first {
                local
            } else {
                Err(Error::from_code(first as u32))
            }
        }
    }
}

/// Single-process communicator: one rank, no peers.
#[derive(Debug, Clone, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> RankNo {
        0
    }

    fn size(&self) -> i32 {
        1
    }

    fn broadcast_bytes(&self, root: RankNo, _buf: &mut Vec<u8>) -> Result<()> {
        if root != 0 {
            return Err(Error::InvalidMpi(format!(
                "broadcast root {root} out of range for serial run"
            )));
        }
        Ok(())
    }

    fn exchange(&self, sends: &BTreeMap<RankNo, Vec<u8>>) -> Result<BTreeMap<RankNo, Vec<u8>>> {
        // only self-sends are possible; deliver them back
        let mut received = BTreeMap::new();
        if let Some(bytes) = sends.get(&0) {
            received.insert(0, bytes.clone());
        }
        for (&dest, _) in sends.iter() {
            if dest != 0 {
                return Err(Error::InvalidMpi(format!(
                    "send to rank {dest} in a serial run"
                )));
            }
        }
        Ok(received)
    }

    fn allgather_u64(&self, value: u64) -> Result<Vec<u64>> {
        Ok(vec![value])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_ack_passes_local_result_through() {
        let comm = SerialComm;
        assert!(ack(&comm, Ok(())).is_ok());
        let err = ack(&comm, Err(Error::Serialize("boom".into())));
        assert_eq!(err.unwrap_err().code(), 130);
    }

    #[test]
    fn test_serial_exchange_rejects_foreign_destinations() {
        let comm = SerialComm;
        let mut sends = BTreeMap::new();
        sends.insert(1, vec![1u8]);
        assert!(comm.exchange(&sends).is_err());
    }
}
