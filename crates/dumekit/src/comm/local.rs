//! In-process multi-rank world.
//!
//! `LocalWorld::new(n)` hands out one communicator per simulated rank; each
//! rank runs on its own thread and the collectives synchronize over shared
//! mailboxes and a barrier. This is the test vehicle for every exchange
//! protocol: the byte traffic is identical to an MPI run, only the
//! transport differs.

use std::collections::BTreeMap;
use std::sync::{Arc, Barrier, Mutex};

use crate::error::{Error, Result};
use crate::ids::RankNo;

use super::Communicator;

#[derive(Debug)]
struct Shared {
    barrier: Barrier,
    mailboxes: Mutex<BTreeMap<(RankNo, RankNo), Vec<u8>>>,
    broadcast: Mutex<Vec<u8>>,
    gather: Mutex<Vec<u64>>,
}

pub struct LocalWorld;

impl LocalWorld {
    /// Communicators for a world of `size` ranks, index = rank.
    pub fn new(size: i32) -> Vec<LocalComm> {
        assert!(size > 0, "world size must be positive");
        let shared = Arc::new(Shared {
            barrier: Barrier::new(size as usize),
            mailboxes: Mutex::new(BTreeMap::new()),
            broadcast: Mutex::new(Vec::new()),
            gather: Mutex::new(vec![0; size as usize]),
        });
        (0..size)
            .map(|rank| LocalComm {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

pub struct LocalComm {
    rank: RankNo,
    size: i32,
    shared: Arc<Shared>,
}

impl Communicator for LocalComm {
    fn rank(&self) -> RankNo {
        self.rank
    }

    fn size(&self) -> i32 {
        self.size
    }

    fn broadcast_bytes(&self, root: RankNo, buf: &mut Vec<u8>) -> Result<()> {
        if root < 0 || root >= self.size {
            return Err(Error::InvalidMpi(format!("broadcast root {root} out of range")));
        }
        if self.rank == root {
            *self.shared.broadcast.lock().unwrap() = buf.clone();
        }
        self.shared.barrier.wait();
        if self.rank != root {
            *buf = self.shared.broadcast.lock().unwrap().clone();
        }
        self.shared.barrier.wait();
        Ok(())
    }

    fn exchange(&self, sends: &BTreeMap<RankNo, Vec<u8>>) -> Result<BTreeMap<RankNo, Vec<u8>>> {
        for &dest in sends.keys() {
            if dest < 0 || dest >= self.size {
                return Err(Error::InvalidMpi(format!("send to rank {dest} out of range")));
            }
        }
        {
            let mut mailboxes = self.shared.mailboxes.lock().unwrap();
            for (&dest, bytes) in sends {
                mailboxes.insert((self.rank, dest), bytes.clone());
            }
        }
        self.shared.barrier.wait();
        let received = {
            let mut mailboxes = self.shared.mailboxes.lock().unwrap();
            let keys: Vec<(RankNo, RankNo)> = mailboxes
                .keys()
                .filter(|(_, dest)| *dest == self.rank)
                .copied()
                .collect();
            keys.into_iter()
                .map(|key| (key.0, mailboxes.remove(&key).unwrap()))
                .collect()
        };
        self.shared.barrier.wait();
        Ok(received)
    }

    fn allgather_u64(&self, value: u64) -> Result<Vec<u64>> {
        {
            let mut gather = self.shared.gather.lock().unwrap();
            gather[self.rank as usize] = value;
        }
        self.shared.barrier.wait();
        let values = self.shared.gather.lock().unwrap().clone();
        self.shared.barrier.wait();
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_world<F>(size: i32, f: F)
    where
        F: Fn(LocalComm) + Send + Sync + 'static,
    {
        let comms = LocalWorld::new(size);
        let f = Arc::new(f);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = Arc::clone(&f);
                thread::spawn(move || f(comm))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_broadcast_reaches_all_ranks() {
        run_world(3, |comm| {
            let mut buf = if comm.rank() == 1 {
                vec![7u8, 8, 9]
            } else {
                Vec::new()
            };
            comm.broadcast_bytes(1, &mut buf).unwrap();
            assert_eq!(buf, vec![7, 8, 9]);
        });
    }

    #[test]
    fn test_exchange_routes_by_destination() {
        run_world(3, |comm| {
            let me = comm.rank();
            let mut sends = BTreeMap::new();
            for peer in 0..comm.size() {
                if peer != me {
                    sends.insert(peer, vec![me as u8, peer as u8]);
                }
            }
            let received = comm.exchange(&sends).unwrap();
            assert_eq!(received.len(), 2);
            for (src, bytes) in received {
                assert_eq!(bytes, vec![src as u8, me as u8]);
            }
        });
    }

    #[test]
    fn test_sparse_exchange_delivers_nothing_to_idle_ranks() {
        run_world(3, |comm| {
            // only rank 0 sends, only to rank 2
            let mut sends = BTreeMap::new();
            if comm.rank() == 0 {
                sends.insert(2, vec![42u8]);
            }
            let received = comm.exchange(&sends).unwrap();
            if comm.rank() == 2 {
                assert_eq!(received.len(), 1);
                assert_eq!(received[&0], vec![42]);
            } else {
                assert!(received.is_empty());
            }
        });
    }

    #[test]
    fn test_allgather_orders_by_rank() {
        run_world(4, |comm| {
            let values = comm.allgather_u64(comm.rank() as u64 * 10).unwrap();
            assert_eq!(values, vec![0, 10, 20, 30]);
        });
    }

    #[test]
    fn test_ack_agrees_on_first_failing_rank() {
        run_world(3, |comm| {
            let local = if comm.rank() == 1 {
                Err(Error::Deserialize("bad buffer".into()))
            } else {
                Ok(())
            };
            let agreed = super::super::ack(&comm, local);
            assert_eq!(agreed.unwrap_err().code(), 131);
        });
    }
}
