//! Global identity of mesh entities across ranks.
//!
//! An entity is identified job-wide by the pair (owner rank, local id).
//! Sorted id lists back the mpi-rank and previous-rank bookkeeping of every
//! node and cell; pair lists carry (old → new) and (mine → peer) id
//! relations during migration.

use crate::archive::{Serializable, SerializeArchive};
use crate::error::{Error, Result};

/// Rank number of an owning process. `-1` marks an unset rank.
pub type RankNo = i32;

/// 1-based local id within a container. `0` marks an unset id.
pub type LocalId = u64;

/// (rank, local id) pair. Ordering is lexicographic: rank first, then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalRankId {
    pub rankno: RankNo,
    pub localid: LocalId,
}

impl GlobalRankId {
    pub fn new(rankno: RankNo, localid: LocalId) -> Self {
        GlobalRankId { rankno, localid }
    }

    pub fn invalid() -> Self {
        GlobalRankId {
            rankno: -1,
            localid: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.rankno >= 0 && self.localid > 0
    }

    pub fn equals(&self, rankno: RankNo, localid: LocalId) -> bool {
        self.rankno == rankno && self.localid == localid
    }
}

impl std::fmt::Display for GlobalRankId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.localid, self.rankno)
    }
}

impl Serializable for GlobalRankId {
    fn serialize(&self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        archive.write_i32(self.rankno);
        archive.write_u64(self.localid);
        Ok(())
    }

    fn deserialize(&mut self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        self.rankno = archive.read_i32()?;
        self.localid = archive.read_u64()?;
        Ok(())
    }
}

/// Serialized byte count of one id entry.
const GLOBAL_RANKID_COMM_SIZE: usize = 4 + 8;

/// Sorted list of unique global ids.
///
/// Lookup runs binary search with an id-offset shortcut: when the searched
/// id lies inside the interval covered by the first entry's id and the list
/// length, the position is probed directly before bisecting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalRankIdList {
    list: Vec<GlobalRankId>,
}

impl GlobalRankIdList {
    pub fn new() -> Self {
        GlobalRankIdList { list: Vec::new() }
    }

    pub fn with_capacity(size: usize) -> Self {
        GlobalRankIdList {
            list: Vec::with_capacity(size),
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }

    pub fn reserve(&mut self, additional: usize) {
        self.list.reserve(additional);
    }

    pub fn iter(&self) -> impl Iterator<Item = &GlobalRankId> {
        self.list.iter()
    }

    pub fn get(&self, index: usize) -> Option<GlobalRankId> {
        self.list.get(index).copied()
    }

    /// Binary search with the id-offset shortcut. `Ok(pos)` when found,
    /// `Err(pos)` with the insertion position otherwise.
    fn find_position(&self, target: GlobalRankId) -> std::result::Result<usize, usize> {
        let len = self.list.len();
        if len == 0 {
            return Err(0);
        }
        let first = self.list[0];
        let last = self.list[len - 1];
        if first > target {
            return Err(0);
        }
        if last < target {
            return Err(len);
        }

        let mut left = 0usize;
        let mut right = len;
        // Direct probe: contiguous ids make target_id - first_id the exact
        // index most of the time.
        if target.localid >= first.localid {
            let offset = (target.localid - first.localid) as usize;
            if offset < len {
                let probe = self.list[offset];
                if probe == target {
                    return Ok(offset);
                } else if probe > target {
                    right = offset;
                } else {
                    left = offset + 1;
                }
            }
        }

        match self.list[left..right].binary_search(&target) {
            Ok(pos) => Ok(left + pos),
            Err(pos) => Err(left + pos),
        }
    }

    pub fn exists(&self, rankno: RankNo, localid: LocalId) -> bool {
        self.find_position(GlobalRankId::new(rankno, localid)).is_ok()
    }

    pub fn find(&self, globalid: GlobalRankId) -> Option<usize> {
        self.find_position(globalid).ok()
    }

    /// Insert keeping the sort order. Reinserting an existing id is
    /// rejected with an error value, not a panic.
    pub fn add(&mut self, globalid: GlobalRankId) -> Result<()> {
        match self.find_position(globalid) {
            Ok(_) => Err(Error::InvalidParameter(format!(
                "global id {globalid} already present"
            ))),
            Err(pos) => {
                self.list.insert(pos, globalid);
                Ok(())
            }
        }
    }

    /// Merge another list; existing entries stay untouched.
    pub fn add_all(&mut self, other: &GlobalRankIdList) {
        for gid in other.iter() {
            let _ = self.add(*gid);
        }
    }

    pub fn remove(&mut self, rankno: RankNo, localid: LocalId) -> Result<()> {
        match self.find_position(GlobalRankId::new(rankno, localid)) {
            Ok(pos) => {
                self.list.remove(pos);
                Ok(())
            }
            Err(_) => Err(Error::InvalidParameter(format!(
                "global id {}[{}] not present",
                localid, rankno
            ))),
        }
    }

    /// Drop entries with a negative rank, a zero id, or `invalid_rankno`
    /// (self references). Idempotent.
    pub fn erase_invalids(&mut self, invalid_rankno: RankNo) {
        self.list
            .retain(|gid| gid.is_valid() && gid.rankno != invalid_rankno);
    }

    /// Move an entry to a new identity. When the new identity already
    /// exists the old entry is removed instead of duplicated.
    pub fn update(&mut self, old: GlobalRankId, new: GlobalRankId) -> Result<()> {
        let Ok(pos) = self.find_position(old) else {
            return Err(Error::InvalidParameter(format!(
                "global id {old} not present for update"
            )));
        };
        if self.find_position(new).is_ok() {
            self.list.remove(pos);
            return Ok(());
        }
        self.list.remove(pos);
        let insert_at = self.find_position(new).unwrap_err();
        self.list.insert(insert_at, new);
        Ok(())
    }

    /// History append for previous-rank lists. Unconditional: duplicates
    /// are tolerated and order is arrival order.
    pub fn add_previous_rank_info(&mut self, rankno: RankNo, localid: LocalId) {
        self.list.push(GlobalRankId::new(rankno, localid));
    }

    /// Serialized byte count for buffer sizing.
    pub fn comm_size(&self) -> usize {
        8 + self.list.len() * GLOBAL_RANKID_COMM_SIZE
    }
}

impl Serializable for GlobalRankIdList {
    fn serialize(&self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        archive.write_u64(self.list.len() as u64);
        for gid in &self.list {
            gid.serialize(archive)?;
        }
        Ok(())
    }

    fn deserialize(&mut self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        self.list.clear();
        let count = archive.read_u64()? as usize;
        self.list.reserve(count);
        for _ in 0..count {
            let mut gid = GlobalRankId::invalid();
            gid.deserialize(archive)?;
            self.list.push(gid);
        }
        Ok(())
    }
}

/// (src, dest) id pair: "I, previously known as `dest`, am now `src`", or
/// "my node `src` is the peer's node `dest`" depending on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GlobalRankIdPair {
    pub src: GlobalRankId,
    pub dest: GlobalRankId,
}

impl GlobalRankIdPair {
    pub fn new(src: GlobalRankId, dest: GlobalRankId) -> Self {
        GlobalRankIdPair { src, dest }
    }

    pub fn from_parts(
        src_rankno: RankNo,
        src_localid: LocalId,
        dest_rankno: RankNo,
        dest_localid: LocalId,
    ) -> Self {
        GlobalRankIdPair {
            src: GlobalRankId::new(src_rankno, src_localid),
            dest: GlobalRankId::new(dest_rankno, dest_localid),
        }
    }

    /// True when this pair and `other` reference each other's sides.
    pub fn matches_reversed(&self, other: &GlobalRankIdPair) -> bool {
        self.src == other.dest && self.dest == other.src
    }
}

impl Serializable for GlobalRankIdPair {
    fn serialize(&self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        self.src.serialize(archive)?;
        self.dest.serialize(archive)
    }

    fn deserialize(&mut self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        self.src.deserialize(archive)?;
        self.dest.deserialize(archive)
    }
}

/// Ordered list of id pairs exchanged during migration rounds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalRankIdPairList {
    list: Vec<GlobalRankIdPair>,
}

impl GlobalRankIdPairList {
    pub fn new() -> Self {
        GlobalRankIdPairList { list: Vec::new() }
    }

    pub fn with_capacity(size: usize) -> Self {
        GlobalRankIdPairList {
            list: Vec::with_capacity(size),
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &GlobalRankIdPair> {
        self.list.iter()
    }

    pub fn get(&self, index: usize) -> Option<GlobalRankIdPair> {
        self.list.get(index).copied()
    }

    /// Sorted insert, rejecting duplicates.
    pub fn add(&mut self, pair: GlobalRankIdPair) -> Result<()> {
        match self.list.binary_search(&pair) {
            Ok(_) => Err(Error::InvalidParameter(format!(
                "pair {}->{} already present",
                pair.src, pair.dest
            ))),
            Err(pos) => {
                self.list.insert(pos, pair);
                Ok(())
            }
        }
    }

    /// Plain append, order of arrival preserved.
    pub fn push_back(&mut self, pair: GlobalRankIdPair) {
        self.list.push(pair);
    }

    pub fn exists(&self, pair: &GlobalRankIdPair) -> bool {
        self.list.binary_search(pair).is_ok()
    }

    pub fn remove(&mut self, pair: &GlobalRankIdPair) -> Result<()> {
        match self.list.binary_search(pair) {
            Ok(pos) => {
                self.list.remove(pos);
                Ok(())
            }
            Err(_) => Err(Error::InvalidParameter(format!(
                "pair {}->{} not present",
                pair.src, pair.dest
            ))),
        }
    }

    /// Exact serialized byte count, for MPI buffer sizing.
    pub fn comm_size(&self) -> usize {
        8 + self.list.len() * 2 * GLOBAL_RANKID_COMM_SIZE
    }
}

impl Serializable for GlobalRankIdPairList {
    fn serialize(&self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        archive.write_u64(self.list.len() as u64);
        for pair in &self.list {
            pair.serialize(archive)?;
        }
        Ok(())
    }

    fn deserialize(&mut self, archive: &mut SerializeArchive<'_>) -> Result<()> {
        self.list.clear();
        let count = archive.read_u64()? as usize;
        self.list.reserve(count);
        for _ in 0..count {
            let mut pair = GlobalRankIdPair::new(GlobalRankId::invalid(), GlobalRankId::invalid());
            pair.deserialize(archive)?;
            self.list.push(pair);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive;

    #[test]
    fn test_ordering_is_rank_then_id() {
        let a = GlobalRankId::new(0, 10);
        let b = GlobalRankId::new(1, 2);
        let c = GlobalRankId::new(1, 3);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_add_keeps_sorted_and_rejects_duplicates() {
        let mut list = GlobalRankIdList::new();
        for id in [5u64, 1, 3, 2, 4] {
            list.add(GlobalRankId::new(0, id)).unwrap();
        }
        assert!(list.add(GlobalRankId::new(0, 3)).is_err());
        let ids: Vec<u64> = list.iter().map(|g| g.localid).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_shortcut_probe_hits_contiguous_ids() {
        let mut list = GlobalRankIdList::new();
        for id in 1..=100u64 {
            list.add(GlobalRankId::new(2, id)).unwrap();
        }
        for id in 1..=100u64 {
            assert_eq!(list.find(GlobalRankId::new(2, id)), Some(id as usize - 1));
        }
        assert!(!list.exists(2, 101));
        assert!(!list.exists(1, 50));
    }

    #[test]
    fn test_find_on_gapped_ids() {
        let mut list = GlobalRankIdList::new();
        for id in [10u64, 20, 30, 40] {
            list.add(GlobalRankId::new(0, id)).unwrap();
        }
        assert!(list.exists(0, 30));
        assert!(!list.exists(0, 25));
    }

    #[test]
    fn test_erase_invalids_is_idempotent() {
        let mut list = GlobalRankIdList::new();
        list.add(GlobalRankId::new(0, 1)).unwrap();
        list.add(GlobalRankId::new(1, 1)).unwrap();
        list.add(GlobalRankId::new(2, 7)).unwrap();
        list.add_previous_rank_info(-1, 0);
        list.erase_invalids(1);
        assert_eq!(list.len(), 2);
        assert!(!list.exists(1, 1));
        let snapshot = list.clone();
        list.erase_invalids(1);
        assert_eq!(list, snapshot);
    }

    #[test]
    fn test_update_moves_or_collapses() {
        let mut list = GlobalRankIdList::new();
        list.add(GlobalRankId::new(0, 1)).unwrap();
        list.add(GlobalRankId::new(0, 2)).unwrap();
        list.update(GlobalRankId::new(0, 1), GlobalRankId::new(3, 9))
            .unwrap();
        assert!(list.exists(3, 9));
        assert!(!list.exists(0, 1));
        // new id already present: old entry is removed, not duplicated
        list.update(GlobalRankId::new(0, 2), GlobalRankId::new(3, 9))
            .unwrap();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_previous_rank_info_tolerates_duplicates() {
        let mut list = GlobalRankIdList::new();
        list.add_previous_rank_info(0, 4);
        list.add_previous_rank_info(0, 4);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_list_serialize_roundtrip_and_comm_size() {
        let mut list = GlobalRankIdList::new();
        list.add(GlobalRankId::new(1, 11)).unwrap();
        list.add(GlobalRankId::new(2, 22)).unwrap();
        let bytes = archive::to_bytes(&list).unwrap();
        assert_eq!(bytes.len(), list.comm_size());
        let mut back = GlobalRankIdList::new();
        archive::read_into(&mut back, &bytes).unwrap();
        assert_eq!(back, list);
    }

    #[test]
    fn test_pair_list_comm_size_matches_bytes() {
        let mut pairs = GlobalRankIdPairList::new();
        pairs.push_back(GlobalRankIdPair::from_parts(0, 1, 1, 5));
        pairs.push_back(GlobalRankIdPair::from_parts(0, 2, 1, 6));
        let bytes = archive::to_bytes(&pairs).unwrap();
        assert_eq!(bytes.len(), pairs.comm_size());
        let mut back = GlobalRankIdPairList::new();
        archive::read_into(&mut back, &bytes).unwrap();
        assert_eq!(back, pairs);
    }

    #[test]
    fn test_pair_matches_reversed() {
        let mine = GlobalRankIdPair::from_parts(0, 3, 1, 8);
        let theirs = GlobalRankIdPair::from_parts(1, 8, 0, 3);
        assert!(mine.matches_reversed(&theirs));
        assert!(!mine.matches_reversed(&mine));
    }
}
