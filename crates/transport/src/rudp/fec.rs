//! Reed-Solomon forward error correction over send units
//!
//! A unit is prefixed with its length, padded, and cut into `data_shards`
//! equal pieces; `parity_shards` recovery pieces are computed over them.
//! Any `data_shards` of the total reconstruct the unit.

use bytes::{Buf, BufMut};
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::collections::{BTreeMap, HashSet, VecDeque};
use thiserror::Error;

/// `unit_id u32 | index u8 | data_shards u8 | parity_shards u8`
pub const FEC_HEADER: usize = 7;

const LEN_PREFIX: usize = 4;
const MAX_PENDING_UNITS: usize = 256;
const COMPLETED_MEMORY: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FecError {
    #[error("Invalid shard configuration: {0}")]
    InvalidConfig(String),

    #[error("Insufficient shards: {present} present, {required} required")]
    InsufficientShards { present: usize, required: usize },

    #[error("Shard lengths differ")]
    ShardLengthMismatch,

    #[error("Malformed shard datagram")]
    Malformed,

    #[error("Reconstruction failed: {0}")]
    Reconstruction(String),
}

#[derive(Clone)]
pub struct FecCodec {
    rs: Option<ReedSolomon>,
    data_shards: usize,
    parity_shards: usize,
}

impl std::fmt::Debug for FecCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FecCodec")
            .field("data_shards", &self.data_shards)
            .field("parity_shards", &self.parity_shards)
            .finish()
    }
}

impl FecCodec {
    /// `parity_shards == 0` disables coding: every unit travels as one shard
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, FecError> {
        if parity_shards == 0 {
            return Ok(Self {
                rs: None,
                data_shards: 1,
                parity_shards: 0,
            });
        }
        if data_shards == 0 || data_shards + parity_shards > 255 {
            return Err(FecError::InvalidConfig(format!(
                "{} data + {} parity shards",
                data_shards, parity_shards
            )));
        }

        let rs = ReedSolomon::new(data_shards, parity_shards)
            .map_err(|e| FecError::InvalidConfig(format!("{:?}", e)))?;

        Ok(Self {
            rs: Some(rs),
            data_shards,
            parity_shards,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Split `unit` into `total_shards()` equally sized shards
    pub fn encode(&self, unit: &[u8]) -> Result<Vec<Vec<u8>>, FecError> {
        let mut framed = Vec::with_capacity(LEN_PREFIX + unit.len());
        framed.put_u32(unit.len() as u32);
        framed.extend_from_slice(unit);

        let Some(rs) = &self.rs else {
            return Ok(vec![framed]);
        };

        let shard_len = framed.len().div_ceil(self.data_shards);
        framed.resize(shard_len * self.data_shards, 0);

        let mut shards: Vec<Vec<u8>> = framed.chunks(shard_len).map(|c| c.to_vec()).collect();
        shards.extend((0..self.parity_shards).map(|_| vec![0u8; shard_len]));

        rs.encode(&mut shards)
            .map_err(|e| FecError::Reconstruction(format!("{:?}", e)))?;
        Ok(shards)
    }

    /// Rebuild the unit from whichever shards arrived (`None` = lost)
    pub fn decode(&self, mut shards: Vec<Option<Vec<u8>>>) -> Result<Vec<u8>, FecError> {
        if shards.len() != self.total_shards() {
            return Err(FecError::InvalidConfig(format!(
                "expected {} shards, got {}",
                self.total_shards(),
                shards.len()
            )));
        }

        let present = shards.iter().filter(|s| s.is_some()).count();
        if present < self.data_shards {
            return Err(FecError::InsufficientShards {
                present,
                required: self.data_shards,
            });
        }

        let mut lengths = shards.iter().flatten().map(|s| s.len());
        if let Some(first) = lengths.next() {
            if lengths.any(|len| len != first) {
                return Err(FecError::ShardLengthMismatch);
            }
        }

        if let Some(rs) = &self.rs {
            rs.reconstruct_data(&mut shards)
                .map_err(|e| FecError::Reconstruction(format!("{:?}", e)))?;
        }

        let mut framed = Vec::new();
        for shard in shards.into_iter().take(self.data_shards) {
            framed.extend_from_slice(&shard.ok_or_else(|| {
                FecError::Reconstruction("data shard missing after reconstruction".into())
            })?);
        }

        if framed.len() < LEN_PREFIX {
            return Err(FecError::Malformed);
        }
        let len = (&framed[..LEN_PREFIX]).get_u32() as usize;
        if LEN_PREFIX + len > framed.len() {
            return Err(FecError::Malformed);
        }

        Ok(framed[LEN_PREFIX..LEN_PREFIX + len].to_vec())
    }

    /// Encode a unit straight into wire datagrams
    pub(crate) fn datagrams(&self, unit_id: u32, unit: &[u8]) -> Result<Vec<Vec<u8>>, FecError> {
        let shards = self.encode(unit)?;
        Ok(shards
            .into_iter()
            .enumerate()
            .map(|(index, shard)| {
                let mut datagram = Vec::with_capacity(FEC_HEADER + shard.len());
                datagram.put_u32(unit_id);
                datagram.put_u8(index as u8);
                datagram.put_u8(self.data_shards as u8);
                datagram.put_u8(self.parity_shards as u8);
                datagram.extend_from_slice(&shard);
                datagram
            })
            .collect())
    }
}

/// Leading bytes of the unit carried by `datagram` when it is the unit's
/// first data shard
pub(crate) fn unit_head(datagram: &[u8]) -> Option<&[u8]> {
    if datagram.len() < FEC_HEADER + LEN_PREFIX || datagram[4] != 0 {
        return None;
    }
    Some(&datagram[FEC_HEADER + LEN_PREFIX..])
}

/// Collects shard datagrams until their unit can be rebuilt
pub(crate) struct ShardAssembler {
    codec: FecCodec,
    pending: BTreeMap<u32, Vec<Option<Vec<u8>>>>,
    completed: VecDeque<u32>,
    completed_set: HashSet<u32>,
}

impl ShardAssembler {
    pub(crate) fn new(codec: FecCodec) -> Self {
        Self {
            codec,
            pending: BTreeMap::new(),
            completed: VecDeque::new(),
            completed_set: HashSet::new(),
        }
    }

    /// Feed one datagram; returns the unit once enough shards are in
    pub(crate) fn push(&mut self, mut datagram: &[u8]) -> Result<Option<Vec<u8>>, FecError> {
        if datagram.len() < FEC_HEADER {
            return Err(FecError::Malformed);
        }
        let unit_id = datagram.get_u32();
        let index = datagram.get_u8() as usize;
        let data = datagram.get_u8() as usize;
        let parity = datagram.get_u8() as usize;

        if data != self.codec.data_shards() || parity != self.codec.parity_shards() {
            return Err(FecError::InvalidConfig(format!(
                "peer uses {}+{} shards",
                data, parity
            )));
        }
        if index >= self.codec.total_shards() {
            return Err(FecError::Malformed);
        }
        if self.completed_set.contains(&unit_id) {
            return Ok(None);
        }

        let total = self.codec.total_shards();
        let shards = self
            .pending
            .entry(unit_id)
            .or_insert_with(|| vec![None; total]);
        shards[index] = Some(datagram.to_vec());

        if shards.iter().filter(|s| s.is_some()).count() < self.codec.data_shards() {
            if self.pending.len() > MAX_PENDING_UNITS {
                self.pending.pop_first();
            }
            return Ok(None);
        }

        let shards = self.pending.remove(&unit_id).unwrap_or_default();
        self.remember(unit_id);
        self.codec.decode(shards).map(Some)
    }

    fn remember(&mut self, unit_id: u32) {
        self.completed.push_back(unit_id);
        self.completed_set.insert(unit_id);
        if self.completed.len() > COMPLETED_MEMORY {
            if let Some(old) = self.completed.pop_front() {
                self.completed_set.remove(&old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> Vec<u8> {
        (0..1000u32).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_any_two_of_six_lost_recovers() {
        let codec = FecCodec::new(4, 2).unwrap();
        let shards = codec.encode(&unit()).unwrap();
        assert_eq!(shards.len(), 6);

        for a in 0..6 {
            for b in (a + 1)..6 {
                let mut received: Vec<Option<Vec<u8>>> = shards.iter().cloned().map(Some).collect();
                received[a] = None;
                received[b] = None;
                assert_eq!(codec.decode(received).unwrap(), unit(), "lost {} and {}", a, b);
            }
        }
    }

    #[test]
    fn test_three_lost_reports_failure() {
        let codec = FecCodec::new(4, 2).unwrap();
        let mut received: Vec<Option<Vec<u8>>> =
            codec.encode(&unit()).unwrap().into_iter().map(Some).collect();
        received[0] = None;
        received[3] = None;
        received[5] = None;

        assert_eq!(
            codec.decode(received),
            Err(FecError::InsufficientShards {
                present: 3,
                required: 4
            })
        );
    }

    #[test]
    fn test_passthrough_without_parity() {
        let codec = FecCodec::new(10, 0).unwrap();
        let shards = codec.encode(b"hello").unwrap();

        assert_eq!(shards.len(), 1);
        assert_eq!(codec.decode(vec![Some(shards[0].clone())]).unwrap(), b"hello");
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(FecCodec::new(0, 3).is_err());
        assert!(FecCodec::new(200, 100).is_err());
    }

    #[test]
    fn test_assembler_completes_once() {
        let codec = FecCodec::new(3, 1).unwrap();
        let datagrams = codec.datagrams(42, b"voice packet").unwrap();
        let mut assembler = ShardAssembler::new(codec);

        assert_eq!(assembler.push(&datagrams[3]).unwrap(), None);
        assert_eq!(assembler.push(&datagrams[0]).unwrap(), None);
        assert_eq!(
            assembler.push(&datagrams[2]).unwrap(),
            Some(b"voice packet".to_vec())
        );
        // late shard of a finished unit is ignored
        assert_eq!(assembler.push(&datagrams[1]).unwrap(), None);
    }

    #[test]
    fn test_assembler_rejects_foreign_layout() {
        let sender = FecCodec::new(4, 2).unwrap();
        let mut assembler = ShardAssembler::new(FecCodec::new(10, 3).unwrap());
        let datagrams = sender.datagrams(1, b"x").unwrap();

        assert!(matches!(
            assembler.push(&datagrams[0]),
            Err(FecError::InvalidConfig(_))
        ));
        assert_eq!(assembler.push(&[1, 2]), Err(FecError::Malformed));
    }
}
