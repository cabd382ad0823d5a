/*
 * Copyright 2013-2023, Derrick Wood
 *
 * This file is part of the Kraken 2 taxonomic sequence classification system.
 */

use std::fs::File;
use std::io::Read;

use memmap2::Mmap;

use crate::errors::{ClassifyError, Result};
use crate::minimizer_index::{murmur_hash3, MinimizerIndex};
use crate::types::TaxId;

const HEADER_LEN: usize = 32;
const CELL_LEN: usize = 4;

/// Fixed-capacity, open-addressed hash table over 32-bit cells. Each cell
/// packs the top `key_bits` of the hashed key above a `value_bits`-wide
/// taxon id; a zero value marks an empty cell. The table is written by the
/// index builder and only ever probed here.
pub struct CompactHashTable {
    capacity: usize,
    size: usize,
    key_bits: usize,
    value_bits: usize,
    backing: Backing,
}

enum Backing {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Backing {
    #[inline]
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Owned(buf) => buf,
            Backing::Mapped(map) => map,
        }
    }
}

impl CompactHashTable {
    pub fn from_file(filename: &str, memory_mapping: bool) -> Result<Self> {
        let file = File::open(filename).map_err(|e| ClassifyError::in_file(filename, e))?;
        let backing = if memory_mapping {
            let map = unsafe { Mmap::map(&file) }
                .map_err(|e| ClassifyError::in_file(filename, e))?;
            Backing::Mapped(map)
        } else {
            let mut buf = Vec::new();
            let mut file = file;
            file.read_to_end(&mut buf)
                .map_err(|e| ClassifyError::in_file(filename, e))?;
            Backing::Owned(buf)
        };

        let bytes = backing.bytes();
        if bytes.len() < HEADER_LEN {
            return Err(ClassifyError::Data(format!(
                "{}: hash table file truncated",
                filename
            )));
        }
        let read_u64 =
            |offset: usize| u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
        let capacity = read_u64(0) as usize;
        let size = read_u64(8) as usize;
        let key_bits = read_u64(16) as usize;
        let value_bits = read_u64(24) as usize;

        if key_bits == 0 || value_bits == 0 || key_bits + value_bits != 32 {
            return Err(ClassifyError::Data(format!(
                "{}: key bits ({}) and value bits ({}) must be nonzero and sum to 32",
                filename, key_bits, value_bits
            )));
        }
        if bytes.len() - HEADER_LEN != CELL_LEN * capacity {
            return Err(ClassifyError::Data(format!(
                "capacity mismatch in {}, aborting",
                filename
            )));
        }

        Ok(CompactHashTable {
            capacity,
            size,
            key_bits,
            value_bits,
            backing,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn key_bits(&self) -> usize {
        self.key_bits
    }

    pub fn value_bits(&self) -> usize {
        self.value_bits
    }

    pub fn occupancy(&self) -> f64 {
        self.size as f64 / self.capacity as f64
    }

    #[inline]
    fn cell(&self, idx: usize) -> u32 {
        let offset = HEADER_LEN + idx * CELL_LEN;
        u32::from_le_bytes(
            self.backing.bytes()[offset..offset + CELL_LEN]
                .try_into()
                .unwrap(),
        )
    }

    #[inline]
    fn cell_value(&self, data: u32) -> u32 {
        data & ((1 << self.value_bits) - 1)
    }
}

impl MinimizerIndex for CompactHashTable {
    fn get(&self, key: u64) -> TaxId {
        let hc = murmur_hash3(key);
        let compacted_key = (hc >> (32 + self.value_bits)) as u32;
        let first_idx = (hc % self.capacity as u64) as usize;
        let mut idx = first_idx;
        loop {
            let data = self.cell(idx);
            let value = self.cell_value(data);
            if value == 0 {
                break;
            }
            if data >> self.value_bits == compacted_key {
                return value as TaxId;
            }
            // Linear probing.
            idx = (idx + 1) % self.capacity;
            if idx == first_idx {
                break;
            }
        }
        0
    }
}
