/*
 * Copyright 2013-2023, Derrick Wood
 *
 * This file is part of the Kraken 2 taxonomic sequence classification system.
 */

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;

use crate::errors::{ClassifyError, Result};
use crate::readcounts::ReadCounts;

pub type TaxId = u64;
pub const TAXID_MAX: TaxId = TaxId::MAX;

pub type TaxonCounts = HashMap<TaxId, u32>;

#[cfg(feature = "exact_counting")]
pub type ReadCounter = ReadCounts<std::collections::HashSet<u64>>;

#[cfg(not(feature = "exact_counting"))]
pub type ReadCounter = ReadCounts<crate::hyperloglogplus::HyperLogLogPlusMinus>;

pub type TaxonCounters = HashMap<TaxId, ReadCounter>;

/// Scanner and index parameters recorded at index-build time. The on-disk
/// options file is an image of the original C struct; fields are read at
/// their fixed offsets, and files written before a field existed simply
/// leave it at the default.
#[derive(Debug, Default, Clone)]
pub struct IndexOptions {
    pub k: usize,
    pub l: usize,
    pub spaced_seed_mask: u64,
    pub toggle_mask: u64,
    pub dna_db: bool,
    pub minimum_acceptable_hash_value: u64,
    pub revcom_version: u32,
    pub db_version: u32,
    pub db_type: u32,
}

const MAX_OPTIONS_FILESIZE: usize = 64;

fn read_u64(buf: &[u8], offset: usize) -> Option<u64> {
    buf.get(offset..offset + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
}

impl IndexOptions {
    pub fn load(filename: &str) -> Result<Self> {
        let mut file =
            File::open(filename).map_err(|e| ClassifyError::in_file(filename, e))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| ClassifyError::in_file(filename, e))?;
        if buf.len() > MAX_OPTIONS_FILESIZE {
            return Err(ClassifyError::Data(format!(
                "{}: options file too large ({} bytes)",
                filename,
                buf.len()
            )));
        }
        Self::from_bytes(&buf)
            .ok_or_else(|| ClassifyError::Data(format!("{}: options file truncated", filename)))
            .and_then(|opts| {
                opts.validate()?;
                Ok(opts)
            })
    }

    fn from_bytes(buf: &[u8]) -> Option<Self> {
        let mut opts = IndexOptions {
            k: read_u64(buf, 0)? as usize,
            l: read_u64(buf, 8)? as usize,
            spaced_seed_mask: read_u64(buf, 16)?,
            toggle_mask: read_u64(buf, 24)?,
            dna_db: *buf.get(32)? != 0,
            ..Default::default()
        };
        // Trailing fields were added across index versions.
        if let Some(v) = read_u64(buf, 40) {
            opts.minimum_acceptable_hash_value = v;
        }
        if let Some(v) = read_u32(buf, 48) {
            opts.revcom_version = v;
        }
        if let Some(v) = read_u32(buf, 52) {
            opts.db_version = v;
        }
        if let Some(v) = read_u32(buf, 56) {
            opts.db_type = v;
        }
        Some(opts)
    }

    fn validate(&self) -> Result<()> {
        if self.l == 0 || self.l > 31 {
            return Err(ClassifyError::Data(format!(
                "minimizer length {} outside [1, 31]",
                self.l
            )));
        }
        if self.l > self.k {
            return Err(ClassifyError::Data(format!(
                "minimizer length {} exceeds k-mer length {}",
                self.l, self.k
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn options_blob(k: u64, l: u64, dna: bool, min_hash: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        buf[0..8].copy_from_slice(&k.to_le_bytes());
        buf[8..16].copy_from_slice(&l.to_le_bytes());
        buf[16..24].copy_from_slice(&0u64.to_le_bytes());
        buf[24..32].copy_from_slice(&0xe37e28c4271b5a2du64.to_le_bytes());
        buf[32] = dna as u8;
        buf[40..48].copy_from_slice(&min_hash.to_le_bytes());
        buf[48..52].copy_from_slice(&1u32.to_le_bytes());
        buf
    }

    #[test]
    fn test_options_roundtrip() {
        let path = std::env::temp_dir().join("cladecall_opts_test.k2d");
        let blob = options_blob(35, 31, true, 42);
        File::create(&path).unwrap().write_all(&blob).unwrap();
        let opts = IndexOptions::load(path.to_str().unwrap()).unwrap();
        assert_eq!(opts.k, 35);
        assert_eq!(opts.l, 31);
        assert!(opts.dna_db);
        assert_eq!(opts.minimum_acceptable_hash_value, 42);
        assert_eq!(opts.revcom_version, 1);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_options_short_file_defaults_trailing_fields() {
        // Pre-hash-filter layout ends after the dna_db flag's padding.
        let blob = &options_blob(35, 31, true, 99)[..40];
        let opts = IndexOptions::from_bytes(blob).unwrap();
        assert_eq!(opts.minimum_acceptable_hash_value, 0);
        assert_eq!(opts.revcom_version, 0);
    }

    #[test]
    fn test_options_rejects_bad_l() {
        let opts = IndexOptions::from_bytes(&options_blob(35, 32, true, 0)).unwrap();
        assert!(opts.validate().is_err());
        let opts = IndexOptions::from_bytes(&options_blob(15, 31, true, 0)).unwrap();
        assert!(opts.validate().is_err());
    }
}
