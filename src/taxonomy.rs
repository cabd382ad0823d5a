use std::collections::HashMap;
use std::fs::File;
use std::io::Read;

use memmap2::Mmap;

use crate::errors::{ClassifyError, Result};
use crate::types::TaxId;

const FILE_MAGIC: &[u8; 8] = b"K2TAXDAT";
const HEADER_LEN: usize = 32;
const NODE_LEN: usize = 56;

/// One taxon in the flattened tree. Internal ids are assigned in
/// breadth-first order at build time, so every node's parent id is smaller
/// than its own; id 0 is the "no taxon" sentinel and id 1 the root.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TaxonomyNode {
    pub parent_id: TaxId,
    pub first_child: TaxId,
    pub child_count: u64,
    pub name_offset: u64,
    pub rank_offset: u64,
    pub external_id: u64,
    pub godparent_id: u64,
}

pub struct Taxonomy {
    nodes: Vec<TaxonomyNode>,
    name_data: Vec<u8>,
    rank_data: Vec<u8>,
    external_to_internal: HashMap<u64, TaxId>,
}

impl Taxonomy {
    pub fn from_file(filename: &str, memory_mapping: bool) -> Result<Self> {
        let file = File::open(filename).map_err(|e| ClassifyError::in_file(filename, e))?;
        if memory_mapping {
            let map = unsafe { Mmap::map(&file) }
                .map_err(|e| ClassifyError::in_file(filename, e))?;
            Self::parse(&map, filename)
        } else {
            let mut buf = Vec::new();
            let mut file = file;
            file.read_to_end(&mut buf)
                .map_err(|e| ClassifyError::in_file(filename, e))?;
            Self::parse(&buf, filename)
        }
    }

    fn parse(bytes: &[u8], filename: &str) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[0..8] != FILE_MAGIC {
            return Err(ClassifyError::Data(format!(
                "attempt to load taxonomy from malformed file {}",
                filename
            )));
        }
        let read_u64 =
            |offset: usize| u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
        let node_count = read_u64(8) as usize;
        let name_data_len = read_u64(16) as usize;
        let rank_data_len = read_u64(24) as usize;

        let nodes_end = HEADER_LEN + node_count * NODE_LEN;
        let names_end = nodes_end + name_data_len;
        let ranks_end = names_end + rank_data_len;
        if bytes.len() < ranks_end {
            return Err(ClassifyError::Data(format!(
                "{}: taxonomy file truncated",
                filename
            )));
        }

        let mut nodes = Vec::with_capacity(node_count);
        for i in 0..node_count {
            let base = HEADER_LEN + i * NODE_LEN;
            let field = |n: usize| read_u64(base + n * 8);
            nodes.push(TaxonomyNode {
                parent_id: field(0),
                first_child: field(1),
                child_count: field(2),
                name_offset: field(3),
                rank_offset: field(4),
                external_id: field(5),
                godparent_id: field(6),
            });
        }

        Ok(Self::from_parts(
            nodes,
            bytes[nodes_end..names_end].to_vec(),
            bytes[names_end..ranks_end].to_vec(),
        ))
    }

    /// Assemble a taxonomy from already-decoded pieces.
    pub fn from_parts(nodes: Vec<TaxonomyNode>, name_data: Vec<u8>, rank_data: Vec<u8>) -> Self {
        let external_to_internal = nodes
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, node)| (node.external_id, i as TaxId))
            .collect();
        Taxonomy {
            nodes,
            name_data,
            rank_data,
            external_to_internal,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[TaxonomyNode] {
        &self.nodes
    }

    pub fn name_data(&self) -> &[u8] {
        &self.name_data
    }

    #[inline]
    pub fn node(&self, taxon: TaxId) -> &TaxonomyNode {
        &self.nodes[taxon as usize]
    }

    #[inline]
    pub fn parent(&self, taxon: TaxId) -> TaxId {
        self.nodes[taxon as usize].parent_id
    }

    pub fn external_id(&self, taxon: TaxId) -> u64 {
        self.nodes[taxon as usize].external_id
    }

    pub fn get_internal_id(&self, external_id: u64) -> TaxId {
        self.external_to_internal
            .get(&external_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn name(&self, taxon: TaxId) -> &str {
        cstr_at(&self.name_data, self.nodes[taxon as usize].name_offset)
    }

    pub fn rank(&self, taxon: TaxId) -> &str {
        cstr_at(&self.rank_data, self.nodes[taxon as usize].rank_offset)
    }

    /// True iff `a` lies on `b`'s chain to the root, `b` itself included.
    /// Taxon 0 is never an ancestor. Relies on parent ids preceding child
    /// ids in the internal ordering.
    pub fn is_a_ancestor_of_b(&self, a: TaxId, b: TaxId) -> bool {
        if a == 0 || b == 0 {
            return false;
        }
        let mut b = b;
        while b > a {
            b = self.nodes[b as usize].parent_id;
        }
        b == a
    }

    /// Deepest node on both ancestor chains; if either operand is 0 the
    /// other is returned.
    pub fn lowest_common_ancestor(&self, a: TaxId, b: TaxId) -> TaxId {
        if a == 0 || b == 0 {
            return if a == 0 { b } else { a };
        }
        let (mut a, mut b) = (a, b);
        while a != b {
            if a > b {
                a = self.nodes[a as usize].parent_id;
            } else {
                b = self.nodes[b as usize].parent_id;
            }
        }
        a
    }
}

fn cstr_at(data: &[u8], offset: u64) -> &str {
    let start = offset as usize;
    if start >= data.len() {
        return "";
    }
    let end = data[start..]
        .iter()
        .position(|&b| b == 0)
        .map_or(data.len(), |p| start + p);
    std::str::from_utf8(&data[start..end]).unwrap_or("")
}
