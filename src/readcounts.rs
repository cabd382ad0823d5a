use std::cmp::Ordering;
use std::collections::HashSet;

use crate::hyperloglogplus::HyperLogLogPlusMinus;

/// Storage for the distinct-kmer side of a read counter: exact with a
/// `HashSet` (exact_counting feature) or approximate with the HLL sketch.
pub trait KmerContainer: Clone + Default {
    fn insert(&mut self, kmer: u64);
    fn distinct(&self) -> u64;
    fn merge(&mut self, other: &Self);
}

impl KmerContainer for HashSet<u64> {
    fn insert(&mut self, kmer: u64) {
        HashSet::insert(self, kmer);
    }

    fn distinct(&self) -> u64 {
        self.len() as u64
    }

    fn merge(&mut self, other: &Self) {
        self.extend(other.iter().copied());
    }
}

impl KmerContainer for HyperLogLogPlusMinus {
    fn insert(&mut self, kmer: u64) {
        HyperLogLogPlusMinus::insert(self, kmer);
    }

    fn distinct(&self) -> u64 {
        self.cardinality()
    }

    fn merge(&mut self, other: &Self) {
        HyperLogLogPlusMinus::merge(self, other);
    }
}

/// Per-taxon tally: reads called at the taxon, total minimizers hit, and
/// the distinct-minimizer container.
#[derive(Clone, Default)]
pub struct ReadCounts<T>
where
    T: KmerContainer,
{
    n_reads: u64,
    n_kmers: u64,
    kmers: T,
}

impl<T> ReadCounts<T>
where
    T: KmerContainer,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_counts(n_reads: u64, n_kmers: u64) -> Self {
        Self {
            n_reads,
            n_kmers,
            kmers: T::default(),
        }
    }

    pub fn read_count(&self) -> u64 {
        self.n_reads
    }

    pub fn increment_read_count(&mut self) {
        self.n_reads += 1;
    }

    pub fn kmer_count(&self) -> u64 {
        self.n_kmers
    }

    pub fn distinct_kmer_count(&self) -> u64 {
        self.kmers.distinct()
    }

    pub fn add_kmer(&mut self, kmer: u64) {
        self.n_kmers += 1;
        self.kmers.insert(kmer);
    }

    pub fn merge(&mut self, other: &Self) {
        self.n_reads += other.n_reads;
        self.n_kmers += other.n_kmers;
        self.kmers.merge(&other.kmers);
    }
}

impl<T> PartialEq for ReadCounts<T>
where
    T: KmerContainer,
{
    fn eq(&self, other: &Self) -> bool {
        self.n_reads == other.n_reads && self.n_kmers == other.n_kmers
    }
}

impl<T> Eq for ReadCounts<T> where T: KmerContainer {}

impl<T> PartialOrd for ReadCounts<T>
where
    T: KmerContainer,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.n_reads != other.n_reads {
            self.n_reads.partial_cmp(&other.n_reads)
        } else {
            self.n_kmers.partial_cmp(&other.n_kmers)
        }
    }
}
