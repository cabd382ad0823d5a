/*
 * Copyright 2013-2023, Derrick Wood
 *
 * This file is part of the Kraken 2 taxonomic sequence classification system.
 */

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::sync::{Mutex, MutexGuard};

use log::info;

use crate::aa_translate::translate_to_all_frames;
use crate::errors::{ClassifyError, Result};
use crate::minimizer_index::{murmur_hash3, MinimizerIndex};
use crate::mmscanner::MinimizerScanner;
use crate::seqreader::{open_sequence_file, BatchSequenceReader, Sequence, SequenceFormat};
use crate::taxonomy::Taxonomy;
use crate::types::{IndexOptions, TaxId, TaxonCounters, TaxonCounts, TAXID_MAX};

pub const NUM_FRAGMENTS_PER_THREAD: usize = 10_000;
const BLOCK_SIZE: usize = 3 * 1024 * 1024;

#[derive(Default, Clone)]
pub struct Options {
    pub index_filename: String,
    pub taxonomy_filename: String,
    pub options_filename: String,
    pub report_filename: Option<String>,
    pub classified_output_filename: Option<String>,
    pub unclassified_output_filename: Option<String>,
    pub kraken_output_filename: Option<String>,
    pub mpa_style_report: bool,
    pub report_kmer_data: bool,
    pub quick_mode: bool,
    pub report_zero_counts: bool,
    pub use_translated_search: bool,
    pub print_scientific_name: bool,
    pub confidence_threshold: f64,
    pub num_threads: usize,
    pub paired_end_processing: bool,
    pub single_file_pairs: bool,
    pub minimum_quality_score: u8,
    pub minimum_hit_groups: i64,
    pub use_memory_mapping: bool,
}

#[derive(Default, Clone)]
pub struct ClassificationStats {
    pub total_sequences: u64,
    pub total_bases: u64,
    pub total_classified: u64,
}

/// One scanner emission as recorded for the per-read hitlist. Border and
/// ambiguity markers stay symbolic until emission time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TrailEntry {
    Taxon(TaxId),
    MatePairBorder,
    ReadingFrameBorder,
    AmbiguousSpan,
}

struct OutputData {
    block_id: u64,
    kraken_str: String,
    classified_out1_str: String,
    classified_out2_str: String,
    unclassified_out1_str: String,
    unclassified_out2_str: String,
}

impl PartialEq for OutputData {
    fn eq(&self, other: &Self) -> bool {
        self.block_id == other.block_id
    }
}

impl Eq for OutputData {}

impl PartialOrd for OutputData {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OutputData {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.block_id.cmp(&other.block_id)
    }
}

type SinkWriter = BufWriter<Box<dyn Write + Send>>;

/// The five output sinks. Files are created lazily on the first written
/// block so that no empty files appear when a run dies during load.
pub struct OutputStreamData {
    initialized: bool,
    kraken_output: Option<SinkWriter>,
    classified_output1: Option<SinkWriter>,
    classified_output2: Option<SinkWriter>,
    unclassified_output1: Option<SinkWriter>,
    unclassified_output2: Option<SinkWriter>,
}

impl Default for OutputStreamData {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputStreamData {
    pub fn new() -> Self {
        let stdout: Box<dyn Write + Send> = Box::new(io::stdout());
        OutputStreamData {
            initialized: false,
            kraken_output: Some(BufWriter::new(stdout)),
            classified_output1: None,
            classified_output2: None,
            unclassified_output1: None,
            unclassified_output2: None,
        }
    }

    fn initialize(&mut self, opts: &Options) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        if let Some(ref filename) = opts.classified_output_filename {
            if opts.paired_end_processing {
                let (file1, file2) = paired_output_files(filename)?;
                self.classified_output1 = Some(create_output_file(&file1)?);
                self.classified_output2 = Some(create_output_file(&file2)?);
            } else {
                self.classified_output1 = Some(create_output_file(filename)?);
            }
        }
        if let Some(ref filename) = opts.unclassified_output_filename {
            if opts.paired_end_processing {
                let (file1, file2) = paired_output_files(filename)?;
                self.unclassified_output1 = Some(create_output_file(&file1)?);
                self.unclassified_output2 = Some(create_output_file(&file2)?);
            } else {
                self.unclassified_output1 = Some(create_output_file(filename)?);
            }
        }
        if let Some(ref filename) = opts.kraken_output_filename {
            // "-" silences the normal output stream.
            self.kraken_output = if filename == "-" {
                None
            } else {
                Some(create_output_file(filename)?)
            };
        }
        self.initialized = true;
        Ok(())
    }

    fn write_outputs(&mut self, out_data: &OutputData) -> Result<()> {
        for (sink, data) in [
            (&mut self.kraken_output, &out_data.kraken_str),
            (&mut self.classified_output1, &out_data.classified_out1_str),
            (&mut self.classified_output2, &out_data.classified_out2_str),
            (&mut self.unclassified_output1, &out_data.unclassified_out1_str),
            (&mut self.unclassified_output2, &out_data.unclassified_out2_str),
        ] {
            if let Some(writer) = sink {
                writer.write_all(data.as_bytes())?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        for sink in [
            &mut self.kraken_output,
            &mut self.classified_output1,
            &mut self.classified_output2,
            &mut self.unclassified_output1,
            &mut self.unclassified_output2,
        ] {
            if let Some(writer) = sink {
                writer.flush()?;
            }
        }
        Ok(())
    }
}

fn create_output_file(filename: &str) -> Result<SinkWriter> {
    let file = File::create(filename).map_err(|e| ClassifyError::in_file(filename, e))?;
    let sink: Box<dyn Write + Send> = Box::new(file);
    Ok(BufWriter::new(sink))
}

fn paired_output_files(filename: &str) -> Result<(String, String)> {
    let fields: Vec<&str> = filename.split('#').collect();
    if fields.len() != 2 {
        return Err(ClassifyError::Config(format!(
            "paired filename format must contain exactly one '#' character: {}",
            filename
        )));
    }
    Ok((
        format!("{}_1{}", fields[0], fields[1]),
        format!("{}_2{}", fields[0], fields[1]),
    ))
}

struct InputStreams {
    reader1: Box<dyn BufRead + Send>,
    reader2: Option<Box<dyn BufRead + Send>>,
    next_input_block_id: u64,
}

#[derive(Default)]
struct OutputQueue {
    queue: BinaryHeap<Reverse<OutputData>>,
    next_output_block_id: u64,
}

struct Aggregates<'a> {
    stats: &'a mut ClassificationStats,
    taxon_counters: &'a mut TaxonCounters,
}

/// A worker error already poisons the run; recover the guard so the other
/// workers fail on their own error paths instead of a poison panic.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Classify every fragment of one input file (or file pair), preserving
/// input order on all output streams. Workers pull batches under the input
/// mutex, classify them locally, and cooperatively drain a reorder buffer
/// keyed by block id.
#[allow(clippy::too_many_arguments)]
pub fn process_files(
    filename1: Option<&str>,
    filename2: Option<&str>,
    hash: &dyn MinimizerIndex,
    taxonomy: &Taxonomy,
    idx_opts: &IndexOptions,
    opts: &Options,
    stats: &mut ClassificationStats,
    outputs: &mut OutputStreamData,
    total_taxon_counters: &mut TaxonCounters,
) -> Result<()> {
    let reader1 = open_sequence_file(filename1)?;
    let reader2 = if opts.paired_end_processing && !opts.single_file_pairs {
        if filename1.is_some() && filename2.is_none() {
            return Err(ClassifyError::Config(
                "paired-end processing requires two input files".to_string(),
            ));
        }
        Some(open_sequence_file(filename2)?)
    } else {
        None
    };
    info!(
        "processing {}",
        filename1.unwrap_or("stdin"),
    );

    {
        let input = Mutex::new(InputStreams {
            reader1,
            reader2,
            next_input_block_id: 0,
        });
        let output_queue = Mutex::new(OutputQueue::default());
        let writer = Mutex::new(&mut *outputs);
        let aggregates = Mutex::new(Aggregates {
            stats,
            taxon_counters: total_taxon_counters,
        });

        let worker_results: Vec<Result<()>> = rayon::broadcast(|_| {
            worker_loop(
                &input,
                &output_queue,
                &writer,
                &aggregates,
                hash,
                taxonomy,
                idx_opts,
                opts,
            )
        });
        for result in worker_results {
            result?;
        }
    }

    outputs.flush()
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    input: &Mutex<InputStreams>,
    output_queue: &Mutex<OutputQueue>,
    writer: &Mutex<&mut OutputStreamData>,
    aggregates: &Mutex<Aggregates>,
    hash: &dyn MinimizerIndex,
    taxonomy: &Taxonomy,
    idx_opts: &IndexOptions,
    opts: &Options,
) -> Result<()> {
    // Thread-local scratch, reused across batches.
    let mut scanner = MinimizerScanner::new(
        idx_opts.k,
        idx_opts.l,
        idx_opts.spaced_seed_mask,
        idx_opts.dna_db,
        idx_opts.toggle_mask,
        idx_opts.revcom_version,
    );
    let mut taxa: Vec<TrailEntry> = Vec::new();
    let mut hit_counts = TaxonCounts::new();
    let mut translated_frames: [String; 6] = Default::default();
    let mut reader1 = BatchSequenceReader::new();
    let mut reader2 = BatchSequenceReader::new();
    let mut seq1 = Sequence::new();
    let mut seq2 = Sequence::new();

    loop {
        let mut thread_stats = ClassificationStats::default();
        let mut thread_taxon_counters = TaxonCounters::new();
        let mut kraken_oss = String::new();
        let mut c1_oss = String::new();
        let mut c2_oss = String::new();
        let mut u1_oss = String::new();
        let mut u2_oss = String::new();

        let (ok_read, block_id) = {
            let mut streams = lock(input);
            let ok = if !opts.paired_end_processing {
                // Unpaired data: claim a sized block.
                reader1.load_block(&mut streams.reader1, BLOCK_SIZE)?
            } else if !opts.single_file_pairs {
                // Paired data in two files: a counted batch from each.
                let ok = reader1.load_batch(&mut streams.reader1, NUM_FRAGMENTS_PER_THREAD)?;
                if ok {
                    let second = streams.reader2.as_mut().ok_or_else(|| {
                        ClassifyError::Internal("second reader missing in paired mode".to_string())
                    })?;
                    reader2.load_batch(second, NUM_FRAGMENTS_PER_THREAD)?
                } else {
                    false
                }
            } else {
                reader1.load_batch(&mut streams.reader1, NUM_FRAGMENTS_PER_THREAD * 2)?
            };
            let id = if ok {
                let id = streams.next_input_block_id;
                streams.next_input_block_id += 1;
                id
            } else {
                0
            };
            (ok, id)
        };
        if !ok_read {
            break;
        }

        while reader1.next_sequence(&mut seq1)? {
            if opts.paired_end_processing {
                let have_mate = if opts.single_file_pairs {
                    reader1.next_sequence(&mut seq2)?
                } else {
                    reader2.next_sequence(&mut seq2)?
                };
                if !have_mate {
                    break;
                }
            }
            thread_stats.total_sequences += 1;

            if opts.minimum_quality_score > 0 {
                mask_low_quality_bases(&mut seq1, opts.minimum_quality_score)?;
                if opts.paired_end_processing {
                    mask_low_quality_bases(&mut seq2, opts.minimum_quality_score)?;
                }
            }

            let mate = opts.paired_end_processing.then_some(&seq2);
            let call = classify_sequence(
                &seq1,
                mate,
                &mut kraken_oss,
                hash,
                taxonomy,
                idx_opts,
                opts,
                &mut thread_stats,
                &mut scanner,
                &mut taxa,
                &mut hit_counts,
                &mut translated_frames,
                &mut thread_taxon_counters,
            );

            if call != 0 {
                let suffix = format!(" kraken:taxid|{}", taxonomy.external_id(call));
                append_with_header_suffix(&mut c1_oss, &mut seq1, &suffix);
                if opts.paired_end_processing {
                    append_with_header_suffix(&mut c2_oss, &mut seq2, &suffix);
                }
            } else {
                let _ = write!(u1_oss, "{}", seq1);
                if opts.paired_end_processing {
                    let _ = write!(u2_oss, "{}", seq2);
                }
            }

            thread_stats.total_bases += seq1.seq.len() as u64;
            if opts.paired_end_processing {
                thread_stats.total_bases += seq2.seq.len() as u64;
            }
        }

        {
            let mut agg = lock(aggregates);
            agg.stats.total_sequences += thread_stats.total_sequences;
            agg.stats.total_bases += thread_stats.total_bases;
            agg.stats.total_classified += thread_stats.total_classified;
            if opts.report_filename.is_some() {
                for (taxon, counter) in thread_taxon_counters.drain() {
                    agg.taxon_counters.entry(taxon).or_default().merge(&counter);
                }
            }
            if atty::is(atty::Stream::Stderr) {
                eprint!(
                    "\rProcessed {} sequences ({} bp) ...",
                    agg.stats.total_sequences, agg.stats.total_bases
                );
            }
        }

        {
            let mut queue = lock(output_queue);
            queue.queue.push(Reverse(OutputData {
                block_id,
                kraken_str: kraken_oss,
                classified_out1_str: c1_oss,
                classified_out2_str: c2_oss,
                unclassified_out1_str: u1_oss,
                unclassified_out2_str: u2_oss,
            }));
        }

        // Cooperative ordered drain: pop while the head is the next block
        // due. Popping obligates this worker to write the block; the writer
        // token is taken only after the queue mutex is released.
        loop {
            let out_data = {
                let mut queue = lock(output_queue);
                let ready = queue
                    .queue
                    .peek()
                    .map_or(false, |head| head.0.block_id == queue.next_output_block_id);
                if !ready {
                    break;
                }
                queue.next_output_block_id += 1;
                match queue.queue.pop() {
                    Some(Reverse(data)) => data,
                    None => break,
                }
            };
            let mut sinks = lock(writer);
            sinks.initialize(opts)?;
            sinks.write_outputs(&out_data)?;
        }
    }

    Ok(())
}

fn append_with_header_suffix(oss: &mut String, seq: &mut Sequence, suffix: &str) {
    let original_len = seq.header.len();
    seq.header.push_str(suffix);
    let _ = write!(oss, "{}", seq);
    seq.header.truncate(original_len);
}

/// Classify one fragment (a read, or a read pair). Appends the per-read
/// output line to `koss` and returns the called taxon (0 = unclassified).
#[allow(clippy::too_many_arguments)]
pub fn classify_sequence(
    dna: &Sequence,
    dna2: Option<&Sequence>,
    koss: &mut String,
    hash: &dyn MinimizerIndex,
    taxonomy: &Taxonomy,
    idx_opts: &IndexOptions,
    opts: &Options,
    stats: &mut ClassificationStats,
    scanner: &mut MinimizerScanner,
    taxa: &mut Vec<TrailEntry>,
    hit_counts: &mut TaxonCounts,
    tx_frames: &mut [String; 6],
    curr_taxon_counts: &mut TaxonCounters,
) -> TaxId {
    let mut call: TaxId = 0;
    taxa.clear();
    hit_counts.clear();
    let frame_ct = if opts.use_translated_search { 6 } else { 1 };
    let mut minimizer_hit_groups: i64 = 0;

    'search: for mate_num in 0..2 {
        if mate_num == 1 && !opts.paired_end_processing {
            break;
        }
        let mate_seq: &str = if mate_num == 0 {
            &dna.seq
        } else {
            dna2.map_or("", |d| d.seq.as_str())
        };

        if opts.use_translated_search {
            translate_to_all_frames(mate_seq, tx_frames);
        }
        for frame_idx in 0..frame_ct {
            if opts.use_translated_search {
                scanner.load_sequence(&tx_frames[frame_idx]);
            } else {
                scanner.load_sequence(mate_seq);
            }
            let mut last_minimizer = u64::MAX;
            let mut last_taxon: TaxId = TAXID_MAX;

            while let Some(minimizer) = scanner.next_minimizer() {
                let entry = if scanner.is_ambiguous() {
                    TrailEntry::AmbiguousSpan
                } else {
                    let taxon = if minimizer != last_minimizer {
                        let skip_lookup = idx_opts.minimum_acceptable_hash_value > 0
                            && murmur_hash3(minimizer) < idx_opts.minimum_acceptable_hash_value;
                        let taxon = if skip_lookup { 0 } else { hash.get(minimizer) };
                        last_taxon = taxon;
                        last_minimizer = minimizer;
                        // Only a hit on a fresh minimizer opens a hit group.
                        if taxon != 0 {
                            minimizer_hit_groups += 1;
                            if opts.report_filename.is_some() {
                                curr_taxon_counts
                                    .entry(taxon)
                                    .or_default()
                                    .add_kmer(scanner.last_minimizer());
                            }
                        }
                        taxon
                    } else {
                        last_taxon
                    };
                    if taxon != 0 {
                        if opts.quick_mode && minimizer_hit_groups >= opts.minimum_hit_groups {
                            call = taxon;
                            break 'search;
                        }
                        *hit_counts.entry(taxon).or_insert(0) += 1;
                    }
                    TrailEntry::Taxon(taxon)
                };
                taxa.push(entry);
            }
            if opts.use_translated_search && frame_idx != 5 {
                taxa.push(TrailEntry::ReadingFrameBorder);
            }
        }
        if opts.paired_end_processing && mate_num == 0 {
            taxa.push(TrailEntry::MatePairBorder);
        }
    }

    if call == 0 {
        let mut total_minimizers = taxa.len();
        if opts.paired_end_processing {
            total_minimizers -= 1; // mate pair marker
        }
        if opts.use_translated_search {
            // Reading frame markers, by the original's accounting.
            total_minimizers -= if opts.paired_end_processing { 4 } else { 2 };
        }
        call = resolve_tree(
            hit_counts,
            taxonomy,
            total_minimizers,
            opts.confidence_threshold,
        );
        // Void a call made by too few minimizer hit groups.
        if call != 0 && minimizer_hit_groups < opts.minimum_hit_groups {
            call = 0;
        }
    }

    if call != 0 {
        stats.total_classified += 1;
        if opts.report_filename.is_some() {
            curr_taxon_counts
                .entry(call)
                .or_default()
                .increment_read_count();
        }
    }

    koss.push_str(if call != 0 { "C\t" } else { "U\t" });
    if opts.paired_end_processing {
        koss.push_str(trim_pair_info(&dna.id));
    } else {
        koss.push_str(&dna.id);
    }
    koss.push('\t');

    let ext_call = taxonomy.external_id(call);
    if opts.print_scientific_name {
        let name = if call != 0 {
            taxonomy.name(call)
        } else {
            "unclassified"
        };
        let _ = write!(koss, "{} (taxid {})", name, ext_call);
    } else {
        let _ = write!(koss, "{}", ext_call);
    }
    koss.push('\t');

    match dna2 {
        Some(dna2) if opts.paired_end_processing => {
            let _ = write!(koss, "{}|{}", dna.seq.len(), dna2.seq.len());
        }
        _ => {
            let _ = write!(koss, "{}", dna.seq.len());
        }
    }
    koss.push('\t');

    if opts.quick_mode {
        let _ = write!(koss, "{}:Q", ext_call);
    } else if taxa.is_empty() {
        koss.push_str("0:0");
    } else {
        add_hitlist_string(koss, taxa, taxonomy);
    }
    koss.push('\n');

    call
}

/// Pick the taxon call from per-taxon hit counts: phase 1 scores every
/// candidate by the hits in its root-to-leaf path (ties collapse to the
/// LCA), phase 2 climbs toward the root until the clade's accumulated
/// score meets the required confidence.
pub fn resolve_tree(
    hit_counts: &TaxonCounts,
    taxonomy: &Taxonomy,
    total_minimizers: usize,
    confidence_threshold: f64,
) -> TaxId {
    let required_score = (confidence_threshold * total_minimizers as f64).ceil() as u32;

    // Sorted candidate order keeps the LCA tie-break chain reproducible.
    let mut candidates: Vec<TaxId> = hit_counts.keys().copied().collect();
    candidates.sort_unstable();

    let mut max_taxon: TaxId = 0;
    let mut max_score: u32 = 0;
    for &taxon in &candidates {
        let mut score = 0u32;
        for (&taxon2, &count) in hit_counts.iter() {
            if taxonomy.is_a_ancestor_of_b(taxon2, taxon) {
                score += count;
            }
        }
        if score > max_score {
            max_score = score;
            max_taxon = taxon;
        } else if score == max_score {
            max_taxon = taxonomy.lowest_common_ancestor(max_taxon, taxon);
        }
    }

    // Reset the score to hits at the candidate itself, then climb until the
    // clade meets the required support, running off the root if it never
    // does.
    max_score = hit_counts.get(&max_taxon).copied().unwrap_or(0);
    while max_taxon != 0 && max_score < required_score {
        max_score = hit_counts
            .iter()
            .filter(|&(&taxon, _)| taxonomy.is_a_ancestor_of_b(max_taxon, taxon))
            .map(|(_, &count)| count)
            .sum();
        if max_score >= required_score {
            return max_taxon;
        }
        max_taxon = taxonomy.parent(max_taxon);
    }

    max_taxon
}

/// Append the run-length-encoded trail. Runs are space separated with no
/// trailing space; border markers render alone without a count.
pub fn add_hitlist_string(koss: &mut String, taxa: &[TrailEntry], taxonomy: &Taxonomy) {
    let Some(&first) = taxa.first() else {
        return;
    };
    let mut last_entry = first;
    let mut count = 1usize;
    let mut wrote_any = false;

    let emit = |koss: &mut String, entry: TrailEntry, count: usize, wrote_any: &mut bool| {
        if *wrote_any {
            koss.push(' ');
        }
        match entry {
            TrailEntry::MatePairBorder => koss.push_str("|:|"),
            TrailEntry::ReadingFrameBorder => koss.push_str("-:-"),
            TrailEntry::AmbiguousSpan => {
                let _ = write!(koss, "A:{}", count);
            }
            TrailEntry::Taxon(taxon) => {
                let _ = write!(koss, "{}:{}", taxonomy.external_id(taxon), count);
            }
        }
        *wrote_any = true;
    };

    for &entry in &taxa[1..] {
        if entry == last_entry {
            count += 1;
        } else {
            emit(koss, last_entry, count, &mut wrote_any);
            last_entry = entry;
            count = 1;
        }
    }
    emit(koss, last_entry, count, &mut wrote_any);
}

/// FASTQ quality masking: bases under the threshold become 'x', which the
/// scanner treats as ambiguous.
pub fn mask_low_quality_bases(dna: &mut Sequence, minimum_quality_score: u8) -> Result<()> {
    if dna.format != SequenceFormat::Fastq {
        return Ok(());
    }
    if dna.seq.len() != dna.quals.len() {
        return Err(ClassifyError::Data(format!(
            "{}: Sequence length ({}) != Quality string length ({})",
            dna.id,
            dna.seq.len(),
            dna.quals.len()
        )));
    }
    let mut seq = std::mem::take(&mut dna.seq).into_bytes();
    for (i, &qual) in dna.quals.as_bytes().iter().enumerate() {
        if (qual as i32) - ('!' as i32) < minimum_quality_score as i32 {
            seq[i] = b'x';
        }
    }
    dna.seq = String::from_utf8(seq)
        .map_err(|_| ClassifyError::Data(format!("{}: non-ASCII sequence data", dna.id)))?;
    Ok(())
}

/// Strip a trailing "/1" or "/2" so both mates share a fragment id.
pub fn trim_pair_info(id: &str) -> &str {
    if id.len() > 2 && (id.ends_with("/1") || id.ends_with("/2")) {
        &id[..id.len() - 2]
    } else {
        id
    }
}
