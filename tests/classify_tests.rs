use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use cladecall::classify::{
    process_files, ClassificationStats, Options, OutputStreamData, NUM_FRAGMENTS_PER_THREAD,
};
use cladecall::minimizer_index::MinimizerIndex;
use cladecall::mmscanner::MinimizerScanner;
use cladecall::taxonomy::{Taxonomy, TaxonomyNode};
use cladecall::types::{IndexOptions, TaxId, TaxonCounters};

struct StubIndex(HashMap<u64, TaxId>);

impl MinimizerIndex for StubIndex {
    fn get(&self, minimizer: u64) -> TaxId {
        self.0.get(&minimizer).copied().unwrap_or(0)
    }
}

// Internal ids: 1 root (ext 1), 2 Escherichia (ext 561), 3 Klebsiella
// (ext 570), 4 Klebsiella oxytoca (ext 571), 5 Klebsiella pneumoniae
// (ext 573).
fn sample_taxonomy() -> Taxonomy {
    let mut names = Vec::new();
    let mut nodes = vec![TaxonomyNode::default()];
    let specs: &[(TaxId, u64, &str)] = &[
        (0, 1, "root"),
        (1, 561, "Escherichia"),
        (1, 570, "Klebsiella"),
        (3, 571, "Klebsiella oxytoca"),
        (3, 573, "Klebsiella pneumoniae"),
    ];
    for &(parent, external, name) in specs {
        let name_offset = names.len() as u64;
        names.extend_from_slice(name.as_bytes());
        names.push(0);
        nodes.push(TaxonomyNode {
            parent_id: parent,
            external_id: external,
            name_offset,
            ..Default::default()
        });
    }
    nodes[1].first_child = 2;
    nodes[1].child_count = 2;
    nodes[3].first_child = 4;
    nodes[3].child_count = 2;
    Taxonomy::from_parts(nodes, names, Vec::new())
}

fn dna_index_options(k: usize, l: usize) -> IndexOptions {
    IndexOptions {
        k,
        l,
        spaced_seed_mask: 0,
        toggle_mask: 0,
        dna_db: true,
        minimum_acceptable_hash_value: 0,
        revcom_version: 1,
        db_version: 0,
        db_type: 0,
    }
}

fn index_reference(
    map: &mut HashMap<u64, TaxId>,
    idx_opts: &IndexOptions,
    reference: &str,
    taxon: TaxId,
) {
    let mut scanner = MinimizerScanner::new(
        idx_opts.k,
        idx_opts.l,
        idx_opts.spaced_seed_mask,
        idx_opts.dna_db,
        idx_opts.toggle_mask,
        idx_opts.revcom_version,
    );
    scanner.load_sequence(reference);
    while let Some(minimizer) = scanner.next_minimizer() {
        if !scanner.is_ambiguous() {
            map.entry(minimizer).or_insert(taxon);
        }
    }
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(name)
}

fn column(line: &str, idx: usize) -> &str {
    line.split('\t').nth(idx).unwrap()
}

#[test]
fn test_end_to_end_unpaired_fasta() {
    let taxonomy = sample_taxonomy();
    let idx_opts = dna_index_options(5, 5);
    let mut map = HashMap::new();
    index_reference(&mut map, &idx_opts, "AAAAAAAAAA", 4);
    index_reference(&mut map, &idx_opts, "CCCCCCCCCC", 2);
    let index = StubIndex(map);

    let input_path = temp_path("cladecall_e2e_in.fa");
    fs::write(
        &input_path,
        ">read1\nAAAAAAAA\n>read2\nACGTACGTACGT\n>read3\nCCCCCCCC\n",
    )
    .unwrap();
    let kraken_path = temp_path("cladecall_e2e_out.txt");
    let classified_path = temp_path("cladecall_e2e_classified.fa");
    let unclassified_path = temp_path("cladecall_e2e_unclassified.fa");

    let opts = Options {
        kraken_output_filename: Some(kraken_path.to_str().unwrap().to_string()),
        classified_output_filename: Some(classified_path.to_str().unwrap().to_string()),
        unclassified_output_filename: Some(unclassified_path.to_str().unwrap().to_string()),
        report_filename: Some("unused".to_string()),
        num_threads: 2,
        ..Default::default()
    };

    let mut stats = ClassificationStats::default();
    let mut outputs = OutputStreamData::new();
    let mut taxon_counters = TaxonCounters::new();
    process_files(
        Some(input_path.to_str().unwrap()),
        None,
        &index,
        &taxonomy,
        &idx_opts,
        &opts,
        &mut stats,
        &mut outputs,
        &mut taxon_counters,
    )
    .unwrap();

    let kraken_output = fs::read_to_string(&kraken_path).unwrap();
    let lines: Vec<&str> = kraken_output.lines().collect();
    assert_eq!(lines.len(), 3);
    // One line per fragment, in input order.
    assert_eq!(lines[0], "C\tread1\t571\t8\t571:4");
    assert_eq!(column(lines[1], 0), "U");
    assert_eq!(column(lines[1], 1), "read2");
    assert_eq!(column(lines[1], 2), "0");
    assert_eq!(lines[2], "C\tread3\t561\t8\t561:4");

    assert_eq!(stats.total_sequences, 3);
    assert_eq!(stats.total_bases, 8 + 12 + 8);
    assert_eq!(stats.total_classified, 2);

    let classified = fs::read_to_string(&classified_path).unwrap();
    assert!(classified.contains(">read1 kraken:taxid|571\nAAAAAAAA\n"));
    assert!(classified.contains(">read3 kraken:taxid|561\nCCCCCCCC\n"));
    let unclassified = fs::read_to_string(&unclassified_path).unwrap();
    assert_eq!(unclassified, ">read2\nACGTACGTACGT\n");

    // Report counters fold across workers: one read each at 4 and 2.
    assert_eq!(taxon_counters.get(&4).unwrap().read_count(), 1);
    assert_eq!(taxon_counters.get(&2).unwrap().read_count(), 1);

    for path in [&input_path, &kraken_path, &classified_path, &unclassified_path] {
        fs::remove_file(path).unwrap();
    }
}

#[test]
fn test_end_to_end_paired_two_files() {
    let taxonomy = sample_taxonomy();
    let idx_opts = dna_index_options(5, 5);
    let mut map = HashMap::new();
    index_reference(&mut map, &idx_opts, "AAAAAAAAAA", 5);
    let index = StubIndex(map);

    let input1 = temp_path("cladecall_paired_1.fa");
    let input2 = temp_path("cladecall_paired_2.fa");
    fs::write(&input1, ">frag/1\nAAAAAAAA\n>other/1\nACGTACGTACGT\n").unwrap();
    fs::write(&input2, ">frag/2\nAAAAAAAA\n>other/2\nACGTACGTACGT\n").unwrap();
    let kraken_path = temp_path("cladecall_paired_out.txt");
    let classified_pattern = temp_path("cladecall_paired_c#.fa");

    let opts = Options {
        kraken_output_filename: Some(kraken_path.to_str().unwrap().to_string()),
        classified_output_filename: Some(
            classified_pattern.to_str().unwrap().to_string(),
        ),
        paired_end_processing: true,
        num_threads: 2,
        ..Default::default()
    };

    let mut stats = ClassificationStats::default();
    let mut outputs = OutputStreamData::new();
    let mut taxon_counters = TaxonCounters::new();
    process_files(
        Some(input1.to_str().unwrap()),
        Some(input2.to_str().unwrap()),
        &index,
        &taxonomy,
        &idx_opts,
        &opts,
        &mut stats,
        &mut outputs,
        &mut taxon_counters,
    )
    .unwrap();

    let kraken_output = fs::read_to_string(&kraken_path).unwrap();
    let lines: Vec<&str> = kraken_output.lines().collect();
    assert_eq!(lines.len(), 2);
    // Pair ids trimmed, both mate hitlists joined by the mate border.
    assert_eq!(lines[0], "C\tfrag\t573\t8|8\t573:4 |:| 573:4");
    assert_eq!(lines[1], "U\tother\t0\t12|12\t0:8 |:| 0:8");
    assert_eq!(stats.total_sequences, 2);
    assert_eq!(stats.total_bases, 8 + 8 + 12 + 12);

    let classified_1 = temp_path("cladecall_paired_c_1.fa");
    let classified_2 = temp_path("cladecall_paired_c_2.fa");
    assert_eq!(
        fs::read_to_string(&classified_1).unwrap(),
        ">frag/1 kraken:taxid|573\nAAAAAAAA\n"
    );
    assert_eq!(
        fs::read_to_string(&classified_2).unwrap(),
        ">frag/2 kraken:taxid|573\nAAAAAAAA\n"
    );

    for path in [&input1, &input2, &kraken_path, &classified_1, &classified_2] {
        fs::remove_file(path).unwrap();
    }
}

#[test]
fn test_end_to_end_interleaved_pairs() {
    let taxonomy = sample_taxonomy();
    let idx_opts = dna_index_options(5, 5);
    let index = StubIndex(HashMap::new());

    let input = temp_path("cladecall_interleaved.fa");
    fs::write(
        &input,
        ">a/1\nACGTACGT\n>a/2\nACGTACGT\n>b/1\nTTGCATGC\n>b/2\nTTGCATGC\n",
    )
    .unwrap();
    let kraken_path = temp_path("cladecall_interleaved_out.txt");

    let opts = Options {
        kraken_output_filename: Some(kraken_path.to_str().unwrap().to_string()),
        paired_end_processing: true,
        single_file_pairs: true,
        ..Default::default()
    };

    let mut stats = ClassificationStats::default();
    let mut outputs = OutputStreamData::new();
    let mut taxon_counters = TaxonCounters::new();
    process_files(
        Some(input.to_str().unwrap()),
        None,
        &index,
        &taxonomy,
        &idx_opts,
        &opts,
        &mut stats,
        &mut outputs,
        &mut taxon_counters,
    )
    .unwrap();

    let kraken_output = fs::read_to_string(&kraken_path).unwrap();
    let lines: Vec<&str> = kraken_output.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(column(lines[0], 1), "a");
    assert_eq!(column(lines[1], 1), "b");
    assert_eq!(stats.total_sequences, 2);

    fs::remove_file(&input).unwrap();
    fs::remove_file(&kraken_path).unwrap();
}

#[test]
fn test_output_blocks_keep_input_order() {
    let taxonomy = sample_taxonomy();
    let idx_opts = dna_index_options(5, 5);
    let index = StubIndex(HashMap::new());

    // More fragments than one batch claims, so the reorder buffer sees
    // several blocks from competing workers.
    let n_pairs = NUM_FRAGMENTS_PER_THREAD + 7;
    let mut input1 = String::new();
    let mut input2 = String::new();
    for i in 0..n_pairs {
        input1.push_str(&format!(">frag{:05}/1\nACGTACGT\n", i));
        input2.push_str(&format!(">frag{:05}/2\nACGTACGT\n", i));
    }
    let path1 = temp_path("cladecall_order_1.fa");
    let path2 = temp_path("cladecall_order_2.fa");
    fs::write(&path1, input1).unwrap();
    fs::write(&path2, input2).unwrap();
    let kraken_path = temp_path("cladecall_order_out.txt");

    let opts = Options {
        kraken_output_filename: Some(kraken_path.to_str().unwrap().to_string()),
        paired_end_processing: true,
        num_threads: 4,
        ..Default::default()
    };

    let mut stats = ClassificationStats::default();
    let mut outputs = OutputStreamData::new();
    let mut taxon_counters = TaxonCounters::new();
    process_files(
        Some(path1.to_str().unwrap()),
        Some(path2.to_str().unwrap()),
        &index,
        &taxonomy,
        &idx_opts,
        &opts,
        &mut stats,
        &mut outputs,
        &mut taxon_counters,
    )
    .unwrap();

    let kraken_output = fs::read_to_string(&kraken_path).unwrap();
    let ids: Vec<&str> = kraken_output.lines().map(|line| column(line, 1)).collect();
    assert_eq!(ids.len(), n_pairs);
    let expected: Vec<String> = (0..n_pairs).map(|i| format!("frag{:05}", i)).collect();
    assert_eq!(ids, expected);
    assert_eq!(stats.total_sequences, n_pairs as u64);
    assert_eq!(stats.total_classified, 0);

    fs::remove_file(&path1).unwrap();
    fs::remove_file(&path2).unwrap();
    fs::remove_file(&kraken_path).unwrap();
}

#[test]
fn test_fastq_quality_masking_end_to_end() {
    let taxonomy = sample_taxonomy();
    let idx_opts = dna_index_options(5, 5);
    let mut map = HashMap::new();
    index_reference(&mut map, &idx_opts, "AAAAAAAAAA", 4);
    let index = StubIndex(map);

    // Both reads match the reference; the second has rock-bottom qualities
    // and must lose every hit to masking.
    let input = temp_path("cladecall_fastq_in.fq");
    fs::write(
        &input,
        "@good\nAAAAAAAA\n+\nIIIIIIII\n@bad\nAAAAAAAA\n+\n!!!!!!!!\n",
    )
    .unwrap();
    let kraken_path = temp_path("cladecall_fastq_out.txt");

    let opts = Options {
        kraken_output_filename: Some(kraken_path.to_str().unwrap().to_string()),
        minimum_quality_score: 20,
        ..Default::default()
    };

    let mut stats = ClassificationStats::default();
    let mut outputs = OutputStreamData::new();
    let mut taxon_counters = TaxonCounters::new();
    process_files(
        Some(input.to_str().unwrap()),
        None,
        &index,
        &taxonomy,
        &idx_opts,
        &opts,
        &mut stats,
        &mut outputs,
        &mut taxon_counters,
    )
    .unwrap();

    let kraken_output = fs::read_to_string(&kraken_path).unwrap();
    let lines: Vec<&str> = kraken_output.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(column(lines[0], 0), "C");
    assert_eq!(column(lines[1], 0), "U");
    // Masked bases show up as an ambiguous span, not misses.
    assert_eq!(column(lines[1], 4), "A:4");

    fs::remove_file(&input).unwrap();
    fs::remove_file(&kraken_path).unwrap();
}
