/*
 * Copyright 2013-2023, Derrick Wood
 *
 * This file is part of the Kraken 2 taxonomic sequence classification system.
 */

use std::process;
use std::time::{Duration, Instant};

use clap::{Arg, ArgAction, Command};
use log::info;

use cladecall::classify::{process_files, ClassificationStats, Options, OutputStreamData};
use cladecall::compact_hash::CompactHashTable;
use cladecall::errors::{ClassifyError, Result};
use cladecall::reports::{report_kraken_style, report_mpa_style};
use cladecall::taxonomy::Taxonomy;
use cladecall::types::{IndexOptions, TaxonCounters};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("classify: {}", err);
        process::exit(err.exit_code());
    }
}

fn run() -> Result<()> {
    let (mut opts, input_files) = parse_command_line()?;

    rayon::ThreadPoolBuilder::new()
        .num_threads(opts.num_threads)
        .build_global()
        .map_err(|e| ClassifyError::Internal(e.to_string()))?;

    info!("loading database information");
    let idx_opts = IndexOptions::load(&opts.options_filename)?;
    opts.use_translated_search = !idx_opts.dna_db;
    let taxonomy = Taxonomy::from_file(&opts.taxonomy_filename, opts.use_memory_mapping)?;
    let hash = CompactHashTable::from_file(&opts.index_filename, opts.use_memory_mapping)?;
    info!("database loaded");

    let mut stats = ClassificationStats::default();
    let mut outputs = OutputStreamData::new();
    let mut taxon_counters = TaxonCounters::new();

    let start_time = Instant::now();
    if input_files.is_empty() {
        if opts.paired_end_processing && !opts.single_file_pairs {
            return Err(ClassifyError::Config(
                "paired end processing used with no files specified".to_string(),
            ));
        }
        process_files(
            None,
            None,
            &hash,
            &taxonomy,
            &idx_opts,
            &opts,
            &mut stats,
            &mut outputs,
            &mut taxon_counters,
        )?;
    } else {
        let mut i = 0;
        while i < input_files.len() {
            if opts.paired_end_processing && !opts.single_file_pairs {
                if i + 1 == input_files.len() {
                    return Err(ClassifyError::Config(
                        "paired end processing used with unpaired file".to_string(),
                    ));
                }
                process_files(
                    Some(&input_files[i]),
                    Some(&input_files[i + 1]),
                    &hash,
                    &taxonomy,
                    &idx_opts,
                    &opts,
                    &mut stats,
                    &mut outputs,
                    &mut taxon_counters,
                )?;
                i += 2;
            } else {
                process_files(
                    Some(&input_files[i]),
                    None,
                    &hash,
                    &taxonomy,
                    &idx_opts,
                    &opts,
                    &mut stats,
                    &mut outputs,
                    &mut taxon_counters,
                )?;
                i += 1;
            }
        }
    }
    report_stats(start_time.elapsed(), &stats);

    if let Some(ref report_filename) = opts.report_filename {
        if opts.mpa_style_report {
            report_mpa_style(
                report_filename,
                opts.report_zero_counts,
                &taxonomy,
                &taxon_counters,
            )?;
        } else {
            let total_unclassified = stats.total_sequences - stats.total_classified;
            report_kraken_style(
                report_filename,
                opts.report_zero_counts,
                opts.report_kmer_data,
                &taxonomy,
                &taxon_counters,
                stats.total_sequences,
                total_unclassified,
            )?;
        }
    }

    Ok(())
}

fn report_stats(elapsed: Duration, stats: &ClassificationStats) {
    let seconds = elapsed.as_secs_f64();
    let total_unclassified = stats.total_sequences - stats.total_classified;

    if atty::is(atty::Stream::Stderr) {
        eprint!("\r");
    }
    eprintln!(
        "{} sequences ({:.2} Mbp) processed in {:.3}s ({:.1} Kseq/m, {:.2} Mbp/m).",
        stats.total_sequences,
        stats.total_bases as f64 / 1e6,
        seconds,
        stats.total_sequences as f64 / 1e3 / (seconds / 60.0),
        stats.total_bases as f64 / 1e6 / (seconds / 60.0)
    );
    eprintln!(
        "  {} sequences classified ({:.2}%)",
        stats.total_classified,
        stats.total_classified as f64 * 100.0 / stats.total_sequences as f64
    );
    eprintln!(
        "  {} sequences unclassified ({:.2}%)",
        total_unclassified,
        total_unclassified as f64 * 100.0 / stats.total_sequences as f64
    );
}

fn parse_command_line() -> Result<(Options, Vec<String>)> {
    let matches = Command::new("classify")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Taxonomic sequence classification engine")
        .arg(
            Arg::new("index_filename")
                .short('H')
                .long("index")
                .action(ArgAction::Set)
                .required(true)
                .help("Index filename"),
        )
        .arg(
            Arg::new("taxonomy_filename")
                .short('t')
                .long("taxonomy")
                .action(ArgAction::Set)
                .required(true)
                .help("Taxonomy filename"),
        )
        .arg(
            Arg::new("options_filename")
                .short('o')
                .long("options")
                .action(ArgAction::Set)
                .required(true)
                .help("Index options filename"),
        )
        .arg(
            Arg::new("quick_mode")
                .short('q')
                .long("quick")
                .action(ArgAction::SetTrue)
                .help("Quick mode: stop after the first hit group threshold"),
        )
        .arg(
            Arg::new("use_memory_mapping")
                .short('M')
                .long("memory-map")
                .action(ArgAction::SetTrue)
                .help("Use memory mapping to access hash & taxonomy"),
        )
        .arg(
            Arg::new("confidence_threshold")
                .short('T')
                .long("confidence")
                .action(ArgAction::Set)
                .help("Confidence score threshold (default 0)"),
        )
        .arg(
            Arg::new("num_threads")
                .short('p')
                .long("threads")
                .action(ArgAction::Set)
                .help("Number of threads (default 1)"),
        )
        .arg(
            Arg::new("minimum_quality_score")
                .short('Q')
                .long("min-quality")
                .action(ArgAction::Set)
                .help("Minimum quality score (FASTQ only, default 0)"),
        )
        .arg(
            Arg::new("paired_end_processing")
                .short('P')
                .long("paired")
                .action(ArgAction::SetTrue)
                .help("Process pairs of reads"),
        )
        .arg(
            Arg::new("single_file_pairs")
                .short('S')
                .long("single-file-pairs")
                .action(ArgAction::SetTrue)
                .help("Process pairs with mates in the same file"),
        )
        .arg(
            Arg::new("report_filename")
                .short('R')
                .long("report")
                .action(ArgAction::Set)
                .help("Print report to filename"),
        )
        .arg(
            Arg::new("mpa_style_report")
                .short('m')
                .long("mpa-report")
                .action(ArgAction::SetTrue)
                .help("With -R, use mpa-style report"),
        )
        .arg(
            Arg::new("report_zero_counts")
                .short('z')
                .long("report-zero")
                .action(ArgAction::SetTrue)
                .help("With -R, report taxa with zero count"),
        )
        .arg(
            Arg::new("print_scientific_name")
                .short('n')
                .long("scientific-name")
                .action(ArgAction::SetTrue)
                .help("Print scientific name instead of taxid in normal output"),
        )
        .arg(
            Arg::new("minimum_hit_groups")
                .short('g')
                .long("min-hit-groups")
                .action(ArgAction::Set)
                .help("Minimum number of hit groups needed for a call"),
        )
        .arg(
            Arg::new("classified_output_filename")
                .short('C')
                .long("classified")
                .action(ArgAction::Set)
                .help("Filename/format for classified sequence output"),
        )
        .arg(
            Arg::new("unclassified_output_filename")
                .short('U')
                .long("unclassified")
                .action(ArgAction::Set)
                .help("Filename/format for unclassified sequence output"),
        )
        .arg(
            Arg::new("kraken_output_filename")
                .short('O')
                .long("output")
                .action(ArgAction::Set)
                .help("Output file for normal output (\"-\" to suppress)"),
        )
        .arg(
            Arg::new("report_kmer_data")
                .short('K')
                .long("report-minimizer-data")
                .action(ArgAction::SetTrue)
                .help("With -R, include minimizer counts in the report"),
        )
        .arg(
            Arg::new("input_files")
                .action(ArgAction::Append)
                .num_args(0..)
                .help("FASTA/FASTQ file(s) to classify (stdin if none)"),
        )
        .get_matches();

    let mut opts = Options {
        num_threads: 1,
        ..Default::default()
    };

    let required_string = |name: &str| -> String {
        matches
            .get_one::<String>(name)
            .cloned()
            .unwrap_or_default()
    };
    opts.index_filename = required_string("index_filename");
    opts.taxonomy_filename = required_string("taxonomy_filename");
    opts.options_filename = required_string("options_filename");

    opts.quick_mode = matches.get_flag("quick_mode");
    opts.use_memory_mapping = matches.get_flag("use_memory_mapping");
    opts.paired_end_processing =
        matches.get_flag("paired_end_processing") || matches.get_flag("single_file_pairs");
    opts.single_file_pairs = matches.get_flag("single_file_pairs");
    opts.mpa_style_report = matches.get_flag("mpa_style_report");
    opts.report_zero_counts = matches.get_flag("report_zero_counts");
    opts.print_scientific_name = matches.get_flag("print_scientific_name");
    opts.report_kmer_data = matches.get_flag("report_kmer_data");

    if let Some(value) = matches.get_one::<String>("confidence_threshold") {
        opts.confidence_threshold = parse_number(value, "confidence threshold")?;
        if !(0.0..=1.0).contains(&opts.confidence_threshold) {
            return Err(ClassifyError::Config(
                "confidence threshold must be in [0, 1]".to_string(),
            ));
        }
    }
    if let Some(value) = matches.get_one::<String>("num_threads") {
        opts.num_threads = parse_number(value, "number of threads")?;
        if opts.num_threads < 1 {
            return Err(ClassifyError::Config(
                "number of threads can't be less than 1".to_string(),
            ));
        }
    }
    if let Some(value) = matches.get_one::<String>("minimum_quality_score") {
        opts.minimum_quality_score = parse_number(value, "minimum quality score")?;
    }
    if let Some(value) = matches.get_one::<String>("minimum_hit_groups") {
        opts.minimum_hit_groups = parse_number(value, "minimum hit groups")?;
    }

    opts.report_filename = matches.get_one::<String>("report_filename").cloned();
    opts.classified_output_filename = matches
        .get_one::<String>("classified_output_filename")
        .cloned();
    opts.unclassified_output_filename = matches
        .get_one::<String>("unclassified_output_filename")
        .cloned();
    opts.kraken_output_filename = matches.get_one::<String>("kraken_output_filename").cloned();

    if opts.mpa_style_report && opts.report_filename.is_none() {
        return Err(ClassifyError::Config("-m requires -R to be used".to_string()));
    }

    let input_files = matches
        .get_many::<String>("input_files")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    Ok((opts, input_files))
}

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ClassifyError::Config(format!("invalid {}: {}", what, value)))
}
