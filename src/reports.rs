/*
 * Copyright 2013-2023, Derrick Wood
 *
 * This file is part of the Kraken 2 taxonomic sequence classification system.
 */

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};

use crate::errors::{ClassifyError, Result};
use crate::taxonomy::Taxonomy;
use crate::types::{ReadCounter, TaxId, TaxonCounters};

/// Roll per-taxon call counts up every ancestor chain.
pub fn get_clade_counts(
    taxonomy: &Taxonomy,
    call_counts: &HashMap<TaxId, u64>,
) -> HashMap<TaxId, u64> {
    let mut clade_counts = HashMap::new();
    for (&taxid, &count) in call_counts {
        let mut current = taxid;
        while current != 0 {
            *clade_counts.entry(current).or_insert(0) += count;
            current = taxonomy.parent(current);
        }
    }
    clade_counts
}

/// Roll full read counters (reads, kmers, distinct kmers) up every
/// ancestor chain.
pub fn get_clade_counters(taxonomy: &Taxonomy, call_counters: &TaxonCounters) -> TaxonCounters {
    let mut clade_counters = TaxonCounters::new();
    for (&taxid, counter) in call_counters {
        let mut current = taxid;
        while current != 0 {
            clade_counters.entry(current).or_default().merge(counter);
            current = taxonomy.parent(current);
        }
    }
    clade_counters
}

fn get_rank_code(rank: &str) -> Option<char> {
    match rank {
        "superkingdom" => Some('d'),
        "kingdom" => Some('k'),
        "phylum" => Some('p'),
        "class" => Some('c'),
        "order" => Some('o'),
        "family" => Some('f'),
        "genus" => Some('g'),
        "species" => Some('s'),
        _ => None,
    }
}

/// Unranked nodes inherit the nearest ranked ancestor's code with a depth
/// suffix.
fn get_kraken_rank_info(rank: &str, rank_code: char, rank_depth: i32) -> (char, i32) {
    match get_rank_code(rank) {
        Some(code) => (code, 0),
        None => (rank_code, rank_depth + 1),
    }
}

fn children_by_descending_count<F>(taxonomy: &Taxonomy, taxid: TaxId, count_of: F) -> Vec<TaxId>
where
    F: Fn(TaxId) -> u64,
{
    let node = taxonomy.node(taxid);
    let mut children: Vec<TaxId> = (node.first_child..node.first_child + node.child_count).collect();
    children.sort_by(|&a, &b| count_of(b).cmp(&count_of(a)));
    children
}

#[allow(clippy::too_many_arguments)]
fn write_kraken_style_report_line<W: Write>(
    out: &mut W,
    report_kmer_data: bool,
    total_seqs: u64,
    clade_counter: &ReadCounter,
    taxon_counter: &ReadCounter,
    rank_str: &str,
    ext_taxid: u64,
    sci_name: &str,
    depth: usize,
) -> Result<()> {
    let pct = 100.0 * clade_counter.read_count() as f64 / total_seqs as f64;
    write!(
        out,
        "{:6.2}\t{}\t{}\t",
        pct,
        clade_counter.read_count(),
        taxon_counter.read_count()
    )?;
    if report_kmer_data {
        write!(
            out,
            "{}\t{}\t",
            clade_counter.kmer_count(),
            clade_counter.distinct_kmer_count()
        )?;
    }
    write!(out, "{}\t{}\t", rank_str, ext_taxid)?;
    for _ in 0..depth {
        write!(out, "  ")?;
    }
    writeln!(out, "{}", sci_name)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn kraken_report_dfs<W: Write>(
    taxid: TaxId,
    out: &mut W,
    report_zeros: bool,
    report_kmer_data: bool,
    taxonomy: &Taxonomy,
    clade_counters: &TaxonCounters,
    call_counters: &TaxonCounters,
    total_seqs: u64,
    rank_code: char,
    rank_depth: i32,
    depth: usize,
) -> Result<()> {
    if !report_zeros
        && clade_counters
            .get(&taxid)
            .map_or(true, |c| c.read_count() == 0)
    {
        return Ok(());
    }

    let (rank_code, rank_depth) = get_kraken_rank_info(taxonomy.rank(taxid), rank_code, rank_depth);
    let rank_str = if rank_depth != 0 {
        format!("{}{}", rank_code, rank_depth)
    } else {
        rank_code.to_string()
    };

    let default_counter = ReadCounter::default();
    write_kraken_style_report_line(
        out,
        report_kmer_data,
        total_seqs,
        clade_counters.get(&taxid).unwrap_or(&default_counter),
        call_counters.get(&taxid).unwrap_or(&default_counter),
        &rank_str,
        taxonomy.external_id(taxid),
        taxonomy.name(taxid),
        depth,
    )?;

    let children = children_by_descending_count(taxonomy, taxid, |child| {
        clade_counters.get(&child).map_or(0, |c| c.read_count())
    });
    for child in children {
        kraken_report_dfs(
            child,
            out,
            report_zeros,
            report_kmer_data,
            taxonomy,
            clade_counters,
            call_counters,
            total_seqs,
            rank_code,
            rank_depth,
            depth + 1,
        )?;
    }
    Ok(())
}

/// Kraken-style taxonomy report: one line per taxon with clade and direct
/// read counts, indented by tree depth.
pub fn report_kraken_style(
    filename: &str,
    report_zeros: bool,
    report_kmer_data: bool,
    taxonomy: &Taxonomy,
    call_counters: &TaxonCounters,
    total_seqs: u64,
    total_unclassified: u64,
) -> Result<()> {
    let clade_counters = get_clade_counters(taxonomy, call_counters);
    let file = File::create(filename).map_err(|e| ClassifyError::in_file(filename, e))?;
    let mut out = BufWriter::new(file);

    if total_unclassified != 0 || report_zeros {
        let rc = ReadCounter::with_counts(total_unclassified, 0);
        write_kraken_style_report_line(
            &mut out,
            report_kmer_data,
            total_seqs,
            &rc,
            &rc,
            "U",
            0,
            "unclassified",
            0,
        )?;
    }
    kraken_report_dfs(
        1,
        &mut out,
        report_zeros,
        report_kmer_data,
        taxonomy,
        &clade_counters,
        call_counters,
        total_seqs,
        'R',
        -1,
        0,
    )?;
    out.flush()?;
    Ok(())
}

fn mpa_report_dfs<W: Write>(
    taxid: TaxId,
    out: &mut W,
    report_zeros: bool,
    taxonomy: &Taxonomy,
    clade_counts: &HashMap<TaxId, u64>,
    taxonomy_names: &mut Vec<String>,
) -> Result<()> {
    if !report_zeros && clade_counts.get(&taxid).copied().unwrap_or(0) == 0 {
        return Ok(());
    }

    let rank_code = get_rank_code(taxonomy.rank(taxid));
    if let Some(code) = rank_code {
        taxonomy_names.push(format!("{}__{}", code, taxonomy.name(taxid)));
        let taxonomy_line = taxonomy_names.join("|");
        writeln!(
            out,
            "{}\t{}",
            taxonomy_line,
            clade_counts.get(&taxid).copied().unwrap_or(0)
        )?;
    }

    let children = children_by_descending_count(taxonomy, taxid, |child| {
        clade_counts.get(&child).copied().unwrap_or(0)
    });
    for child in children {
        mpa_report_dfs(
            child,
            out,
            report_zeros,
            taxonomy,
            clade_counts,
            taxonomy_names,
        )?;
    }

    if rank_code.is_some() {
        taxonomy_names.pop();
    }
    Ok(())
}

/// MPA-style report: `rank__name|...` lineage lines with clade counts,
/// restricted to the standard ranks.
pub fn report_mpa_style(
    filename: &str,
    report_zeros: bool,
    taxonomy: &Taxonomy,
    call_counters: &TaxonCounters,
) -> Result<()> {
    let call_counts: HashMap<TaxId, u64> = call_counters
        .iter()
        .map(|(&taxid, counter)| (taxid, counter.read_count()))
        .collect();
    let clade_counts = get_clade_counts(taxonomy, &call_counts);
    let file = File::create(filename).map_err(|e| ClassifyError::in_file(filename, e))?;
    let mut out = BufWriter::new(file);
    let mut taxonomy_names = Vec::new();
    mpa_report_dfs(
        1,
        &mut out,
        report_zeros,
        taxonomy,
        &clade_counts,
        &mut taxonomy_names,
    )?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::TaxonomyNode;

    // 1 root (no rank), 2 genus (ext 561), 3 genus (ext 570) with species
    // children 4 (ext 571) and 5 (ext 573).
    fn sample_taxonomy() -> Taxonomy {
        let mut names = Vec::new();
        let mut ranks = Vec::new();
        let mut nodes = vec![TaxonomyNode::default()];
        let specs: &[(TaxId, u64, &str, &str)] = &[
            (0, 1, "root", "no rank"),
            (1, 561, "Escherichia", "genus"),
            (1, 570, "Klebsiella", "genus"),
            (3, 571, "Klebsiella oxytoca", "species"),
            (3, 573, "Klebsiella pneumoniae", "species"),
        ];
        for &(parent, external, name, rank) in specs {
            let name_offset = names.len() as u64;
            names.extend_from_slice(name.as_bytes());
            names.push(0);
            let rank_offset = ranks.len() as u64;
            ranks.extend_from_slice(rank.as_bytes());
            ranks.push(0);
            nodes.push(TaxonomyNode {
                parent_id: parent,
                external_id: external,
                name_offset,
                rank_offset,
                ..Default::default()
            });
        }
        nodes[1].first_child = 2;
        nodes[1].child_count = 2;
        nodes[3].first_child = 4;
        nodes[3].child_count = 2;
        Taxonomy::from_parts(nodes, names, ranks)
    }

    fn sample_counters() -> TaxonCounters {
        let mut counters = TaxonCounters::new();
        for (taxid, reads) in [(2u64, 4u64), (4, 3), (5, 2), (3, 1)] {
            let mut rc = ReadCounter::with_counts(reads, 0);
            rc.add_kmer(taxid * 100);
            counters.insert(taxid, rc);
        }
        counters
    }

    #[test]
    fn test_get_clade_counts() {
        let tax = sample_taxonomy();
        let call_counts: HashMap<TaxId, u64> =
            [(2u64, 4u64), (4, 3), (5, 2), (3, 1)].into_iter().collect();
        let clade_counts = get_clade_counts(&tax, &call_counts);
        assert_eq!(clade_counts.get(&1), Some(&10));
        assert_eq!(clade_counts.get(&2), Some(&4));
        assert_eq!(clade_counts.get(&3), Some(&6));
        assert_eq!(clade_counts.get(&4), Some(&3));
    }

    #[test]
    fn test_get_clade_counters() {
        let tax = sample_taxonomy();
        let clade_counters = get_clade_counters(&tax, &sample_counters());
        assert_eq!(clade_counters.get(&1).unwrap().read_count(), 10);
        assert_eq!(clade_counters.get(&3).unwrap().read_count(), 6);
        assert_eq!(clade_counters.get(&3).unwrap().kmer_count(), 3);
    }

    #[test]
    fn test_kraken_style_report() {
        let tax = sample_taxonomy();
        let path = std::env::temp_dir().join("cladecall_report_kraken.txt");
        report_kraken_style(
            path.to_str().unwrap(),
            false,
            false,
            &tax,
            &sample_counters(),
            12,
            2,
        )
        .unwrap();
        let report = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = report.lines().collect();
        assert!(lines[0].contains("unclassified"));
        assert!(lines[0].starts_with(" 16.67\t2\t2\tU\t0\t"));
        assert!(lines[1].contains("root"));
        // Klebsiella clade (6 reads) sorts before Escherichia (4).
        assert!(lines[2].contains("Klebsiella"));
        assert!(lines[2].contains("g\t570"));
        assert!(lines[3].contains("Klebsiella oxytoca"));
        assert!(report.contains("    Klebsiella oxytoca"));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_kraken_style_report_kmer_columns() {
        let tax = sample_taxonomy();
        let path = std::env::temp_dir().join("cladecall_report_kmer.txt");
        report_kraken_style(
            path.to_str().unwrap(),
            false,
            true,
            &tax,
            &sample_counters(),
            12,
            0,
        )
        .unwrap();
        let report = std::fs::read_to_string(&path).unwrap();
        let genus_line = report
            .lines()
            .find(|l| l.contains("Klebsiella\t") || l.ends_with("Klebsiella"))
            .unwrap();
        // clade kmers for internal id 3: its own plus both species.
        let fields: Vec<&str> = genus_line.split('\t').collect();
        assert_eq!(fields[3], "3");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_mpa_style_report() {
        let tax = sample_taxonomy();
        let path = std::env::temp_dir().join("cladecall_report_mpa.txt");
        report_mpa_style(path.to_str().unwrap(), false, &tax, &sample_counters()).unwrap();
        let report = std::fs::read_to_string(&path).unwrap();
        assert!(report.contains("g__Klebsiella\t6"));
        assert!(report.contains("g__Klebsiella|s__Klebsiella pneumoniae\t2"));
        assert!(report.contains("g__Escherichia\t4"));
        // Root has no rank code and contributes no line or prefix.
        assert!(!report.contains("root"));
        std::fs::remove_file(&path).unwrap();
    }
}
