/// Codon table indexed by 6-bit codons in AGCT base ordering.
static TRANSLATION_MAP: &[u8; 64] =
    b"KKNNRRSSTTTTIMIIEEDDGGGGAAAAVVVVQQHHRRRRPPPPLLLL**YY*WCCSSSSLLFF";

const FWD_LOOKUP_TABLE: [u8; 256] = build_lookup_table(false);
const REV_LOOKUP_TABLE: [u8; 256] = build_lookup_table(true);

/// Forward table maps A/G/C/T to 0..3; the reverse table carries the
/// complement pre-shifted into the codon's top two bits so reverse-strand
/// codons assemble with a right shift. Everything else is ambiguous.
const fn build_lookup_table(reverse: bool) -> [u8; 256] {
    let mut table = [u8::MAX; 256];
    let bases = [b'A', b'G', b'C', b'T'];
    let mut i = 0;
    while i < 4 {
        let code = if reverse { ((3 - i) << 4) as u8 } else { i as u8 };
        table[bases[i] as usize] = code;
        table[bases[i].to_ascii_lowercase() as usize] = code;
        i += 1;
    }
    table
}

#[inline]
fn translate_codon(codon: u8, is_ambiguous: bool) -> char {
    if is_ambiguous {
        'X'
    } else {
        TRANSLATION_MAP[(codon & 0x3f) as usize] as char
    }
}

/// Translate a DNA sequence into all six reading frames: indexes 0..2 hold
/// the forward frames, 3..5 the reverse-complement frames. Codons touching
/// a non-ACGT base translate to 'X', which the protein scanner treats as
/// ambiguous.
pub fn translate_to_all_frames(dna_seq: &str, frames: &mut [String; 6]) {
    for frame in frames.iter_mut() {
        frame.clear();
    }
    if dna_seq.len() < 3 {
        return;
    }

    let mut fwd_codon: u8 = 0;
    let mut rev_codon: u8 = 0;
    let mut ambig_nt_countdown: u8 = 0;

    for (i, &nt) in dna_seq.as_bytes().iter().enumerate() {
        let frame = i % 3;
        fwd_codon = (fwd_codon << 2) & 0x3f;
        rev_codon >>= 2;
        if ambig_nt_countdown > 0 {
            ambig_nt_countdown -= 1;
        }

        let fwd_code = FWD_LOOKUP_TABLE[nt as usize];
        if fwd_code == u8::MAX {
            // This base spoils the next three codons.
            ambig_nt_countdown = 3;
        } else {
            fwd_codon |= fwd_code;
            rev_codon |= REV_LOOKUP_TABLE[nt as usize];
        }

        if i >= 2 {
            let ambiguous = ambig_nt_countdown > 0;
            frames[frame].push(translate_codon(fwd_codon, ambiguous));
            // Reverse frames are assembled left to right and flipped below.
            frames[frame + 3].push(translate_codon(rev_codon, ambiguous));
        }
    }

    for frame in frames[3..].iter_mut() {
        let flipped: String = frame.chars().rev().collect();
        *frame = flipped;
    }
}
