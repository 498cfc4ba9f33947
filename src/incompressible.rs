use crate::codec;

/// Bytes probed from the head of a value; enough for a stable verdict.
const SAMPLE_BYTES: usize = 512;
/// Printable-ASCII share at or above which text is assumed compressible.
const ASCII_THRESHOLD: f64 = 0.85;
/// Byte entropy (bits/byte) at or above which the value is skipped.
const ENTROPY_NO: f64 = 7.50;
/// Byte entropy at or below which the value is accepted.
const ENTROPY_YES: f64 = 7.00;
/// Minimum savings a level-1 probe must show in the gray zone.
const PROBE_MIN_GAIN: f64 = 0.02;

/// Cheap predicate used by the sampling path to keep already-compressed
/// or encrypted payloads out of the training reservoir.
///
/// Decision ladder over the first 512 bytes: mostly printable ASCII is
/// accepted outright; very high byte entropy is rejected; low entropy
/// is accepted; in between, a zstd level-1 probe of the sample must
/// save at least 2%.
pub fn is_likely_incompressible(data: &[u8]) -> bool {
    if data.is_empty() {
        return true;
    }
    let probe = &data[..data.len().min(SAMPLE_BYTES)];

    let printable = probe
        .iter()
        .filter(|&&b| (0x20..0x7f).contains(&b) || b == b'\n' || b == b'\r' || b == b'\t')
        .count();
    if printable as f64 / probe.len() as f64 >= ASCII_THRESHOLD {
        return false;
    }

    let entropy = byte_entropy(probe);
    if entropy >= ENTROPY_NO {
        return true;
    }
    if entropy <= ENTROPY_YES {
        return false;
    }

    // Gray zone: let the codec itself vote.
    let mut scratch = Vec::new();
    match codec::compress_into(&mut scratch, probe, None, 1) {
        Ok(compressed) => {
            let gain = 1.0 - compressed as f64 / probe.len() as f64;
            gain < PROBE_MIN_GAIN
        }
        Err(_) => true,
    }
}

/// Shannon entropy of the byte histogram, in bits per byte.
fn byte_entropy(data: &[u8]) -> f64 {
    let mut counts = [0u32; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let n = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.log2()
        })
        .sum()
}
