//! Contiguous-event-length analysis and per-bucket exclusion filters.
//!
//! Grounded in `original_source/src/preprocess.py`'s `get_event_lengths` and
//! `get_label_filters_for_all_cutoffs`: a single forward pass assigns every
//! sample the length of the maximal contiguous `label == 1` run it belongs
//! to, and the bucket filters mask out every sample whose event length (or
//! uncertain/missing status) doesn't belong to that bucket.

use crate::types::{Bucket, LengthFilterBank, RawLabel};

/// For each index, the length of the maximal contiguous `label == 1` run
/// containing it, or `0` if the sample is not anomalous.
///
/// Single forward pass: tracks the start of the current run and, on a
/// `1 -> non-1` transition (or end of series), writes the run length back
/// over every index in the run.
pub fn event_lengths(labels: &[RawLabel]) -> Vec<u64> {
    let n = labels.len();
    let mut lengths = vec![0u64; n];
    let mut run_start: Option<usize> = None;

    for i in 0..n {
        if labels[i] == 1 {
            if run_start.is_none() {
                run_start = Some(i);
            }
        } else if let Some(start) = run_start.take() {
            let len = (i - start) as u64;
            for l in lengths.iter_mut().take(i).skip(start) {
                *l = len;
            }
        }
    }
    if let Some(start) = run_start {
        let len = (n - start) as u64;
        for l in lengths.iter_mut().take(n).skip(start) {
            *l = len;
        }
    }
    lengths
}

/// Per-bucket exclusion masks: `filters[bucket.key()][i] == true` means
/// "exclude sample `i` from this bucket's evaluation".
///
/// A sample is excluded from bucket `k` when its event length falls into
/// any *other* configured bucket, when its label is in `uncertain_codes`,
/// or (if `remove_missing`) when it is flagged `missing`. Lower bound of a
/// bucket is exclusive, upper bound inclusive (`Bucket::contains`).
pub fn filters(
    lengths: &[u64],
    labels: &[RawLabel],
    cutoffs: &[Bucket],
    uncertain_codes: &[RawLabel],
    remove_missing: bool,
    missing: &[bool],
) -> LengthFilterBank {
    let n = lengths.len();
    let uncertain: Vec<bool> = labels.iter().map(|l| uncertain_codes.contains(l)).collect();

    // partial_filter[k][i] == true iff length[i] is in bucket k's range.
    let partial: Vec<Vec<bool>> = cutoffs
        .iter()
        .map(|b| lengths.iter().map(|&l| b.contains(l)).collect::<Vec<bool>>())
        .collect();

    let mut bank = LengthFilterBank::new();
    for (k, bucket) in cutoffs.iter().enumerate() {
        let mut excluded = vec![false; n];
        for i in 0..n {
            let in_other_bucket = partial
                .iter()
                .enumerate()
                .any(|(j, p)| j != k && p[i]);
            let mut exclude = uncertain[i] || in_other_bucket;
            if remove_missing {
                exclude = exclude || missing.get(i).copied().unwrap_or(false);
            }
            excluded[i] = exclude;
        }
        bank.insert(bucket.key(), excluded);
    }
    bank
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::default_cutoffs;

    #[test]
    fn event_lengths_matches_spec_example() {
        let labels = vec![0, 1, 1, 1, 0, 0, 1, 1, 0];
        assert_eq!(event_lengths(&labels), vec![0, 3, 3, 3, 0, 0, 2, 2, 0]);
    }

    #[test]
    fn event_lengths_all_ones_is_full_length() {
        let labels = vec![1; 7];
        assert_eq!(event_lengths(&labels), vec![7; 7]);
    }

    #[test]
    fn event_lengths_all_zeros_is_all_zero() {
        let labels = vec![0; 5];
        assert_eq!(event_lengths(&labels), vec![0; 5]);
    }

    #[test]
    fn event_ending_mid_series_closes_at_n() {
        let labels = vec![0, 0, 1, 1];
        assert_eq!(event_lengths(&labels), vec![0, 0, 2, 2]);
    }

    #[test]
    fn filters_partition_spec_example() {
        let labels = vec![0, 1, 1, 1, 0, 0, 1, 1, 0];
        let lengths = event_lengths(&labels);
        let cutoffs = vec![Bucket::new(0, Some(2)), Bucket::new(2, None)];
        let missing = vec![false; labels.len()];
        let bank = filters(&lengths, &labels, &cutoffs, &[5], false, &missing);

        let short = &bank[&cutoffs[0].key()];
        let long = &bank[&cutoffs[1].key()];

        // indices {6,7} (length 2) are kept only in bucket (0,2].
        assert!(!short[6] && !short[7]);
        assert!(long[6] && long[7]);

        // indices {1,2,3} (length 3) are kept only in bucket (2, inf).
        assert!(!long[1] && !long[2] && !long[3]);
        assert!(short[1] && short[2] && short[3]);
    }

    #[test]
    fn uncertain_labels_excluded_from_every_bucket() {
        let labels = vec![5, 5, 5];
        let lengths = vec![0, 0, 0];
        let missing = vec![false; 3];
        let cutoffs = default_cutoffs();
        let bank = filters(&lengths, &labels, &cutoffs, &[5], false, &missing);
        for bucket in &cutoffs {
            assert!(bank[&bucket.key()].iter().all(|&x| x));
        }
    }

    #[test]
    fn zero_length_kept_in_every_bucket() {
        let labels = vec![0, 0, 0];
        let lengths = vec![0, 0, 0];
        let missing = vec![false; 3];
        let cutoffs = default_cutoffs();
        let bank = filters(&lengths, &labels, &cutoffs, &[5], false, &missing);
        // length 0 is in no bucket's (lo, hi] range (all lo >= 0), so it's
        // never "in some other bucket" and is kept (not excluded) in all of
        // them.
        for bucket in &cutoffs {
            assert!(bank[&bucket.key()].iter().all(|&x| !x));
        }
    }

    #[test]
    fn remove_missing_excludes_flagged_samples() {
        let labels = vec![0, 0, 0];
        let lengths = vec![1, 1, 1];
        let missing = vec![true, false, false];
        let cutoffs = vec![Bucket::new(0, Some(24))];
        let bank = filters(&lengths, &labels, &cutoffs, &[5], true, &missing);
        let mask = &bank[&cutoffs[0].key()];
        assert!(mask[0]);
        assert!(!mask[1]);
        assert!(!mask[2]);
    }
}
