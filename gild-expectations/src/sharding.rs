/// Half-open digest ranges splitting the 128-bit digest space into `n`
/// shards: shard `i` covers `[i * step, (i + 1) * step)` with
/// `step = floor(u128::MAX / n)`, rendered as 32-char lowercase hex so the
/// bounds compare the way the store compares digest strings. The first
/// shard is unbounded below and the last unbounded above, so together the
/// shards cover every digest exactly once.
pub(crate) fn shard_bounds(n: usize) -> Vec<(Option<String>, Option<String>)> {
    assert!(n > 0, "at least one shard is required");
    let step = u128::MAX / n as u128;
    (0..n as u128)
        .map(|i| {
            let lo = (i > 0).then(|| format!("{:032x}", step * i));
            let hi = (i < n as u128 - 1).then(|| format!("{:032x}", step * (i + 1)));
            (lo, hi)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_shard_is_unbounded() {
        assert_eq!(shard_bounds(1), vec![(None, None)]);
    }

    #[test]
    fn bounds_are_contiguous_and_well_formed() {
        for n in [2, 3, 16] {
            let bounds = shard_bounds(n);
            assert_eq!(bounds.len(), n);
            assert!(bounds[0].0.is_none());
            assert!(bounds[n - 1].1.is_none());
            for window in bounds.windows(2) {
                let hi = window[0].1.as_ref().expect("inner bound missing");
                let lo = window[1].0.as_ref().expect("inner bound missing");
                // No gap and no overlap between adjacent shards.
                assert_eq!(hi, lo);
                assert_eq!(hi.len(), 32);
                assert!(hi.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
            }
        }
    }

    #[test]
    fn every_digest_falls_into_exactly_one_shard() {
        let bounds = shard_bounds(16);
        for digest in [
            "00000000000000000000000000000000",
            "0fffffffffffffffffffffffffffffff",
            "7fffffffffffffffffffffffffffffff",
            "80000000000000000000000000000000",
            "ffffffffffffffffffffffffffffffff",
        ] {
            let matching = bounds
                .iter()
                .filter(|(lo, hi)| {
                    lo.as_deref().is_none_or(|lo| digest >= lo)
                        && hi.as_deref().is_none_or(|hi| digest < hi)
                })
                .count();
            assert_eq!(matching, 1, "digest {digest} matched {matching} shards");
        }
    }
}
