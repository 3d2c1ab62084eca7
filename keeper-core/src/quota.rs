//! Per-author limit on concurrently open pull requests.

use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaVerdict {
    pub exceeded: bool,
    /// Every open pull request of the author, including the current one.
    pub open: Vec<u64>,
    /// The newest open pull request, closed when the quota is exceeded.
    pub close: Option<u64>,
}

/// Count the author's open pull requests, including `current` even if the
/// listing has not caught up with it yet. `max_allowed == 0` disables the
/// limit.
pub fn check_quota(current: u64, open_pr_numbers: &[u64], max_allowed: usize) -> QuotaVerdict {
    let open: BTreeSet<u64> = open_pr_numbers
        .iter()
        .copied()
        .chain(std::iter::once(current))
        .collect();
    let exceeded = max_allowed > 0 && open.len() > max_allowed;
    QuotaVerdict {
        exceeded,
        close: if exceeded { open.last().copied() } else { None },
        open: open.into_iter().collect(),
    }
}

impl QuotaVerdict {
    /// `#1, #2, #5`
    pub fn open_list(&self) -> String {
        self.open
            .iter()
            .map(|number| format!("#{number}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_second_pr_is_closed_at_limit_one() {
        let verdict = check_quota(12, &[4, 12], 1);
        assert!(verdict.exceeded);
        assert_eq!(verdict.close, Some(12));
        assert_eq!(verdict.open_list(), "#4, #12");
    }

    #[test]
    fn test_current_pr_is_counted_when_listing_lags() {
        let verdict = check_quota(12, &[4], 1);
        assert!(verdict.exceeded);
        assert_eq!(verdict.open, vec![4, 12]);
    }

    #[test]
    fn test_within_limit() {
        let verdict = check_quota(12, &[12], 1);
        assert!(!verdict.exceeded);
        assert_eq!(verdict.close, None);
    }

    proptest! {
        #[test]
        fn prop_zero_disables_the_limit(
            current in 1u64..1000,
            open in proptest::collection::vec(1u64..1000, 0..20),
        ) {
            prop_assert!(!check_quota(current, &open, 0).exceeded);
        }

        #[test]
        fn prop_exceeded_iff_count_above_max(
            current in 1u64..50,
            open in proptest::collection::vec(1u64..50, 0..10),
            max in 1usize..5,
        ) {
            let verdict = check_quota(current, &open, max);
            prop_assert_eq!(verdict.exceeded, verdict.open.len() > max);
            if verdict.exceeded {
                prop_assert_eq!(verdict.close, verdict.open.iter().max().copied());
            }
        }
    }
}
