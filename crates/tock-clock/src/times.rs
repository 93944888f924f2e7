/// A repeating occurrence: fires at `first_occurrence`, then every `interval`.
///
/// Both values are milliseconds on the same axis as the owning clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recurrence {
    pub first_occurrence: i64,
    pub interval: i64,
}

/// Enumerate every fire time of `recurrence` inside `[start, end)`.
///
/// Whole periods before `start` are skipped arithmetically, so a long-lived
/// interval costs nothing extra on a short window. A non-positive `interval`
/// degenerates to a single occurrence.
pub fn find_execution_times_between(recurrence: &Recurrence, start: i64, end: i64) -> Vec<i64> {
    let Recurrence {
        first_occurrence,
        interval,
    } = *recurrence;

    if first_occurrence >= end {
        return Vec::new();
    }
    if interval <= 0 {
        return if first_occurrence >= start {
            vec![first_occurrence]
        } else {
            Vec::new()
        };
    }

    let mut next = first_occurrence;
    if next < start {
        let behind = start - next;
        // ceil(behind / interval) whole periods
        let periods = (behind + interval - 1) / interval;
        next += periods * interval;
    }

    let mut times = Vec::new();
    while next < end {
        times.push(next);
        next += interval;
    }
    times
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(first_occurrence: i64, interval: i64) -> Recurrence {
        Recurrence {
            first_occurrence,
            interval,
        }
    }

    #[test]
    fn first_occurrence_after_window_is_empty() {
        assert!(find_execution_times_between(&rec(5, 10), 0, 4).is_empty());
    }

    #[test]
    fn single_hit_inside_window() {
        assert_eq!(find_execution_times_between(&rec(1, 10), 0, 10), vec![1]);
    }

    #[test]
    fn end_is_exclusive() {
        assert_eq!(
            find_execution_times_between(&rec(1, 1), 0, 10),
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9]
        );
    }

    #[test]
    fn fast_forwards_past_start() {
        assert_eq!(
            find_execution_times_between(&rec(0, 100), 250, 600),
            vec![300, 400, 500]
        );
        // exact hit on start is included
        assert_eq!(
            find_execution_times_between(&rec(0, 100), 300, 301),
            vec![300]
        );
    }

    #[test]
    fn zero_interval_is_single_shot() {
        assert_eq!(find_execution_times_between(&rec(3, 0), 0, 10), vec![3]);
        assert!(find_execution_times_between(&rec(3, 0), 4, 10).is_empty());
    }
}
