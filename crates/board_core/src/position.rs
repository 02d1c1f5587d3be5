//! Fractional positions for sibling ordering.
//!
//! Positions are floats, not indices: appending takes `max + 1`, inserting
//! between two neighbors takes their midpoint. This supports unbounded
//! insertions without renumbering siblings. Repeated insertions converging
//! on one midpoint eventually exhaust float precision; no rebalancing is
//! performed.

/// Position for an item appended after all current siblings: `max + 1`, or
/// `1` for the first item.
pub fn append_position<I>(siblings: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    siblings
        .into_iter()
        .fold(None::<f64>, |max, p| Some(max.map_or(p, |m| m.max(p))))
        .map_or(1.0, |max| max + 1.0)
}

/// Position strictly between two neighbors. A missing "before" neighbor
/// contributes `0`; a missing "after" neighbor contributes `before + 2`,
/// which makes the insert-at-end case degenerate to `before + 1`.
pub fn between_position(before: Option<f64>, after: Option<f64>) -> f64 {
    let before = before.unwrap_or(0.0);
    let after = after.unwrap_or(before + 2.0);
    (before + after) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_to_empty_is_one() {
        assert_eq!(append_position([]), 1.0);
    }

    #[test]
    fn append_is_max_plus_one() {
        assert_eq!(append_position([1.0, 5.0]), 6.0);
        assert_eq!(append_position([5.0, 1.0, 3.0]), 6.0);
    }

    #[test]
    fn between_documented_constants() {
        assert_eq!(between_position(None, Some(4.0)), 2.0);
        assert_eq!(between_position(Some(4.0), None), 6.0);
        assert_eq!(between_position(None, None), 1.0);
    }

    #[test]
    fn between_stays_strictly_inside_bounds() {
        let mut before = 1.0;
        let mut after = 2.0;
        for _ in 0..40 {
            let mid = between_position(Some(before), Some(after));
            assert!(before < mid && mid < after, "{before} < {mid} < {after}");
            // Converge on the same midpoint from alternating sides.
            if mid.to_bits() % 2 == 0 {
                before = mid;
            } else {
                after = mid;
            }
        }
    }
}
