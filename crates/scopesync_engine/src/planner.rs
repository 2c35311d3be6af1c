//! Slicing of change sets into bounded batch parts.
//!
//! The planner is lazy: parts are produced one at a time while the caller
//! consumes them, with a single part of lookahead so that the final part can
//! be flagged `is_last_part`. That flag, not a count, marks the end of the
//! stream.

use scopesync_protocol::{BatchPart, RowChange, TableChanges};

/// Plans batch parts with a row limit per part.
#[derive(Debug, Clone, Copy)]
pub struct BatchPlanner {
    max_rows: usize,
}

impl BatchPlanner {
    /// Creates a planner. A limit of zero is treated as one.
    #[must_use]
    pub fn new(max_rows_per_part: usize) -> Self {
        Self {
            max_rows: max_rows_per_part.max(1),
        }
    }

    /// Returns the row limit per part.
    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    /// Plans parts over a sequence of per-table change sets.
    ///
    /// Each part holds rows of exactly one table. A table larger than the
    /// limit spans consecutive parts. An empty input yields one empty last part.
    pub fn plan<I>(&self, tables: I) -> PlannedParts<I::IntoIter>
    where
        I: IntoIterator<Item = TableChanges>,
    {
        PlannedParts {
            tables: tables.into_iter(),
            current: None,
            max_rows: self.max_rows,
            next_index: 0,
            pending: None,
            done: false,
        }
    }
}

/// Lazy iterator returned by [`BatchPlanner::plan`].
pub struct PlannedParts<I> {
    tables: I,
    current: Option<(String, std::vec::IntoIter<RowChange>)>,
    max_rows: usize,
    next_index: u32,
    pending: Option<BatchPart>,
    done: bool,
}

impl<I> PlannedParts<I>
where
    I: Iterator<Item = TableChanges>,
{
    fn next_chunk(&mut self) -> Option<BatchPart> {
        loop {
            if let Some((table, rows)) = self.current.as_mut() {
                let chunk: Vec<RowChange> = rows.by_ref().take(self.max_rows).collect();
                if !chunk.is_empty() {
                    let part = BatchPart {
                        index: self.next_index,
                        is_last_part: false,
                        table: Some(table.clone()),
                        rows: chunk,
                    };
                    self.next_index += 1;
                    return Some(part);
                }
            }
            let next = self.tables.next()?;
            self.current = Some((next.table, next.rows.into_iter()));
        }
    }
}

impl<I> Iterator for PlannedParts<I>
where
    I: Iterator<Item = TableChanges>,
{
    type Item = BatchPart;

    fn next(&mut self) -> Option<BatchPart> {
        if self.done {
            return None;
        }
        let mut part = match self.pending.take().or_else(|| self.next_chunk()) {
            Some(part) => part,
            None => {
                self.done = true;
                return Some(BatchPart::empty_last(self.next_index));
            }
        };
        self.pending = self.next_chunk();
        if self.pending.is_none() {
            part.is_last_part = true;
            self.done = true;
        }
        Some(part)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn table(name: &str, rows: usize) -> TableChanges {
        TableChanges::new(
            name,
            (0..rows)
                .map(|i| RowChange::upsert(format!("{name}-{i}"), BTreeMap::new(), i as u64 + 1))
                .collect(),
        )
    }

    #[test]
    fn empty_change_set_yields_one_terminal_part() {
        let parts: Vec<BatchPart> = BatchPlanner::new(10).plan(Vec::new()).collect();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].index, 0);
        assert!(parts[0].is_last_part);
        assert!(parts[0].rows.is_empty());
        assert!(parts[0].table.is_none());
    }

    #[test]
    fn splits_large_tables_into_consecutive_parts() {
        let parts: Vec<BatchPart> = BatchPlanner::new(2).plan(vec![table("Product", 5)]).collect();
        let counts: Vec<u64> = parts.iter().map(BatchPart::row_count).collect();
        assert_eq!(counts, vec![2, 2, 1]);
        let last: Vec<bool> = parts.iter().map(|p| p.is_last_part).collect();
        assert_eq!(last, vec![false, false, true]);
    }

    #[test]
    fn never_mixes_tables_in_a_part() {
        let parts: Vec<BatchPart> = BatchPlanner::new(4)
            .plan(vec![table("A", 3), table("B", 3)])
            .collect();
        let tables: Vec<Option<&str>> = parts.iter().map(|p| p.table.as_deref()).collect();
        assert_eq!(tables, vec![Some("A"), Some("B")]);
    }

    #[test]
    fn skips_empty_tables() {
        let parts: Vec<BatchPart> = BatchPlanner::new(4)
            .plan(vec![table("A", 0), table("B", 1), table("C", 0)])
            .collect();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].table.as_deref(), Some("B"));
        assert!(parts[0].is_last_part);
    }

    #[test]
    fn zero_limit_is_treated_as_one() {
        assert_eq!(BatchPlanner::new(0).max_rows(), 1);
        assert_eq!(BatchPlanner::new(0).plan(vec![table("A", 3)]).count(), 3);
    }

    fn tables_strategy() -> impl Strategy<Value = Vec<(String, usize)>> {
        prop::collection::vec(("[A-Z][a-z]{0,6}", 0usize..40), 0..6)
    }

    proptest! {
        #[test]
        fn exactly_one_last_part_and_it_is_final(
            tables in tables_strategy(),
            max_rows in 1usize..16,
        ) {
            let input: Vec<TableChanges> =
                tables.iter().map(|(name, rows)| table(name, *rows)).collect();
            let parts: Vec<BatchPart> = BatchPlanner::new(max_rows).plan(input).collect();

            prop_assert!(!parts.is_empty());
            prop_assert_eq!(parts.iter().filter(|p| p.is_last_part).count(), 1);
            prop_assert!(parts.last().map_or(false, |p| p.is_last_part));
        }

        #[test]
        fn parts_are_bounded_numbered_and_lossless(
            tables in tables_strategy(),
            max_rows in 1usize..16,
        ) {
            let input: Vec<TableChanges> =
                tables.iter().map(|(name, rows)| table(name, *rows)).collect();
            let expected: Vec<String> = input
                .iter()
                .flat_map(|t| t.rows.iter().map(|r| r.key.clone()))
                .collect();
            let parts: Vec<BatchPart> = BatchPlanner::new(max_rows).plan(input).collect();

            for (position, part) in parts.iter().enumerate() {
                prop_assert_eq!(part.index as usize, position);
                prop_assert!(part.rows.len() <= max_rows);
            }
            let keys: Vec<String> = parts
                .iter()
                .flat_map(|p| p.rows.iter().map(|r| r.key.clone()))
                .collect();
            prop_assert_eq!(keys, expected);
        }
    }
}
