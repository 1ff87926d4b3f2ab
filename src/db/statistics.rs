//! Small sample summaries backing the statistics remarks.

/// Five-number summary of a numeric sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiveNumberSummary {
    pub minimum: u64,
    pub lower_quartile: u64,
    pub median: u64,
    pub upper_quartile: u64,
    pub maximum: u64,
}

/// Accumulates values and computes order statistics on demand.
#[derive(Default)]
pub struct Sample {
    values: Vec<u64>,
}

impl Sample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_value(&mut self, value: u64) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn five_number_summary(&mut self) -> Option<FiveNumberSummary> {
        if self.values.is_empty() {
            return None;
        }

        self.values.sort_unstable();
        let count = self.values.len();
        let at = |numerator: usize| self.values[(count - 1) * numerator / 4];

        Some(FiveNumberSummary {
            minimum: self.values[0],
            lower_quartile: at(1),
            median: at(2),
            upper_quartile: at(3),
            maximum: self.values[count - 1],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sample_has_no_summary() {
        let mut sample = Sample::new();
        assert!(sample.five_number_summary().is_none());
    }

    #[test]
    fn summary_of_a_known_sample() {
        let mut sample = Sample::new();
        for value in [9, 1, 5, 3, 7] {
            sample.add_value(value);
        }

        let summary = sample.five_number_summary().unwrap();
        assert_eq!(summary.minimum, 1);
        assert_eq!(summary.lower_quartile, 3);
        assert_eq!(summary.median, 5);
        assert_eq!(summary.upper_quartile, 7);
        assert_eq!(summary.maximum, 9);
    }

    #[test]
    fn single_value_collapses_the_summary() {
        let mut sample = Sample::new();
        sample.add_value(42);
        let summary = sample.five_number_summary().unwrap();
        assert_eq!(summary.minimum, 42);
        assert_eq!(summary.median, 42);
        assert_eq!(summary.maximum, 42);
    }
}
