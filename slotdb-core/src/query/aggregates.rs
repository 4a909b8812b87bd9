//! Down-sampling accumulators

use crate::types::FieldType;

/// Accumulator for folding slot values into one down-sampled value
pub trait Accumulator: Send + Sync {
    /// Add the next value in time order
    fn add(&mut self, value: f64);

    /// Get the current result
    fn result(&self) -> Option<f64>;

    /// Reset the accumulator
    fn reset(&mut self);
}

/// Sum accumulator, also used for histogram buckets
#[derive(Debug, Default)]
pub struct SumAccumulator {
    sum: Option<f64>,
}

impl Accumulator for SumAccumulator {
    fn add(&mut self, value: f64) {
        self.sum = Some(self.sum.unwrap_or(0.0) + value);
    }

    fn result(&self) -> Option<f64> {
        self.sum
    }

    fn reset(&mut self) {
        self.sum = None;
    }
}

/// Min accumulator
#[derive(Debug, Default)]
pub struct MinAccumulator {
    min: Option<f64>,
}

impl Accumulator for MinAccumulator {
    fn add(&mut self, value: f64) {
        self.min = Some(match self.min {
            Some(m) => m.min(value),
            None => value,
        });
    }

    fn result(&self) -> Option<f64> {
        self.min
    }

    fn reset(&mut self) {
        self.min = None;
    }
}

/// Max accumulator
#[derive(Debug, Default)]
pub struct MaxAccumulator {
    max: Option<f64>,
}

impl Accumulator for MaxAccumulator {
    fn add(&mut self, value: f64) {
        self.max = Some(match self.max {
            Some(m) => m.max(value),
            None => value,
        });
    }

    fn result(&self) -> Option<f64> {
        self.max
    }

    fn reset(&mut self) {
        self.max = None;
    }
}

/// Keeps the first value seen
#[derive(Debug, Default)]
pub struct FirstAccumulator {
    first: Option<f64>,
}

impl Accumulator for FirstAccumulator {
    fn add(&mut self, value: f64) {
        if self.first.is_none() {
            self.first = Some(value);
        }
    }

    fn result(&self) -> Option<f64> {
        self.first
    }

    fn reset(&mut self) {
        self.first = None;
    }
}

/// Keeps the last value seen; gauges down-sample this way too
#[derive(Debug, Default)]
pub struct LastAccumulator {
    last: Option<f64>,
}

impl Accumulator for LastAccumulator {
    fn add(&mut self, value: f64) {
        self.last = Some(value);
    }

    fn result(&self) -> Option<f64> {
        self.last
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

/// Down-sampling accumulator of a field type
pub fn accumulator_for(field_type: FieldType) -> Box<dyn Accumulator> {
    match field_type {
        FieldType::Sum | FieldType::Histogram => Box::<SumAccumulator>::default(),
        FieldType::Min => Box::<MinAccumulator>::default(),
        FieldType::Max => Box::<MaxAccumulator>::default(),
        FieldType::First => Box::<FirstAccumulator>::default(),
        FieldType::Last | FieldType::Gauge => Box::<LastAccumulator>::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(field_type: FieldType, values: &[f64]) -> Option<f64> {
        let mut acc = accumulator_for(field_type);
        for v in values {
            acc.add(*v);
        }
        acc.result()
    }

    #[test]
    fn test_accumulators() {
        let values = [3.0, 1.0, 4.0, 2.0];
        assert_eq!(fold(FieldType::Sum, &values), Some(10.0));
        assert_eq!(fold(FieldType::Histogram, &values), Some(10.0));
        assert_eq!(fold(FieldType::Min, &values), Some(1.0));
        assert_eq!(fold(FieldType::Max, &values), Some(4.0));
        assert_eq!(fold(FieldType::First, &values), Some(3.0));
        assert_eq!(fold(FieldType::Last, &values), Some(2.0));
        assert_eq!(fold(FieldType::Gauge, &values), Some(2.0));
        assert_eq!(fold(FieldType::Sum, &[]), None);
    }

    #[test]
    fn test_reset() {
        let mut acc = accumulator_for(FieldType::First);
        acc.add(1.0);
        acc.reset();
        acc.add(2.0);
        assert_eq!(acc.result(), Some(2.0));
    }
}
