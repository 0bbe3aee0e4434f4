use crate::reading::{Quantity, Reading};

/// Averages readings field by field.
///
/// Each field is the arithmetic mean over the readings where it is present,
/// so readings that differ in which fields were decoded can be combined. A
/// field absent in every input stays absent; an empty input gives an empty
/// reading.
pub fn average(readings: &[Reading]) -> Reading {
    let mut result = Reading::empty();
    for quantity in Quantity::ALL {
        result.set(quantity, mean(readings.iter().filter_map(|r| r.get(quantity))));
    }
    result
}

/// Sums in ascending order so every permutation of the input gives the same bits
fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut values: Vec<f64> = values.collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let sum: f64 = values.iter().sum();
    Some(sum / values.len() as f64)
}
