use serde::{Deserialize, Serialize};
use volume_io::Volume;

/// Voxels strictly above this probability count as positive.
pub const DECISION_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSummary {
    pub mean_probability: f64,
    pub max_probability: f64,
    pub positive_voxels: u64,
    pub total_voxels: u64,
}

pub fn summarize(volume: &Volume) -> StatisticsSummary {
    summarize_values(volume.data())
}

/// Values are not clamped or filtered; a NaN voxel makes mean and max NaN.
/// An empty slice summarizes to all zeros.
pub fn summarize_values(values: &[f64]) -> StatisticsSummary {
    if values.is_empty() {
        return StatisticsSummary {
            mean_probability: 0.0,
            max_probability: 0.0,
            positive_voxels: 0,
            total_voxels: 0,
        };
    }

    let mut mean = 0.0;
    let mut max = f64::NEG_INFINITY;
    let mut positive = 0u64;
    for (i, &value) in values.iter().enumerate() {
        // Running mean keeps a constant volume exactly equal to its value.
        mean += (value - mean) / (i + 1) as f64;
        if value.is_nan() || max.is_nan() {
            max = f64::NAN;
        } else if value > max {
            max = value;
        }
        if value > DECISION_THRESHOLD {
            positive += 1;
        }
    }

    StatisticsSummary {
        mean_probability: mean,
        max_probability: max,
        positive_voxels: positive,
        total_voxels: values.len() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volume_io::ElementType;

    #[test]
    fn constant_volume_above_threshold() {
        let volume = Volume::filled([4, 4, 4], ElementType::F64, 0.6).unwrap();
        let summary = summarize(&volume);
        assert_eq!(summary.mean_probability, 0.6);
        assert_eq!(summary.max_probability, 0.6);
        assert_eq!(summary.positive_voxels, 64);
        assert_eq!(summary.total_voxels, 64);
    }

    #[test]
    fn all_zero_volume() {
        let volume = Volume::filled([2, 5, 5], ElementType::F32, 0.0).unwrap();
        let summary = summarize(&volume);
        assert_eq!(summary.mean_probability, 0.0);
        assert_eq!(summary.max_probability, 0.0);
        assert_eq!(summary.positive_voxels, 0);
        assert_eq!(summary.total_voxels, 50);
    }

    #[test]
    fn threshold_is_strict() {
        let summary = summarize_values(&[0.5, 0.5000001, 0.2, 1.0]);
        assert_eq!(summary.positive_voxels, 2);
        assert_eq!(summary.max_probability, 1.0);
        assert!((summary.mean_probability - 0.550_000_025).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_values_are_not_clamped() {
        let summary = summarize_values(&[-1.0, 3.0]);
        assert_eq!(summary.max_probability, 3.0);
        assert_eq!(summary.mean_probability, 1.0);
        assert_eq!(summary.positive_voxels, 1);
    }

    #[test]
    fn nan_propagates() {
        let summary = summarize_values(&[0.1, f64::NAN, 0.9]);
        assert!(summary.mean_probability.is_nan());
        assert!(summary.max_probability.is_nan());
        assert_eq!(summary.positive_voxels, 1);
    }

    #[test]
    fn empty_input_summarizes_to_zero() {
        let summary = summarize_values(&[]);
        assert_eq!(summary.total_voxels, 0);
        assert_eq!(summary.mean_probability, 0.0);
    }

    #[test]
    fn serializes_with_snake_case_fields() {
        let json = serde_json::to_value(summarize_values(&[0.6])).unwrap();
        assert_eq!(json["mean_probability"], 0.6);
        assert_eq!(json["positive_voxels"], 1);
        assert_eq!(json["total_voxels"], 1);
    }
}
