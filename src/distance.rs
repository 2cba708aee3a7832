//! Distance estimation from apparent object width.
//!
//! Uses the pinhole approximation: an object of real width `W` that appears
//! `w` pixels wide under focal length `f` is at distance `W * f / w`.
//! Units follow the width table (centimeters).

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::calibration::FocalCalibrator;
use crate::PipelineError;

/// Width assumed for categories missing from the table.
pub const DEFAULT_WIDTH_CM: f64 = 30.0;

const BUILTIN_WIDTHS_CM: &[(&str, f64)] = &[
    ("person", 60.0),
    ("car", 180.0),
    ("bottle", 8.0),
    ("laptop", 35.0),
];

/// Category to real-world width lookup with a fallback width.
///
/// Lookups never fail: unknown categories resolve to the fallback.
#[derive(Clone, Debug, PartialEq)]
pub struct KnownWidthTable {
    widths: BTreeMap<String, f64>,
    default_width: f64,
}

impl KnownWidthTable {
    /// Build a table, rejecting any width that is not positive and finite.
    pub fn new<I, S>(widths: I, default_width: f64) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut table = BTreeMap::new();
        for (category, width) in widths {
            let category = category.into();
            check_width(&category, width)?;
            table.insert(category, width);
        }
        check_width("default", default_width)?;
        Ok(Self {
            widths: table,
            default_width,
        })
    }

    /// Real width of `category`, or the fallback width.
    pub fn width_for(&self, category: &str) -> f64 {
        self.widths
            .get(category)
            .copied()
            .unwrap_or(self.default_width)
    }

    pub fn contains(&self, category: &str) -> bool {
        self.widths.contains_key(category)
    }

    pub fn default_width(&self) -> f64 {
        self.default_width
    }

    pub fn len(&self) -> usize {
        self.widths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.widths.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl Default for KnownWidthTable {
    fn default() -> Self {
        Self {
            widths: BUILTIN_WIDTHS_CM
                .iter()
                .map(|(category, width)| (category.to_string(), *width))
                .collect(),
            default_width: DEFAULT_WIDTH_CM,
        }
    }
}

fn check_width(category: &str, width: f64) -> Result<(), PipelineError> {
    if !width.is_finite() || width <= 0.0 {
        return Err(PipelineError::InvalidCalibration {
            reason: format!(
                "known width for '{}' must be positive and finite, got {}",
                category, width
            ),
        });
    }
    Ok(())
}

/// `known_width * focal_length / apparent_width_px`, rejecting degenerate boxes.
pub fn distance_cm(
    known_width: f64,
    focal_length: f64,
    apparent_width_px: f64,
) -> Result<f64, PipelineError> {
    if !apparent_width_px.is_finite() || apparent_width_px <= 0.0 {
        return Err(PipelineError::InvalidGeometry {
            apparent_width: apparent_width_px,
        });
    }
    Ok((known_width * focal_length) / apparent_width_px)
}

/// Estimates distances using a width table and the shared focal length.
#[derive(Clone, Debug)]
pub struct DistanceModel {
    table: Arc<KnownWidthTable>,
    calibrator: FocalCalibrator,
}

impl DistanceModel {
    pub fn new(table: KnownWidthTable, calibrator: FocalCalibrator) -> Self {
        Self {
            table: Arc::new(table),
            calibrator,
        }
    }

    /// Estimated distance in centimeters of an object of `category` that
    /// appears `apparent_width_px` pixels wide.
    pub fn estimate_distance(
        &self,
        apparent_width_px: f64,
        category: &str,
    ) -> Result<f64, PipelineError> {
        let known_width = self.table.width_for(category);
        let focal_length = self.calibrator.focal_length().value();
        distance_cm(known_width, focal_length, apparent_width_px)
    }

    pub fn table(&self) -> &KnownWidthTable {
        &self.table
    }

    /// Swap in a new width table. The previous table is never edited in place.
    pub fn replace_table(&mut self, table: KnownWidthTable) {
        self.table = Arc::new(table);
    }

    pub fn calibrator(&self) -> &FocalCalibrator {
        &self.calibrator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::FocalLength;

    fn model_with_focal(focal: f64) -> DistanceModel {
        let calibrator = FocalCalibrator::with_focal_length(FocalLength::new(focal).unwrap());
        DistanceModel::new(KnownWidthTable::default(), calibrator)
    }

    #[test]
    fn unknown_category_uses_default_width() {
        let model = model_with_focal(1000.0);
        let d = model.estimate_distance(100.0, "bicycle").unwrap();
        assert_eq!(d, 300.0);
    }

    #[test]
    fn known_category_uses_table_width() {
        let model = model_with_focal(1000.0);
        assert_eq!(model.estimate_distance(200.0, "person").unwrap(), 300.0);
        assert_eq!(model.estimate_distance(360.0, "car").unwrap(), 500.0);
    }

    #[test]
    fn non_positive_width_is_invalid_geometry() {
        let model = model_with_focal(1000.0);
        for w in [0.0, -0.0, -5.0, f64::NAN, f64::NEG_INFINITY] {
            let err = model.estimate_distance(w, "person").unwrap_err();
            assert_eq!(err.code(), "INVALID_GEOMETRY");
        }
    }

    #[test]
    fn distance_is_monotonic_in_each_input() {
        let widths = [1.0, 5.0, 37.5, 120.0, 640.0];
        for pair in widths.windows(2) {
            let near = distance_cm(60.0, 1000.0, pair[0]).unwrap();
            let far = distance_cm(60.0, 1000.0, pair[1]).unwrap();
            assert!(near > far, "decreasing in apparent width");

            let small = distance_cm(pair[0], 1000.0, 80.0).unwrap();
            let large = distance_cm(pair[1], 1000.0, 80.0).unwrap();
            assert!(small < large, "increasing in known width");

            let short = distance_cm(60.0, pair[0], 80.0).unwrap();
            let long = distance_cm(60.0, pair[1], 80.0).unwrap();
            assert!(short < long, "increasing in focal length");
        }
    }

    #[test]
    fn calibration_round_trip_recovers_distance() {
        let calibrator = FocalCalibrator::new();
        let table = KnownWidthTable::new([("pallet", 120.0)], DEFAULT_WIDTH_CM).unwrap();
        let model = DistanceModel::new(table, calibrator.clone());

        for (distance, width, apparent) in [(300.0, 120.0, 410.0), (57.3, 8.0, 13.9)] {
            calibrator.calibrate(distance, width, apparent).unwrap();
            let table = KnownWidthTable::new([("probe", width)], DEFAULT_WIDTH_CM).unwrap();
            let mut model = model.clone();
            model.replace_table(table);
            let d = model.estimate_distance(apparent, "probe").unwrap();
            assert!((d - distance).abs() < 1e-9);
        }
    }

    #[test]
    fn table_rejects_bad_widths() {
        assert!(KnownWidthTable::new([("cup", 0.0)], 30.0).is_err());
        assert!(KnownWidthTable::new(Vec::<(String, f64)>::new(), -1.0).is_err());
        let table = KnownWidthTable::new([("cup", 9.0)], 12.0).unwrap();
        assert_eq!(table.width_for("cup"), 9.0);
        assert_eq!(table.width_for("plate"), 12.0);
    }

    #[test]
    fn replace_table_does_not_touch_clones() {
        let original = model_with_focal(1000.0);
        let mut replaced = original.clone();
        replaced.replace_table(KnownWidthTable::new([("person", 45.0)], 30.0).unwrap());
        assert_eq!(original.table().width_for("person"), 60.0);
        assert_eq!(replaced.table().width_for("person"), 45.0);
    }
}
