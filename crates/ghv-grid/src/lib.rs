#![forbid(unsafe_code)]

//! Curvilinear grid fields and the nearest-neighbour locator shared by the
//! reference and subject sides of the validation harness.
//!
//! Coordinates and values are stored flat in row-major order: the outer
//! index `j` walks rows (latitude), the inner index `i` walks columns
//! (longitude), and `flat = j * cols + i`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridShape {
    pub rows: usize,
    pub cols: usize,
}

impl GridShape {
    #[must_use]
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn element_count(self) -> Result<usize, GridError> {
        self.rows.checked_mul(self.cols).ok_or(GridError::Overflow)
    }
}

impl std::fmt::Display for GridShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    EmptyGrid,
    Overflow,
    RaggedRows {
        array: &'static str,
        row: usize,
        expected: usize,
        actual: usize,
    },
    ShapeMismatch {
        array: &'static str,
        expected: GridShape,
        actual: GridShape,
    },
    ElementCount {
        array: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl std::fmt::Display for GridError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyGrid => write!(f, "grid must have at least one row and one column"),
            Self::Overflow => write!(f, "grid size arithmetic overflow"),
            Self::RaggedRows {
                array,
                row,
                expected,
                actual,
            } => write!(
                f,
                "{array} row {row} has {actual} columns, expected {expected}"
            ),
            Self::ShapeMismatch {
                array,
                expected,
                actual,
            } => write!(f, "{array} shape {actual} does not match lat shape {expected}"),
            Self::ElementCount {
                array,
                expected,
                actual,
            } => write!(
                f,
                "{array} holds {actual} elements, shape requires {expected}"
            ),
        }
    }
}

impl std::error::Error for GridError {}

/// Longitude convention of a coordinate array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LonConvention {
    /// -180..+180, east positive.
    #[default]
    Signed180,
    /// 0..360.
    Unsigned360,
}

impl LonConvention {
    #[must_use]
    pub fn normalize(self, lon: f64) -> f64 {
        match self {
            Self::Signed180 => {
                if lon > 180.0 {
                    lon - 360.0
                } else if lon < -180.0 {
                    lon + 360.0
                } else {
                    lon
                }
            }
            Self::Unsigned360 => {
                if lon < 0.0 {
                    lon + 360.0
                } else if lon >= 360.0 {
                    lon - 360.0
                } else {
                    lon
                }
            }
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signed180 => "signed_180",
            Self::Unsigned360 => "unsigned_360",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub name: String,
    pub level: String,
    pub valid_time: String,
    #[serde(default)]
    pub byte_start: Option<u64>,
    #[serde(default)]
    pub byte_end: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueryPoint {
    pub lat: f64,
    pub lon: f64,
}

impl QueryPoint {
    #[must_use]
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Selected cell of a nearest-neighbour lookup. `grid_j` is the row
/// (latitude) index and `grid_i` the column (longitude) index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LookupResult {
    pub value: f64,
    pub grid_i: usize,
    pub grid_j: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    /// Moves every edge inward. Returns `None` when either axis collapses.
    #[must_use]
    pub fn shrink(self, lat_margin: f64, lon_margin: f64) -> Option<Self> {
        let shrunk = Self {
            lat_min: self.lat_min + lat_margin,
            lat_max: self.lat_max - lat_margin,
            lon_min: self.lon_min + lon_margin,
            lon_max: self.lon_max - lon_margin,
        };
        (shrunk.lat_min <= shrunk.lat_max && shrunk.lon_min <= shrunk.lon_max).then_some(shrunk)
    }

    #[must_use]
    pub fn contains(&self, point: QueryPoint) -> bool {
        (self.lat_min..=self.lat_max).contains(&point.lat)
            && (self.lon_min..=self.lon_max).contains(&point.lon)
    }
}

/// A 2-D meteorological field with matching curvilinear coordinate arrays.
///
/// The three arrays always share one shape; both constructors reject
/// anything else before a lookup can happen.
#[derive(Debug, Clone, PartialEq)]
pub struct GridField {
    shape: GridShape,
    lat: Vec<f64>,
    lon: Vec<f64>,
    value: Vec<f64>,
    lon_convention: LonConvention,
    metadata: FieldMetadata,
}

impl GridField {
    pub fn from_flat(
        shape: GridShape,
        lat: Vec<f64>,
        lon: Vec<f64>,
        value: Vec<f64>,
        metadata: FieldMetadata,
    ) -> Result<Self, GridError> {
        if shape.rows == 0 || shape.cols == 0 {
            return Err(GridError::EmptyGrid);
        }
        let expected = shape.element_count()?;
        for (array, len) in [("lat", lat.len()), ("lon", lon.len()), ("value", value.len())] {
            if len != expected {
                return Err(GridError::ElementCount {
                    array,
                    expected,
                    actual: len,
                });
            }
        }

        Ok(Self {
            shape,
            lat,
            lon,
            value,
            lon_convention: LonConvention::Signed180,
            metadata,
        })
    }

    pub fn from_rows(
        lat: &[Vec<f64>],
        lon: &[Vec<f64>],
        value: &[Vec<f64>],
        metadata: FieldMetadata,
    ) -> Result<Self, GridError> {
        let shape = rows_shape("lat", lat)?;
        for (array, rows) in [("lon", lon), ("value", value)] {
            let actual = rows_shape(array, rows)?;
            if actual != shape {
                return Err(GridError::ShapeMismatch {
                    array,
                    expected: shape,
                    actual,
                });
            }
        }

        Self::from_flat(
            shape,
            lat.concat(),
            lon.concat(),
            value.concat(),
            metadata,
        )
    }

    #[must_use]
    pub fn with_lon_convention(mut self, convention: LonConvention) -> Self {
        self.lon_convention = convention;
        self
    }

    #[must_use]
    pub fn shape(&self) -> GridShape {
        self.shape
    }

    #[must_use]
    pub fn lon_convention(&self) -> LonConvention {
        self.lon_convention
    }

    #[must_use]
    pub fn metadata(&self) -> &FieldMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn lat(&self) -> &[f64] {
        &self.lat
    }

    #[must_use]
    pub fn lon(&self) -> &[f64] {
        &self.lon
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.value
    }

    #[must_use]
    pub fn value_at(&self, grid_j: usize, grid_i: usize) -> Option<f64> {
        if grid_j >= self.shape.rows || grid_i >= self.shape.cols {
            return None;
        }
        self.value.get(grid_j * self.shape.cols + grid_i).copied()
    }

    /// Extent of the finite coordinates, or `None` if there are none.
    #[must_use]
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let mut bbox: Option<BoundingBox> = None;
        for (&lat, &lon) in self.lat.iter().zip(&self.lon) {
            if !lat.is_finite() || !lon.is_finite() {
                continue;
            }
            bbox = Some(match bbox {
                None => BoundingBox {
                    lat_min: lat,
                    lat_max: lat,
                    lon_min: lon,
                    lon_max: lon,
                },
                Some(b) => BoundingBox {
                    lat_min: b.lat_min.min(lat),
                    lat_max: b.lat_max.max(lat),
                    lon_min: b.lon_min.min(lon),
                    lon_max: b.lon_max.max(lon),
                },
            });
        }
        bbox
    }
}

fn rows_shape(array: &'static str, rows: &[Vec<f64>]) -> Result<GridShape, GridError> {
    let cols = rows.first().map_or(0, Vec::len);
    if rows.is_empty() || cols == 0 {
        return Err(GridError::EmptyGrid);
    }
    for (row, values) in rows.iter().enumerate() {
        if values.len() != cols {
            return Err(GridError::RaggedRows {
                array,
                row,
                expected: cols,
                actual: values.len(),
            });
        }
    }
    Ok(GridShape::new(rows.len(), cols))
}

/// Nearest grid cell to `point` in squared degree space.
///
/// Full O(rows * cols) scan in row-major order; the first cell reaching the
/// minimum wins, so equidistant cells resolve to the lower flat index. A NaN
/// distance counts as minimal, as `argmin` does on the reference side. The
/// query longitude is moved into the field's convention first; grid
/// longitudes are used as stored.
#[must_use]
pub fn locate(field: &GridField, point: QueryPoint) -> LookupResult {
    let query_lon = field.lon_convention.normalize(point.lon);
    let flat = argmin_row_major(&field.lat, &field.lon, point.lat, query_lon);
    let cols = field.shape.cols;
    LookupResult {
        value: field.value[flat],
        grid_i: flat % cols,
        grid_j: flat / cols,
    }
}

#[must_use]
pub fn squared_degree_distance(lat_a: f64, lon_a: f64, lat_b: f64, lon_b: f64) -> f64 {
    let dlat = lat_a - lat_b;
    let dlon = lon_a - lon_b;
    dlat * dlat + dlon * dlon
}

fn argmin_row_major(lat: &[f64], lon: &[f64], query_lat: f64, query_lon: f64) -> usize {
    let mut best_idx = 0usize;
    let mut best = f64::INFINITY;
    for (idx, (&cell_lat, &cell_lon)) in lat.iter().zip(lon).enumerate() {
        let dist2 = squared_degree_distance(cell_lat, cell_lon, query_lat, query_lon);
        if dist2.is_nan() {
            return idx;
        }
        if dist2 < best {
            best = dist2;
            best_idx = idx;
        }
    }
    best_idx
}
