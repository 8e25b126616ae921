/// Data layer: fields, packing, and file I/O.
///
/// Architecture:
/// ```text
///  .json / .csv / .parquet
///        │
///        ▼
///   ┌──────────┐
///   │  loader   │  parse file → Vec<Field>
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  Field    │  time-leading ndarray + missing mask
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  pack     │  retained points → (channels, time) matrix, weights
///   └──────────┘   FieldStack joins fields on a shared time axis
/// ```

pub mod loader;
pub mod model;
pub mod pack;
