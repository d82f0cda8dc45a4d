/// Data layer: core types, loading, metadata and assembly.
///
/// Architecture:
/// ```text
///  instrument .txt            metadata .csv / .json / .parquet
///        │                              │   (or built by `metadata`
///        ▼                              │    from volumes + tube map)
///   ┌──────────┐                        │
///   │  loader   │  parse file → RawSpectrum
///   └──────────┘                        │
///        │                              ▼
///        ▼                        ┌──────────────┐
///   ┌──────────┐   baseline       │ MetadataTable│
///   │ assemble  │◄─────────────────┴──────────────┘
///   └──────────┘   left join on "Spectrum name"
///        │
///        ▼
///   ┌──────────┐
///   │  filter   │  drop excluded sample labels → CombinedTable
///   └──────────┘
/// ```

pub mod assemble;
pub mod filter;
pub mod loader;
pub mod metadata;
pub mod model;
