//! # hfa-rs - HFA (ERDAS IMAGINE) raster containers
//!
//! `hfa-rs` reads and writes the hierarchical file format behind `.img`,
//! `.rrd` and `.aux` files:
//!
//! - **Self-describing entries**: a tree of named, typed nodes whose payload
//!   layouts come from a type dictionary stored in the file
//! - **Tiled bands**: raw or run-length compressed blocks, or blocks in a
//!   `.ige` spill file for rasters beyond 2 GiB
//! - **Overviews**: in the container itself or in a dependent `.rrd`
//! - **Georeferencing**: map info, projection, datum and polynomial
//!   transform stacks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hfa_rs::{Access, Container, CreateOptions, PixelType, Result};
//!
//! # fn main() -> Result<()> {
//! let mut img = Container::create("scene.img", 512, 512, 3, PixelType::U8, &CreateOptions::default())?;
//! img.write_block(0, 0, 0, &vec![255u8; 64 * 64])?;
//! img.close()?;
//!
//! let mut img = Container::open("scene.img", Access::ReadOnly)?;
//! let block = img.read_block(0, 0, 0)?;
//! assert_eq!(block[0], 255);
//! # Ok(())
//! # }
//! ```
//!
//! ## Overviews in a dependent file
//!
//! ```rust,no_run
//! use hfa_rs::{Access, Container, HfaConfig, Result};
//!
//! # fn main() -> Result<()> {
//! let config = HfaConfig { use_rrd: true, ..HfaConfig::default() };
//! let mut img = Container::open_with("scene.img", Access::Update, config)?;
//! let index = img.create_overview(0, 2)?;
//! img.write_overview_block(0, index, 0, 0, &vec![0u8; 64 * 64])?;
//! img.close()?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod band;
pub mod codec;
mod companion;
pub mod config;
pub mod container;
pub mod dictionary;
pub mod entry;
pub mod error;
pub mod field;
pub mod header;
pub mod io;
pub mod metadata;
mod overview;
pub mod pack;
pub mod projection;
pub mod spill;
pub mod transform;

pub use band::{Band, BandSource, BlockGrid};
pub use config::{CreateOptions, HfaConfig};
pub use container::Container;
pub use dictionary::TypeDictionary;
pub use entry::{EntryId, EntryTree};
pub use error::{HfaError, Result};
pub use field::FieldValue;
pub use header::FileHeader;
pub use io::{Access, IoStats};
pub use metadata::{ColorTable, LayerType};
pub use pack::PixelType;
pub use projection::{Coordinate, Datum, DatumKind, MapInfo, ProParameters, ProjectionKind, Spheroid};
pub use transform::{GeoTransform, Polynomial, TransformStack};
