//! Package a built workspace and its resolved runtime dependencies into a
//! single relocatable bundle.
//!
//! - **Bundle container** - Fixed 4 MiB metadata region followed by overlay
//!   archives that can be located and verified without decompressing the file
//! - **Cache layout** - Marker-checked bundle directory with a versioned cache
//! - **Change detection** - Dependency fingerprints and installer metadata
//!   decide whether installers run and the dependencies overlay is rebuilt
//! - **Installers** - Pluggable dependency sources, with a built-in `pip3`
//!
//! # Architecture
//!
//! ```text
//! bundle-builder (binary)
//!     │
//!     ├── config::load_config        bundle.toml -> options, packages, installers
//!     └── pipeline::run_bundle
//!             ├── layout::CacheLayout            markers, lock, paths
//!             ├── fingerprint / installer::metadata   change signals
//!             ├── installer::InstallerManager    runs installers into staging
//!             └── assembler (v1 | v2)
//!                     └── bundle::BundleWriter   output.tar
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use bundle_builder::{run_bundle, BundleOptions, InstallerRegistry, WorkspacePackage};
//!
//! let options = BundleOptions::new("install", "bundle");
//! let packages = vec![WorkspacePackage::new("talker", ["pip3:numpy==1.16.0"])];
//! let installers = InstallerRegistry::with_builtin()
//!     .instantiate_all(&[("pip3".to_string(), toml::Table::new())].into())?;
//! let outcome = run_bundle(&options, &packages, installers)?;
//! println!("{}", outcome.output_path.display());
//! ```

pub mod artifact;
pub mod assembler;
pub mod bundle;
pub mod checksum;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod installer;
pub mod layout;
pub mod pipeline;
pub mod workspace;

pub use bundle::{BundleReader, BundleWriter, OverlayRecord, METADATA_REGION_SIZE};
pub use error::{BundleError, BundleResult};
pub use installer::registry::InstallerRegistry;
pub use installer::Installer;
pub use layout::{BundleFormat, CacheLayout};
pub use pipeline::{run_bundle, BundleOptions, BundleOutcome};
pub use workspace::WorkspacePackage;
