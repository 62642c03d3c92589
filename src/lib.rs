//! # kodegen_bundler_port
//!
//! Converts macOS disk image releases of Electron applications into runnable
//! Linux application trees.
//!
//! ## Features
//!
//! - **Artifact resolution**: explicit path, well-known download locations, then a cached download
//! - **Bundle classification**: tells the application apart from its installer and refuses unsupported package shapes
//! - **Checked patching**: literal substitutions that only apply to the exact build they were written for
//! - **Native rebuilds**: compiled add-ons rebuilt from source against the target runtime
//!
//! ## Usage
//!
//! ```bash
//! kodegen_bundler_port                          # find or download the release, install it
//! kodegen_bundler_port ~/Downloads/Claude.dmg   # convert a specific image
//! kodegen_bundler_port Installer.dmg --payload Claude-payload.dmg --install-dir ~/.local/opt/claude
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cli;
pub mod converter;
pub mod error;

pub use cli::Args;
pub use converter::{
    ConversionRequest, ConversionResult, Converter, Profile, Settings, SettingsBuilder,
};
pub use error::{CliError, PortError, Result};
