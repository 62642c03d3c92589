//! Command line argument parsing and validation.

use clap::Parser;
use std::path::PathBuf;

/// Convert a macOS disk image release into a runnable Linux application
#[derive(Parser, Debug)]
#[command(
    name = "kodegen_bundler_port",
    version,
    about = "Convert a macOS disk image release into a runnable Linux application",
    long_about = "Convert a macOS Electron application release (.dmg) into a runnable Linux tree.

The converted tree is described as JSON on stdout; diagnostics go to stderr.

Usage:
  kodegen_bundler_port
  kodegen_bundler_port ~/Downloads/Claude.dmg
  kodegen_bundler_port Installer.dmg --payload Claude-payload.dmg --install-dir ~/.local/opt/claude"
)]
pub struct Args {
    /// Disk image to convert (default: well-known paths, then download)
    #[arg(index = 1, value_name = "INPUT")]
    pub input: Option<PathBuf>,

    /// Payload disk image, used when INPUT is an installer
    #[arg(long, value_name = "PATH", env = "KODEGEN_PORT_PAYLOAD")]
    pub payload: Option<PathBuf>,

    /// Install directory (default: <data dir>/<launcher name>)
    #[arg(long, value_name = "DIR", env = "KODEGEN_PORT_INSTALL_DIR")]
    pub install_dir: Option<PathBuf>,

    /// URL the application opens at startup
    #[arg(long, value_name = "URL")]
    pub start_url: Option<String>,

    /// Product profile replacing the built-in one
    #[arg(long, value_name = "FILE", env = "KODEGEN_PORT_PROFILE")]
    pub profile: Option<PathBuf>,

    /// Download cache directory
    #[arg(long, value_name = "DIR", env = "KODEGEN_PORT_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Use an already unpacked runtime instead of downloading one
    #[arg(long, value_name = "DIR", env = "KODEGEN_PORT_RUNTIME_DIR")]
    pub runtime_dir: Option<PathBuf>,

    /// Parent directory for scratch workspaces (default: system temp)
    #[arg(long, value_name = "DIR", env = "KODEGEN_PORT_SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate arguments for consistency
    pub fn validate(&self) -> Result<(), String> {
        for (flag, path) in [("INPUT", &self.input), ("--payload", &self.payload)] {
            if let Some(path) = path
                && !path.is_file()
            {
                return Err(format!("{flag} {} does not exist", path.display()));
            }
        }
        if let Some(dir) = &self.runtime_dir
            && !dir.is_dir()
        {
            return Err(format!("--runtime-dir {} is not a directory", dir.display()));
        }
        if let Some(url) = &self.start_url {
            url::Url::parse(url).map_err(|e| format!("--start-url '{url}' is invalid: {e}"))?;
        }
        Ok(())
    }
}
