//! Command line interface for kodegen_bundler_port.
//!
//! Parses arguments into [`Settings`](crate::converter::Settings) and a
//! [`ConversionRequest`], runs the conversion and prints the result.

mod args;
mod output;

pub use args::Args;
pub use output::OutputManager;

use crate::converter::{
    utils::fs::expand_home, ConversionRequest, ConversionResult, Converter, Profile, RuntimeSource,
    SettingsBuilder,
};
use crate::error::{CliError, Result};

/// Parse arguments without executing
pub fn parse_args() -> Args {
    Args::parse_args()
}

/// Runs a conversion for `args`, printing the JSON result on stdout.
pub async fn execute(args: Args) -> Result<i32> {
    args.validate()
        .map_err(|reason| CliError::InvalidArguments { reason })?;
    let output = OutputManager::new(args.verbose);

    let profile = match &args.profile {
        Some(path) => Profile::from_file(&expand_home(path))?,
        None => Profile::builtin()?,
    };
    let install_dir = match &args.install_dir {
        Some(dir) => expand_home(dir),
        None => dirs::data_local_dir()
            .map(|dir| dir.join(&profile.launcher_name))
            .ok_or_else(|| CliError::MissingArgument {
                argument: "--install-dir".to_string(),
            })?,
    };
    let product = profile.product_name.clone();

    let mut builder = SettingsBuilder::new().profile(profile);
    if let Some(dir) = &args.cache_dir {
        builder = builder.cache_dir(expand_home(dir));
    }
    if let Some(dir) = &args.scratch_dir {
        builder = builder.scratch_root(expand_home(dir));
    }
    if let Some(dir) = &args.runtime_dir {
        builder = builder.runtime(RuntimeSource::Local(expand_home(dir)));
    }
    let settings = builder.build()?;
    output.verbose(&format!("Download cache: {}", settings.cache_dir().display()))?;

    let request = ConversionRequest {
        input: args.input.clone(),
        payload: args.payload.clone(),
        install_dir,
        start_url: args.start_url.clone(),
    };

    output.info(&format!("Converting {product} into {}", request.install_dir.display()))?;
    let mut converter = Converter::with_defaults(settings).await?;
    // Dropping the conversion on Ctrl-C removes its scratch and staging
    // directories before the process exits.
    let result = tokio::select! {
        result = converter.run(&request) => result?,
        Ok(()) = tokio::signal::ctrl_c() => return Err(CliError::Interrupted.into()),
    };

    report(&output, &result)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(0)
}

fn report(output: &OutputManager, result: &ConversionResult) -> Result<()> {
    for skipped in &result.skipped {
        output.warn(&format!("Skipped {}: {}", skipped.path.display(), skipped.reason))?;
    }
    output.success(&format!(
        "Installed {} into {}",
        result.classification.name(),
        result.install_dir.display()
    ))?;
    output.indent(&format!("launcher: {}", result.launcher.display()))?;
    output.indent(&format!("desktop entry: {}", result.desktop_entry.display()))?;
    Ok(())
}
