//! kodegen_bundler_port - convert macOS disk image releases into Linux
//! application trees.
//!
//! Prints the conversion result as JSON on stdout; every diagnostic goes to
//! stderr.

use kodegen_bundler_port::cli;
use kodegen_bundler_port::cli::OutputManager;
use std::process;

#[tokio::main]
async fn main() {
    let args = cli::parse_args();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli::execute(args).await {
        Ok(exit_code) => {
            process::exit(exit_code);
        }
        Err(e) => {
            let output = OutputManager::new(false);
            output.error(&e.to_string());

            let suggestions = e.recovery_suggestions();
            if !suggestions.is_empty() {
                let _ = output.println("\n💡 Recovery suggestions:");
                for suggestion in suggestions {
                    let _ = output.indent(&suggestion);
                }
            }

            process::exit(1);
        }
    }
}
