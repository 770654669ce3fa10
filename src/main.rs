use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode as ProcessExit;

use kforge::config;
use kforge::exec::Executor;
use kforge::models::BuildOptions;
use kforge::notify::Notifier;
use kforge::paths::Layout;
use kforge::pipeline;
use kforge::prompt::ConsolePrompt;
use kforge::toolchain::{acquire, resolver};
use kforge::PipelineError;

#[derive(Parser)]
#[command(name = "kforge", version = kforge::VERSION, about = "Interactive kernel build pipeline")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run one complete build session.
    Build {
        /// Target codename; prompted for when omitted.
        codename: Option<String>,
        /// Echo every resolved command line before execution.
        #[arg(long)]
        debug: bool,
    },
    /// Update the tool itself and every installed toolchain.
    Update,
    /// Print the versions of all locally installed toolchains.
    Versions,
    /// Send a message through the configured notification sink.
    Msg { text: String },
    /// Package an existing kernel image without building.
    Zip {
        /// Kernel image file to package.
        image: PathBuf,
        /// Target codename for the archive name.
        codename: String,
    },
    /// List archives produced so far for a codename.
    Builds { codename: String },
    /// Print the newest stable kernel release published upstream.
    LatestTag,
    /// Apply (or revert) a patch file against the kernel source tree.
    Patch {
        /// Unified diff to apply with -p1.
        file: PathBuf,
        /// Revert instead of apply.
        #[arg(long)]
        revert: bool,
    },
}

fn main() -> ProcessExit {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(()) => ProcessExit::SUCCESS,
        Err(e) => {
            if e.is_clean_abort() {
                log::info!("{e}");
            } else {
                log::error!("{e}");
            }
            ProcessExit::from(e.exit_code().as_i32() as u8)
        }
    }
}

fn run() -> Result<(), PipelineError> {
    let cli = Cli::parse();
    let config = config::load_or_default()?;
    let layout = Layout::from_cwd()?;
    let notifier = Notifier::from_config(&config);

    match cli.mode {
        Mode::Build { codename, debug } => {
            let mut prompt = ConsolePrompt;
            pipeline::run_build(
                &config,
                &layout,
                &mut prompt,
                &notifier,
                BuildOptions { codename, debug },
            )
        }
        Mode::Update => {
            acquire::update_all(&layout)?;
            Ok(())
        }
        Mode::Versions => {
            let rows = resolver::installed_versions(&layout, &Executor::default());
            if rows.is_empty() {
                println!("no toolchains installed");
            }
            for (kind, version) in rows {
                println!("{kind}: {version}");
            }
            Ok(())
        }
        Mode::Msg { text } => {
            if !notifier.enabled() {
                log::warn!("notifications are not configured");
            }
            notifier.send_message(&text);
            Ok(())
        }
        Mode::Zip { image, codename } => {
            let archive = pipeline::zip_from_image(&config, &layout, &codename, &image)?;
            println!("{}", archive.display());
            Ok(())
        }
        Mode::Builds { codename } => {
            for name in pipeline::list_builds(&layout, &codename)? {
                println!("{name}");
            }
            Ok(())
        }
        Mode::LatestTag => {
            println!("{}", pipeline::latest_kernel_tag()?);
            Ok(())
        }
        Mode::Patch { file, revert } => pipeline::apply_patch(&config, &file, revert),
    }
}
