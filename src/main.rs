use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use env_logger::Env;

use kiln::options::{Force, Options, Scope};
use kiln::orchestrator::Orchestrator;
use kiln::package::{Package, DESCRIPTOR_FILE};
use kiln::repository::Repository;
use kiln::runtime::{RealRuntime, Runtime};

#[derive(Parser, Debug)]
#[command(name = "kiln", version = env!("KILN_VERSION"))]
#[command(about = "Builds, installs and links packages through plugins")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show plugin output while hooks run
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Rebuild even when cached; twice to rebuild dependencies too
    #[arg(short, long, global = true, action = ArgAction::Count)]
    force: u8,

    /// Use the global repository instead of a local one
    #[arg(short, long, global = true)]
    global: bool,

    /// Repository root, bypassing discovery
    #[arg(long, global = true, env = "KILN_ROOT")]
    root: Option<PathBuf>,

    /// Descriptor file name inside a package directory
    #[arg(long, global = true, default_value = DESCRIPTOR_FILE)]
    package_file: String,

    /// Assume default answers instead of prompting
    #[arg(short = 'y', long = "defaults", global = true)]
    assume_defaults: bool,

    /// Log filter, e.g. "debug" or "kiln=trace"
    #[arg(long, global = true, env = "KILN_LOG", default_value = "info")]
    log: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch and install a package's dependencies
    Get { location: Option<String> },
    /// Build a package from source
    Build { location: Option<String> },
    /// Run a built package's tests
    Test { location: Option<String> },
    /// Build a package and link it into the repository
    Install { location: Option<String> },
    /// Build, test and install a package in one pass
    Add { location: Option<String> },
    /// Remove an installed package
    Remove { name: String },
    /// Expose an installed package in the shared trees
    Link { name: String },
    /// Withdraw an installed package from the shared trees
    Unlink { name: String },
    /// Remove a package's build directory
    Clean { location: Option<String> },
    /// Run an installed package's executable
    Run {
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the repository environment, or one variable of it
    Env {
        /// Variable to print; "prefix" prints the repository root
        name: Option<String>,
    },
}

impl Cli {
    fn options(&self) -> Options {
        Options {
            scope: if self.global { Scope::Global } else { Scope::Local },
            force: Force::from_count(self.force),
            verbose: self.verbose,
            package_file: self.package_file.clone(),
            location: self.location().map(PathBuf::from),
            assume_defaults: self.assume_defaults,
        }
    }

    fn location(&self) -> Option<&str> {
        match &self.command {
            Commands::Get { location }
            | Commands::Build { location }
            | Commands::Test { location }
            | Commands::Install { location }
            | Commands::Add { location }
            | Commands::Clean { location } => location.as_deref(),
            _ => None,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log)).init();

    if let Err(err) = run(cli) {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let runtime = RealRuntime;
    let options = cli.options();

    let repo = match &cli.root {
        Some(root) => Repository::with_root(&runtime, root.clone()),
        None => Repository::discover(&runtime, &options)?,
    };
    repo.validate(&options)?;
    let registry = repo.load_plugins(&options)?;
    let orchestrator = Orchestrator::new(repo, registry);

    let result = dispatch(&cli, &runtime, &options, &orchestrator);
    orchestrator.registry().unload_all();
    result
}

fn dispatch(
    cli: &Cli,
    runtime: &RealRuntime,
    options: &Options,
    orchestrator: &Orchestrator<'_, RealRuntime>,
) -> Result<()> {
    match &cli.command {
        Commands::Get { location } => {
            let (package, _) = source_package(runtime, options, orchestrator, location.as_deref())?;
            orchestrator.get(&package, options)
        }
        Commands::Build { location } => {
            let (package, source) =
                source_package(runtime, options, orchestrator, location.as_deref())?;
            orchestrator.build(&package, options, &source)
        }
        Commands::Test { location } => {
            let (package, source) =
                source_package(runtime, options, orchestrator, location.as_deref())?;
            orchestrator.test(&package, &source)
        }
        Commands::Install { location } => {
            let (package, _) = source_package(runtime, options, orchestrator, location.as_deref())?;
            orchestrator.install(&package)
        }
        Commands::Add { location } => {
            let (package, source) =
                source_package(runtime, options, orchestrator, location.as_deref())?;
            orchestrator.build(&package, options, &source)?;
            orchestrator.test(&package, &source)?;
            orchestrator.install(&package)
        }
        Commands::Remove { name } => orchestrator.remove_by_name(name, options),
        Commands::Link { name } => orchestrator.link(&installed_package(orchestrator, name)?),
        Commands::Unlink { name } => orchestrator.unlink(&installed_package(orchestrator, name)?),
        Commands::Clean { location } => {
            let (package, _) = source_package(runtime, options, orchestrator, location.as_deref())?;
            orchestrator.cleanup(&package)
        }
        Commands::Run { name, args } => {
            orchestrator.execute(&installed_package(orchestrator, name)?, args)
        }
        Commands::Env { name } => orchestrator.print_env(name.as_deref(), &mut io::stdout()),
    }
}

/// Resolve a command line location to a source directory and load the
/// package descriptor from it. No location means the working directory; a
/// location that is not an existing directory is handed to resolver plugins.
fn source_package(
    runtime: &RealRuntime,
    options: &Options,
    orchestrator: &Orchestrator<'_, RealRuntime>,
    location: Option<&str>,
) -> Result<(Package, PathBuf)> {
    let dir = match location {
        None => runtime.current_dir()?,
        Some(location) => {
            let path = PathBuf::from(location);
            if runtime.is_dir(&path) {
                runtime.canonicalize(&path)?
            } else {
                let target = orchestrator.repository().source_root();
                let resolved = orchestrator
                    .registry()
                    .resolve(location, &target)
                    .with_context(|| format!("unable to resolve [{location}]"))?;
                PathBuf::from(resolved)
            }
        }
    };
    let package = Package::load(runtime, &dir, options)?;
    Ok((package, dir))
}

/// Load the recorded descriptor of an installed package.
fn installed_package(
    orchestrator: &Orchestrator<'_, RealRuntime>,
    name: &str,
) -> Result<Package> {
    match orchestrator.repository().load_meta(name)? {
        Some(package) => Ok(package),
        None => bail!("[{name}] is not installed"),
    }
}
