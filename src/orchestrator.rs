//! Drives the package lifecycle: resolve, build, install, link, remove.
//!
//! The orchestrator owns no policy about how anything is built; it sequences
//! repository state changes and delegates every action that touches package
//! contents to the plugin registry.

use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::environment;
use crate::error::Error;
use crate::options::{Force, Options};
use crate::package::Package;
use crate::plugin::PluginRegistry;
use crate::repository::Repository;
use crate::runtime::Runtime;

pub struct Orchestrator<'a, R: Runtime> {
    repo: Repository<'a, R>,
    registry: PluginRegistry,
}

impl<'a, R: Runtime> Orchestrator<'a, R> {
    pub fn new(repo: Repository<'a, R>, registry: PluginRegistry) -> Self {
        Self { repo, registry }
    }

    pub fn repository(&self) -> &Repository<'a, R> {
        &self.repo
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    fn runtime(&self) -> &R {
        self.repo.runtime()
    }

    /// Make sure every dependency of `package` is installed, without
    /// building the package itself.
    pub fn get(&self, package: &Package, options: &Options) -> Result<()> {
        package.ensure_loaded()?;
        self.prepare_dependencies(package, options)
    }

    /// Build `package` from the sources in `source`, after its dependencies
    /// are in place. A package that is already recorded as built is skipped
    /// unless forced.
    pub fn build(&self, package: &Package, options: &Options, source: &Path) -> Result<()> {
        package.ensure_loaded()?;
        self.prepare_dependencies(package, options)?;
        self.build_package(package, options, source)
    }

    /// Run a built package's tests.
    pub fn test(&self, package: &Package, source: &Path) -> Result<()> {
        package.ensure_loaded()?;
        if !self.repo.has_meta(&package.name) {
            bail!("[{}] has not been built", package.name);
        }
        let env = environment::build_env_lines(&self.repo);
        self.registry.test(package, source, &self.repo.build_path(&package.name), &env)
    }

    /// Stage a built package and link it into the shared trees.
    pub fn install(&self, package: &Package) -> Result<()> {
        package.ensure_loaded()?;
        if !self.repo.has_meta(&package.name) {
            bail!("unable to install [{}], build it first", package.name);
        }
        self.install_package(package)
    }

    /// Remove a package by name. Removing something that was never installed
    /// is a successful no-op.
    pub fn remove_by_name(&self, name: &str, options: &Options) -> Result<()> {
        match self.repo.load_meta(name)? {
            Some(package) => self.remove(&package, options),
            None => {
                log::info!("[{name}] is not installed");
                Ok(())
            }
        }
    }

    /// Remove a package from the repository. Refused while other recorded
    /// packages still depend on it, unless forced.
    pub fn remove(&self, package: &Package, options: &Options) -> Result<()> {
        package.ensure_loaded()?;
        let count = self.repo.dependency_count(&package.name);
        if count > 0 && options.force == Force::None {
            return Err(Error::StillReferenced { name: package.name.clone(), count }.into());
        }

        // a dependency plugin that installed it gets first claim on removal
        if self.registry.remove(package, self.repo.root()).is_ok() {
            log::debug!("a plugin removed [{}]", package.name);
        } else {
            let install = self.repo.install_path(&package.name);
            if self.runtime().is_dir(&install) {
                self.repo.unlink_directory(&install)?;
                self.runtime().remove_dir_all(&install)?;
            }
        }

        let build = self.repo.build_path(&package.name);
        if self.runtime().exists(&build) {
            self.runtime().remove_dir_all(&build)?;
        }
        self.repo.remove_meta(&package.name)?;
        log::info!("removed [{}]", package.name);
        Ok(())
    }

    /// Expose an installed package's files in the shared trees.
    pub fn link(&self, package: &Package) -> Result<()> {
        package.ensure_loaded()?;
        self.repo.link_directory(&self.repo.install_path(&package.name))
    }

    /// Withdraw an installed package's files from the shared trees.
    pub fn unlink(&self, package: &Package) -> Result<()> {
        package.ensure_loaded()?;
        self.repo.unlink_directory(&self.repo.install_path(&package.name))
    }

    /// Drop a package's build directory, keeping it installed.
    pub fn cleanup(&self, package: &Package) -> Result<()> {
        package.ensure_loaded()?;
        let build = self.repo.build_path(&package.name);
        if self.runtime().exists(&build) {
            self.runtime().remove_dir_all(&build)?;
            log::info!("cleaned build directory for [{}]", package.name);
        }
        Ok(())
    }

    /// Replace this process with a package's linked executable, running in
    /// the repository environment.
    pub fn execute(&self, package: &Package, args: &[String]) -> Result<()> {
        package.ensure_loaded()?;
        let Some(executable) = &package.executable else {
            bail!("[{}] declares no executable", package.name);
        };
        let path = self.repo.bin_path().join(executable);
        if !self.runtime().is_executable(&path) {
            return Err(Error::ExecutableMissing { path }.into());
        }
        let arg0 = Path::new(executable)
            .file_name()
            .unwrap_or_else(|| executable.as_ref());
        let err = Command::new(&path)
            .arg0(arg0)
            .args(args)
            .envs(environment::build_vars(&self.repo))
            .exec();
        Err(anyhow::Error::from(err).context(format!("unable to execute [{}]", path.display())))
    }

    /// Print the repository environment. Without a name, every `KEY=VALUE`
    /// line is printed; `prefix` prints the repository root; any other name
    /// prints that single variable's value.
    pub fn print_env<W: Write>(&self, name: Option<&str>, output: &mut W) -> Result<()> {
        match name {
            None => {
                for line in environment::build_env_lines(&self.repo) {
                    writeln!(output, "{line}")?;
                }
            }
            Some("prefix") => writeln!(output, "{}", self.repo.root().display())?,
            Some(name) => {
                let vars = environment::build_vars(&self.repo);
                let Some((_, value)) = vars.iter().find(|(key, _)| key.as_str() == name) else {
                    bail!("[{name}] is not part of the repository environment");
                };
                writeln!(output, "{value}")?;
            }
        }
        Ok(())
    }

    /// Resolve a package's declared location to a local source directory.
    pub fn resolve_source(&self, package: &Package) -> Result<PathBuf> {
        let target = self.repo.source_path(&package.name);
        let resolved = self.registry.resolve_package(package, &target)?;
        log::debug!("resolved [{}] to [{resolved}]", package.name);
        Ok(PathBuf::from(resolved))
    }

    fn prepare_dependencies(&self, package: &Package, options: &Options) -> Result<()> {
        let dep_options = options.for_dependency();
        for dependency in &package.dependencies {
            if dep_options.force == Force::None && self.repo.has_meta(&dependency.name) {
                log::debug!("dependency [{}] is already installed", dependency.name);
                continue;
            }
            log::info!("preparing dependency [{}]", dependency.name);

            // a dependency plugin may satisfy it without a local build
            if self.registry.add(dependency, self.repo.root()).is_ok() {
                // the dependency is in place, so bookkeeping failure is not fatal
                if let Err(err) = self.repo.save_meta(dependency) {
                    log::warn!("unable to record meta for [{}]: {err:#}", dependency.name);
                }
                continue;
            }

            // otherwise fetch sources and build from scratch
            let source = self.resolve_source(dependency)?;
            self.build(dependency, &dep_options, &source)?;
            self.install_package(dependency)?;
        }
        Ok(())
    }

    fn build_package(&self, package: &Package, options: &Options, source: &Path) -> Result<()> {
        if options.force == Force::None && self.repo.has_meta(&package.name) {
            log::info!("[{}] is already built", package.name);
            return Ok(());
        }
        let build = self.repo.build_path(&package.name);
        let install = self.repo.install_path(&package.name);
        for dir in [&build, &install] {
            self.runtime()
                .create_dir_all(dir)
                .map_err(|_| Error::PathCreation { path: dir.to_path_buf() })?;
        }
        let source = self
            .runtime()
            .canonicalize(source)
            .with_context(|| format!("unable to resolve source directory {source:?}"))?;
        let env = environment::build_env_lines(&self.repo);
        self.registry.build(package, &source, &build, &install, &env)?;
        // a completed build outranks cache bookkeeping
        if let Err(err) = self.repo.save_meta(package) {
            log::warn!("unable to record meta for [{}]: {err:#}", package.name);
        }
        log::info!("built [{}]", package.name);
        Ok(())
    }

    fn install_package(&self, package: &Package) -> Result<()> {
        let build = self.repo.build_path(&package.name);
        let install = self.repo.install_path(&package.name);
        let env = environment::build_env_lines(&self.repo);
        self.registry.install(package, &install, &build, &env)?;
        self.repo.link_directory(&install)?;
        log::info!("installed [{}]", package.name);
        Ok(())
    }
}
