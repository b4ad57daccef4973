//! Repository layout and state.
//!
//! A repository is a directory tree rooted either at the global location or
//! at a `.kiln` directory discovered by walking up from the working
//! directory. It holds per-package source, build, install and meta
//! namespaces, shared `bin`/`lib`/`include` trees that installed packages are
//! linked into, and a `plugins` directory.

mod links;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::error::Error;
use crate::options::{Options, Scope};
use crate::package::{Package, DESCRIPTOR_FILE};
use crate::plugin::{Hook, HookOutcome, Manifest, Plugin, PluginHost, PluginRegistry, MANIFEST_FILE};
use crate::runtime::Runtime;

/// Root used for globally scoped operations.
pub const GLOBAL_ROOT: &str = "/usr/local/share/kiln";

/// Directory name marking a locally scoped repository.
pub const LOCAL_DIR_NAME: &str = ".kiln";

const BIN_DIR: &str = "bin";
const LIB_DIR: &str = "lib";
const INCLUDE_DIR: &str = "include";
const SOURCE_DIR: &str = "src";
const BUILD_DIR: &str = "build";
const INSTALL_DIR: &str = "install";
const META_DIR: &str = "meta";
const META_VERSION_FILE: &str = "version";
const PLUGIN_DIR: &str = "plugins";

pub struct Repository<'a, R: Runtime> {
    runtime: &'a R,
    root: PathBuf,
}

impl<'a, R: Runtime> Repository<'a, R> {
    /// Locate the repository for the requested scope. A local scope walks up
    /// from the working directory looking for an existing `.kiln` directory,
    /// then tries the home directory, and falls back to creating one in the
    /// working directory.
    pub fn discover(runtime: &'a R, options: &Options) -> Result<Self> {
        let root = match options.scope {
            Scope::Global => PathBuf::from(GLOBAL_ROOT),
            Scope::Local => Self::find_local_root(runtime)?,
        };
        log::debug!("using repository [{}]", root.display());
        Ok(Self { runtime, root })
    }

    /// A repository at an explicit root, bypassing discovery.
    pub fn with_root(runtime: &'a R, root: PathBuf) -> Self {
        Self { runtime, root }
    }

    fn find_local_root(runtime: &R) -> Result<PathBuf> {
        let current = runtime.current_dir()?;
        let mut dir = current.as_path();
        loop {
            let candidate = dir.join(LOCAL_DIR_NAME);
            if runtime.is_dir(&candidate) {
                return Ok(candidate);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        if let Some(home) = runtime.home_dir() {
            let candidate = home.join(LOCAL_DIR_NAME);
            if runtime.is_dir(&candidate) {
                return Ok(candidate);
            }
        }
        Ok(current.join(LOCAL_DIR_NAME))
    }

    pub fn runtime(&self) -> &R {
        self.runtime
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bin_path(&self) -> PathBuf {
        self.root.join(BIN_DIR)
    }

    pub fn lib_path(&self) -> PathBuf {
        self.root.join(LIB_DIR)
    }

    pub fn include_path(&self) -> PathBuf {
        self.root.join(INCLUDE_DIR)
    }

    pub fn plugin_path(&self) -> PathBuf {
        self.root.join(PLUGIN_DIR)
    }

    pub fn source_root(&self) -> PathBuf {
        self.root.join(SOURCE_DIR)
    }

    pub fn source_path(&self, name: &str) -> PathBuf {
        self.source_root().join(name)
    }

    pub fn build_path(&self, name: &str) -> PathBuf {
        self.root.join(BUILD_DIR).join(name)
    }

    pub fn install_path(&self, name: &str) -> PathBuf {
        self.root.join(INSTALL_DIR).join(name)
    }

    pub fn meta_path(&self, name: &str) -> PathBuf {
        self.root.join(META_DIR).join(name)
    }

    /// Make sure the repository exists and is usable, creating the directory
    /// skeleton if the operator agrees.
    pub fn validate(&self, options: &Options) -> Result<()> {
        if !self.runtime.exists(&self.root) {
            let prompt = format!("Create repository [{}]?", self.root.display());
            if !options.assume_defaults && !self.runtime.confirm(&prompt)? {
                bail!("repository [{}] does not exist", self.root.display());
            }
        }
        for dir in [
            self.bin_path(),
            self.lib_path(),
            self.include_path(),
            self.source_root(),
            self.root.join(BUILD_DIR),
            self.root.join(INSTALL_DIR),
            self.root.join(META_DIR),
            self.plugin_path(),
        ] {
            self.runtime
                .create_dir_all(&dir)
                .map_err(|_| Error::PathCreation { path: dir.clone() })?;
        }

        if options.scope == Scope::Global && !self.runtime.is_privileged() {
            log::warn!("the global repository usually requires elevated privileges");
        }

        let bin = self.bin_path();
        let on_path = self
            .runtime
            .env_var("PATH")
            .map(|path| std::env::split_paths(&path).any(|entry| entry == bin))
            .unwrap_or(false);
        if !on_path {
            log::warn!("[{}] is not on PATH; linked executables will not be found", bin.display());
        }
        Ok(())
    }

    // meta records

    fn meta_record_path(&self, name: &str) -> PathBuf {
        self.meta_path(name).join(DESCRIPTOR_FILE)
    }

    /// Whether a package has been built and installed into this repository.
    /// The existence of the meta record is the only cache signal.
    pub fn has_meta(&self, name: &str) -> bool {
        self.runtime.exists(&self.meta_record_path(name))
    }

    /// Record a package as built by saving its descriptor and version.
    pub fn save_meta(&self, package: &Package) -> Result<()> {
        package.ensure_loaded()?;
        let dir = self.meta_path(&package.name);
        self.runtime
            .create_dir_all(&dir)
            .map_err(|_| Error::PathCreation { path: dir.clone() })?;
        let json = package
            .to_json()
            .map_err(|_| Error::MetadataIo { name: package.name.clone() })?;
        self.runtime
            .write(&self.meta_record_path(&package.name), json.as_bytes())
            .map_err(|_| Error::MetadataIo { name: package.name.clone() })?;
        let version = format!("{}\n", package.version);
        self.runtime
            .write(&dir.join(META_VERSION_FILE), version.as_bytes())
            .map_err(|_| Error::MetadataIo { name: package.name.clone() })?;
        log::trace!("recorded meta for [{}]", package.name);
        Ok(())
    }

    /// Load the recorded descriptor for a package, if any.
    pub fn load_meta(&self, name: &str) -> Result<Option<Package>> {
        let path = self.meta_record_path(name);
        if !self.runtime.exists(&path) {
            return Ok(None);
        }
        let content = self
            .runtime
            .read_to_string(&path)
            .map_err(|_| Error::MetadataIo { name: name.to_string() })?;
        let package =
            Package::parse(&content).map_err(|_| Error::MetadataIo { name: name.to_string() })?;
        Ok(Some(package))
    }

    /// Delete a package's meta record. Missing records are fine.
    pub fn remove_meta(&self, name: &str) -> Result<()> {
        let dir = self.meta_path(name);
        if !self.runtime.exists(&dir) {
            return Ok(());
        }
        self.runtime
            .remove_dir_all(&dir)
            .map_err(|_| Error::MetadataIo { name: name.to_string() })?;
        Ok(())
    }

    /// How many other recorded packages depend on `name`, at any depth.
    pub fn dependency_count(&self, name: &str) -> usize {
        let meta_root = self.root.join(META_DIR);
        let entries = match self.runtime.read_dir(&meta_root) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let mut count = 0;
        for entry in entries {
            let Some(entry_name) = entry.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if entry_name == name || entry_name.starts_with('.') {
                continue;
            }
            match self.load_meta(entry_name) {
                Ok(Some(package)) => count += package.dependency_count(name),
                Ok(None) => {}
                Err(err) => log::warn!("skipping unreadable meta for [{entry_name}]: {err:#}"),
            }
        }
        count
    }

    // plugins

    /// Load every valid, enabled plugin from the plugin directory, in name
    /// order, and give each a chance to initialize.
    pub fn load_plugins(&self, options: &Options) -> Result<PluginRegistry> {
        let mut registry = PluginRegistry::new();
        let plugin_root = self.plugin_path();
        if !self.runtime.is_dir(&plugin_root) {
            return Ok(registry);
        }
        let mut entries = self
            .runtime
            .read_dir(&plugin_root)
            .with_context(|| format!("unable to list plugins in [{}]", plugin_root.display()))?;
        entries.sort();

        for entry in entries {
            if !self.runtime.is_dir(&entry) {
                continue;
            }
            let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match self.load_plugin(name, &entry, options) {
                Ok(Some(host)) => registry.register(std::sync::Arc::new(host)),
                Ok(None) => {}
                Err(err) => log::warn!("ignoring plugin [{name}]: {err:#}"),
            }
        }
        log::debug!("loaded {} plugin(s)", registry.len());
        Ok(registry)
    }

    fn load_plugin(&self, name: &str, dir: &Path, options: &Options) -> Result<Option<PluginHost>> {
        let manifest_path = dir.join(MANIFEST_FILE);
        if !self.runtime.exists(&manifest_path) {
            log::trace!("[{name}] has no manifest, skipping");
            return Ok(None);
        }
        let content = self.runtime.read_to_string(&manifest_path)?;
        let manifest = Manifest::parse(&content)?;
        if !manifest.enabled {
            log::debug!("plugin [{name}] is disabled");
            return Ok(None);
        }
        let host = PluginHost::from_manifest(name, dir, &manifest, options.verbose)?;
        if !self.runtime.is_executable(host.executable()) {
            bail!("[{}] is not executable", host.executable().display());
        }
        match host.run(Hook::Load, &[]) {
            Ok(HookOutcome::Handled(_)) | Ok(HookOutcome::Declined) => Ok(Some(host)),
            Err(err) => Err(err.context(format!("plugin [{name}] failed to initialize"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, RealRuntime};
    use crate::test_utils::{package, package_with_deps};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn local_repo(dir: &Path) -> Repository<'static, RealRuntime> {
        static RUNTIME: RealRuntime = RealRuntime;
        Repository::with_root(&RUNTIME, dir.join(LOCAL_DIR_NAME))
    }

    #[test]
    fn test_validate_creates_skeleton() {
        let dir = tempfile::tempdir().unwrap();
        let repo = local_repo(dir.path());
        let options = Options { assume_defaults: true, ..Options::default() };
        repo.validate(&options).unwrap();
        for sub in ["bin", "lib", "include", "src", "build", "install", "meta", "plugins"] {
            assert!(repo.root().join(sub).is_dir(), "missing {sub}");
        }
    }

    #[test]
    fn test_validate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let repo = local_repo(dir.path());
        let options = Options { assume_defaults: true, ..Options::default() };
        repo.validate(&options).unwrap();
        repo.validate(&options).unwrap();
    }

    #[test]
    fn test_discover_walks_up_to_existing_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join(LOCAL_DIR_NAME);
        fs::create_dir_all(&root).unwrap();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();

        let mut runtime = MockRuntime::new();
        let nested_clone = nested.clone();
        runtime.expect_current_dir().returning(move || Ok(nested_clone.clone()));
        runtime.expect_is_dir().returning(|path| path.exists() && path.is_dir());

        let repo = Repository::discover(&runtime, &Options::default()).unwrap();
        assert_eq!(repo.root(), root);
    }

    #[test]
    fn test_discover_defaults_to_working_directory() {
        let dir = tempfile::tempdir().unwrap();

        let mut runtime = MockRuntime::new();
        let cwd = dir.path().to_path_buf();
        runtime.expect_current_dir().returning(move || Ok(cwd.clone()));
        runtime.expect_is_dir().returning(|_| false);
        runtime.expect_home_dir().returning(|| None);

        let repo = Repository::discover(&runtime, &Options::default()).unwrap();
        assert_eq!(repo.root(), dir.path().join(LOCAL_DIR_NAME));
    }

    #[test]
    fn test_discover_falls_back_to_home_root() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        let home_root = home.join(LOCAL_DIR_NAME);
        fs::create_dir_all(&home_root).unwrap();
        let cwd = dir.path().join("work");
        fs::create_dir_all(&cwd).unwrap();

        let mut runtime = MockRuntime::new();
        let cwd_clone = cwd.clone();
        runtime.expect_current_dir().returning(move || Ok(cwd_clone.clone()));
        let home_marker = home_root.clone();
        runtime.expect_is_dir().returning(move |path| path == home_marker);
        runtime.expect_home_dir().returning(move || Some(home.clone()));

        let repo = Repository::discover(&runtime, &Options::default()).unwrap();
        assert_eq!(repo.root(), home_root);
    }

    #[test]
    fn test_discover_global_scope() {
        let runtime = MockRuntime::new();
        let options = Options { scope: Scope::Global, ..Options::default() };
        let repo = Repository::discover(&runtime, &options).unwrap();
        assert_eq!(repo.root(), Path::new(GLOBAL_ROOT));
    }

    #[test]
    fn test_meta_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = local_repo(dir.path());
        repo.validate(&Options { assume_defaults: true, ..Options::default() }).unwrap();

        let pkg = package("libfoo", "1.0");
        assert!(!repo.has_meta("libfoo"));
        repo.save_meta(&pkg).unwrap();
        assert!(repo.has_meta("libfoo"));

        let loaded = repo.load_meta("libfoo").unwrap().unwrap();
        assert_eq!(loaded.name, "libfoo");
        assert_eq!(loaded.version, "1.0");
        assert!(loaded.is_loaded());
    }

    #[test]
    fn test_save_meta_writes_version_file() {
        let dir = tempfile::tempdir().unwrap();
        let repo = local_repo(dir.path());
        repo.validate(&Options { assume_defaults: true, ..Options::default() }).unwrap();

        repo.save_meta(&package("libfoo", "1.0")).unwrap();
        let version = std::fs::read_to_string(repo.meta_path("libfoo").join("version")).unwrap();
        assert_eq!(version, "1.0\n");
    }

    #[test]
    fn test_remove_meta_deletes_record() {
        let dir = tempfile::tempdir().unwrap();
        let repo = local_repo(dir.path());
        repo.validate(&Options { assume_defaults: true, ..Options::default() }).unwrap();

        repo.save_meta(&package("libfoo", "1.0")).unwrap();
        repo.remove_meta("libfoo").unwrap();
        assert!(!repo.has_meta("libfoo"));
        assert!(!repo.meta_path("libfoo").exists());
    }

    #[test]
    fn test_load_meta_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let repo = local_repo(dir.path());
        assert!(repo.load_meta("ghost").unwrap().is_none());
    }

    #[test]
    fn test_remove_meta_of_missing_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let repo = local_repo(dir.path());
        repo.remove_meta("ghost").unwrap();
    }

    #[test]
    fn test_save_meta_requires_loaded_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let repo = local_repo(dir.path());
        let mut pkg = Package::default();
        pkg.name = "bare".to_string();
        assert!(repo.save_meta(&pkg).is_err());
    }

    #[test]
    fn test_dependency_count_scans_meta_records() {
        let dir = tempfile::tempdir().unwrap();
        let repo = local_repo(dir.path());
        repo.validate(&Options { assume_defaults: true, ..Options::default() }).unwrap();

        repo.save_meta(&package("libfoo", "1.0")).unwrap();
        repo.save_meta(&package_with_deps("app", "2.0", &[("libfoo", "1.0")])).unwrap();
        repo.save_meta(&package_with_deps("tool", "0.1", &[("libfoo", "1.0")])).unwrap();

        assert_eq!(repo.dependency_count("libfoo"), 2);
        assert_eq!(repo.dependency_count("app"), 0);
        assert_eq!(repo.dependency_count("absent"), 0);
    }

    #[test]
    fn test_load_plugins_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let repo = local_repo(dir.path());
        let registry = repo.load_plugins(&Options::default()).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_load_plugins_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let repo = local_repo(dir.path());
        let options = Options { assume_defaults: true, ..Options::default() };
        repo.validate(&options).unwrap();

        write_plugin(&repo.plugin_path().join("worker"), true);
        write_plugin(&repo.plugin_path().join("disabled"), false);
        // directories without a manifest are not plugins
        fs::create_dir_all(repo.plugin_path().join("junk")).unwrap();

        let registry = repo.load_plugins(&options).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("worker").is_some());
    }

    fn write_plugin(dir: &Path, enabled: bool) {
        fs::create_dir_all(dir).unwrap();
        let script = dir.join("run.sh");
        fs::write(
            &script,
            "#!/bin/sh\nread hook\nwhile read line; do [ \"$line\" = \"END\" ] && break; done\nexit 0\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(
            dir.join(MANIFEST_FILE),
            format!(r#"{{ "executable": "run.sh", "type": "build", "enabled": {enabled} }}"#),
        )
        .unwrap();
    }
}
