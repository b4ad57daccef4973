//! Ordered collection of loaded plugins and the dispatch rules over them.
//!
//! Dispatch offers a hook to every registered plugin in load order. The first
//! plugin that handles the hook wins; plugins that decline or fail are
//! skipped. If nobody handles it the dispatch fails as a whole.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};

use crate::error::Error;
use crate::package::Package;

use super::{Hook, HookOutcome, Plugin};

#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        log::debug!("registered plugin [{}] version [{}]", plugin.name(), plugin.version());
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.iter().find(|plugin| plugin.name() == name)
    }

    /// Offer `hook` to each supporting plugin in order until one handles it.
    /// The arguments are rebuilt per plugin so package names can be
    /// overridden for a specific plugin.
    fn dispatch<F>(&self, hook: Hook, args_for: F) -> Result<Vec<String>>
    where
        F: Fn(&dyn Plugin) -> Vec<String>,
    {
        for plugin in &self.plugins {
            if !hook.supported_by(plugin.kind()) {
                continue;
            }
            let args = args_for(plugin.as_ref());
            match plugin.run(hook, &args) {
                Ok(HookOutcome::Handled(values)) => {
                    log::debug!("plugin [{}] handled [{hook}]", plugin.name());
                    return Ok(values);
                }
                Ok(HookOutcome::Declined) => continue,
                Err(err) => {
                    log::debug!("plugin [{}] did not complete [{hook}]: {err:#}", plugin.name());
                    continue;
                }
            }
        }
        Err(Error::PluginDispatch { action: hook.as_str() }.into())
    }

    /// Resolve a location string to a local source directory.
    pub fn resolve(&self, location: &str, target: &Path) -> Result<String> {
        let values = self.dispatch(Hook::Resolve, |_| {
            vec![target.display().to_string(), location.to_string()]
        })?;
        values
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no source directory returned for [{location}]"))
    }

    /// Resolve a package to a local source directory, honoring a per-plugin
    /// location override in its descriptor.
    pub fn resolve_package(&self, package: &Package, target: &Path) -> Result<String> {
        let values = self.dispatch(Hook::Resolve, |plugin| {
            let location = package
                .plugin_value(plugin.name(), "location")
                .or_else(|| package.location.clone())
                .unwrap_or_default();
            vec![target.display().to_string(), location]
        })?;
        values
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no source directory returned for [{}]", package.name))
    }

    /// Ask a dependency plugin to install a package system-wide.
    pub fn add(&self, package: &Package, root: &Path) -> Result<()> {
        self.package_action(Hook::Add, package, root)
    }

    /// Ask a dependency plugin to remove a package it installed.
    pub fn remove(&self, package: &Package, root: &Path) -> Result<()> {
        self.package_action(Hook::Remove, package, root)
    }

    fn package_action(&self, hook: Hook, package: &Package, root: &Path) -> Result<()> {
        self.dispatch(hook, |plugin| {
            vec![
                package.name_for_plugin(plugin.name()),
                package.version.clone(),
                root.display().to_string(),
            ]
        })
        .map(|_| ())
    }

    /// Build a package. Descriptors naming build systems pin the exact
    /// plugins to run, in order; otherwise the first build plugin that
    /// accepts wins.
    pub fn build(
        &self,
        package: &Package,
        source: &Path,
        build: &Path,
        install: &Path,
        env: &[String],
    ) -> Result<()> {
        let args_for = |plugin: &dyn Plugin| {
            let mut args = vec![
                package.name_for_plugin(plugin.name()),
                package.version.clone(),
                source.display().to_string(),
                build.display().to_string(),
                install.display().to_string(),
                package.build_options.clone(),
            ];
            args.extend_from_slice(env);
            args
        };

        if package.build_system.is_empty() {
            return self.dispatch(Hook::Build, args_for).map(|_| ());
        }

        for name in &package.build_system {
            let plugin = self
                .get(name)
                .ok_or_else(|| anyhow!("no plugin [{name}] found to build [{}]", package.name))?;
            log::info!("building [{}] with [{name}]", package.name);
            match plugin.run(Hook::Build, &args_for(plugin.as_ref()))? {
                HookOutcome::Handled(_) => {}
                HookOutcome::Declined => {
                    bail!("plugin [{name}] declined to build [{}]", package.name)
                }
            }
        }
        Ok(())
    }

    /// Run a package's tests from its build directory.
    pub fn test(&self, package: &Package, source: &Path, build: &Path, env: &[String]) -> Result<()> {
        self.dispatch(Hook::Test, |plugin| {
            let mut args = vec![
                package.name_for_plugin(plugin.name()),
                package.version.clone(),
                source.display().to_string(),
                build.display().to_string(),
            ];
            args.extend_from_slice(env);
            args
        })
        .map(|_| ())
    }

    /// Stage a package's build products into its install directory.
    pub fn install(&self, package: &Package, install: &Path, build: &Path, env: &[String]) -> Result<()> {
        self.dispatch(Hook::Install, |plugin| {
            let mut args = vec![
                package.name_for_plugin(plugin.name()),
                package.version.clone(),
                install.display().to_string(),
                build.display().to_string(),
            ];
            args.extend_from_slice(env);
            args
        })
        .map(|_| ())
    }

    /// Give every plugin a chance to clean up. Failures are logged, not
    /// propagated.
    pub fn unload_all(&self) {
        for plugin in &self.plugins {
            if !Hook::Unload.supported_by(plugin.kind()) {
                continue;
            }
            if let Err(err) = plugin.run(Hook::Unload, &[]) {
                log::debug!("plugin [{}] did not unload cleanly: {err:#}", plugin.name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use crate::plugin::{MockPlugin, PluginKind};
    use crate::test_utils::package;
    use mockall::predicate::eq;

    fn mock_plugin(name: &str, kind: PluginKind) -> MockPlugin {
        let mut plugin = MockPlugin::new();
        plugin.expect_name().return_const(name.to_string());
        plugin.expect_version().return_const("1.0".to_string());
        plugin.expect_kind().return_const(kind);
        plugin
    }

    #[test]
    fn test_dispatch_empty_registry_fails() {
        let registry = PluginRegistry::new();
        let err = registry.resolve("somewhere", Path::new("/tmp/target")).unwrap_err();
        assert!(err.to_string().contains("resolve"), "unexpected error: {err}");
    }

    #[test]
    fn test_dispatch_first_handler_wins() {
        let mut first = mock_plugin("first", PluginKind::Resolver);
        first
            .expect_run()
            .times(1)
            .returning(|_, _| Ok(HookOutcome::Handled(vec!["/src/first".to_string()])));
        let mut second = mock_plugin("second", PluginKind::Resolver);
        second.expect_run().times(0);

        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(first));
        registry.register(Arc::new(second));

        let resolved = registry.resolve("somewhere", Path::new("/tmp/target")).unwrap();
        assert_eq!(resolved, "/src/first");
    }

    #[test]
    fn test_dispatch_continues_past_decline_and_failure() {
        let mut decliner = mock_plugin("decliner", PluginKind::Build);
        decliner.expect_run().times(1).returning(|_, _| Ok(HookOutcome::Declined));
        let mut failer = mock_plugin("failer", PluginKind::Build);
        failer.expect_run().times(1).returning(|_, _| Err(anyhow!("broken")));
        let mut worker = mock_plugin("worker", PluginKind::Build);
        worker.expect_run().times(1).returning(|_, _| Ok(HookOutcome::Handled(Vec::new())));

        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(decliner));
        registry.register(Arc::new(failer));
        registry.register(Arc::new(worker));

        let pkg = package("libfoo", "1.0");
        registry
            .build(&pkg, Path::new("/s"), Path::new("/b"), Path::new("/i"), &[])
            .unwrap();
    }

    #[test]
    fn test_dispatch_skips_unsupported_kinds() {
        let mut resolver = mock_plugin("resolver", PluginKind::Resolver);
        resolver.expect_run().times(0);

        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(resolver));

        let pkg = package("libfoo", "1.0");
        let err = registry
            .build(&pkg, Path::new("/s"), Path::new("/b"), Path::new("/i"), &[])
            .unwrap_err();
        assert!(err.to_string().contains("build"));
    }

    #[test]
    fn test_build_system_pins_named_plugin() {
        let mut cmake = mock_plugin("cmake", PluginKind::Build);
        cmake
            .expect_run()
            .with(eq(Hook::Build), mockall::predicate::always())
            .times(1)
            .returning(|_, _| Ok(HookOutcome::Handled(Vec::new())));
        let mut autotools = mock_plugin("autotools", PluginKind::Build);
        autotools.expect_run().times(0);

        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(autotools));
        registry.register(Arc::new(cmake));

        let mut pkg = package("libfoo", "1.0");
        pkg.build_system = vec!["cmake".to_string()];
        registry
            .build(&pkg, Path::new("/s"), Path::new("/b"), Path::new("/i"), &[])
            .unwrap();
    }

    #[test]
    fn test_build_system_unknown_plugin_fails() {
        let registry = PluginRegistry::new();
        let mut pkg = package("libfoo", "1.0");
        pkg.build_system = vec!["ninja".to_string()];
        let err = registry
            .build(&pkg, Path::new("/s"), Path::new("/b"), Path::new("/i"), &[])
            .unwrap_err();
        assert!(err.to_string().contains("ninja"));
    }

    #[test]
    fn test_build_args_include_paths_and_env() {
        let mut builder = mock_plugin("builder", PluginKind::Build);
        builder
            .expect_run()
            .withf(|hook, args| {
                *hook == Hook::Build
                    && args
                        == [
                            "libfoo",
                            "1.0",
                            "/s",
                            "/b",
                            "/i",
                            "",
                            "PATH=/roots/bin",
                        ]
            })
            .times(1)
            .returning(|_, _| Ok(HookOutcome::Handled(Vec::new())));

        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(builder));

        let pkg = package("libfoo", "1.0");
        let env = vec!["PATH=/roots/bin".to_string()];
        registry
            .build(&pkg, Path::new("/s"), Path::new("/b"), Path::new("/i"), &env)
            .unwrap();
    }

    #[test]
    fn test_package_name_override_per_plugin() {
        let mut apt = mock_plugin("apt", PluginKind::Dependency);
        apt.expect_run()
            .withf(|hook, args| *hook == Hook::Add && args[0] == "app-dev")
            .times(1)
            .returning(|_, _| Ok(HookOutcome::Handled(Vec::new())));

        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(apt));

        let pkg: Package = serde_json::from_value(serde_json::json!({
            "name": "app",
            "version": "1.0",
            "apt": { "name": "app-dev" }
        }))
        .unwrap();
        registry.add(&pkg, Path::new("/roots")).unwrap();
    }

    #[test]
    fn test_resolve_without_returned_value_fails() {
        let mut resolver = mock_plugin("resolver", PluginKind::Resolver);
        resolver.expect_run().times(1).returning(|_, _| Ok(HookOutcome::Handled(Vec::new())));

        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(resolver));

        assert!(registry.resolve("somewhere", Path::new("/t")).is_err());
    }
}
