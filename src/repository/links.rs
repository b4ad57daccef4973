//! Linking installed trees into the shared repository namespaces.
//!
//! After a package is staged into its install directory, every file in that
//! tree is exposed by creating a symlink at the mirrored location under the
//! repository root. Unlinking removes exactly the symlinks that point back
//! into the install tree, leaving everything else alone.

use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::runtime::{is_path_under, Runtime};

use super::Repository;

impl<R: Runtime> Repository<'_, R> {
    /// Mirror `install_dir` under the repository root as symlinks.
    /// Relinking over an existing symlink replaces it, so linking is
    /// idempotent.
    pub fn link_directory(&self, install_dir: &Path) -> Result<()> {
        if !self.runtime.is_dir(install_dir) {
            bail!("[{}] does not exist", install_dir.display());
        }
        self.link_tree(install_dir, install_dir)
    }

    fn link_tree(&self, dir: &Path, install_root: &Path) -> Result<()> {
        for entry in self.runtime.read_dir(dir)? {
            let relative = entry
                .strip_prefix(install_root)
                .with_context(|| format!("[{}] is outside the install tree", entry.display()))?;
            let target = self.root().join(relative);

            if self.runtime.is_dir(&entry) && !self.runtime.is_symlink(&entry) {
                if !self.runtime.exists(&target) {
                    self.runtime.create_dir_all(&target)?;
                } else if !self.runtime.is_dir(&target) {
                    bail!("[{}] exists and is not a directory", target.display());
                }
                self.link_tree(&entry, install_root)?;
                continue;
            }

            if self.runtime.is_symlink(&target) {
                self.runtime.remove_symlink(&target)?;
            } else if self.runtime.exists(&target) {
                bail!("[{}] exists and is not a link", target.display());
            }
            log::trace!("linking [{}]", target.display());
            self.runtime.symlink(&entry, &target)?;
        }
        Ok(())
    }

    /// Remove the symlinks a previous [`link_directory`] of `install_dir`
    /// created. A tree that was never linked, or that no longer exists, is a
    /// successful no-op.
    ///
    /// [`link_directory`]: Repository::link_directory
    pub fn unlink_directory(&self, install_dir: &Path) -> Result<()> {
        if !self.runtime.is_dir(install_dir) {
            return Ok(());
        }
        self.unlink_tree(install_dir, install_dir)
    }

    fn unlink_tree(&self, dir: &Path, install_root: &Path) -> Result<()> {
        for entry in self.runtime.read_dir(dir)? {
            let relative = entry
                .strip_prefix(install_root)
                .with_context(|| format!("[{}] is outside the install tree", entry.display()))?;
            let target = self.root().join(relative);

            if self.runtime.is_dir(&entry) && !self.runtime.is_symlink(&entry) {
                self.unlink_tree(&entry, install_root)?;
                continue;
            }

            if !self.runtime.is_symlink(&target) {
                if self.runtime.exists(&target) {
                    log::warn!("not removing [{}], it is not a link", target.display());
                }
                continue;
            }
            // only remove links that point back into this install tree
            let destination = self.runtime.read_link(&target)?;
            if !is_path_under(&destination, install_root) {
                log::debug!("leaving [{}], it points elsewhere", target.display());
                continue;
            }
            log::trace!("unlinking [{}]", target.display());
            self.runtime.remove_symlink(&target)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::repository::LOCAL_DIR_NAME;
    use crate::runtime::RealRuntime;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        repo: Repository<'static, RealRuntime>,
    }

    fn fixture() -> Fixture {
        static RUNTIME: RealRuntime = RealRuntime;
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::with_root(&RUNTIME, dir.path().join(LOCAL_DIR_NAME));
        repo.validate(&Options { assume_defaults: true, ..Options::default() }).unwrap();
        Fixture { _dir: dir, repo }
    }

    fn stage_install(repo: &Repository<'_, RealRuntime>, name: &str) -> std::path::PathBuf {
        let install = repo.install_path(name);
        fs::create_dir_all(install.join("bin")).unwrap();
        fs::create_dir_all(install.join("lib")).unwrap();
        fs::write(install.join("bin").join(name), "#!/bin/sh\n").unwrap();
        fs::write(install.join("lib").join(format!("{name}.so")), "").unwrap();
        install
    }

    #[test]
    fn test_link_directory_mirrors_tree() {
        let f = fixture();
        let install = stage_install(&f.repo, "libfoo");
        f.repo.link_directory(&install).unwrap();

        let bin_link = f.repo.bin_path().join("libfoo");
        let lib_link = f.repo.lib_path().join("libfoo.so");
        assert!(bin_link.is_symlink());
        assert!(lib_link.is_symlink());
        assert_eq!(fs::read_link(&bin_link).unwrap(), install.join("bin/libfoo"));
    }

    #[test]
    fn test_link_directory_is_idempotent() {
        let f = fixture();
        let install = stage_install(&f.repo, "libfoo");
        f.repo.link_directory(&install).unwrap();
        f.repo.link_directory(&install).unwrap();
        assert!(f.repo.bin_path().join("libfoo").is_symlink());
    }

    #[test]
    fn test_link_directory_missing_source_fails() {
        let f = fixture();
        assert!(f.repo.link_directory(&f.repo.install_path("ghost")).is_err());
    }

    #[test]
    fn test_link_directory_refuses_to_clobber_real_file() {
        let f = fixture();
        let install = stage_install(&f.repo, "libfoo");
        fs::write(f.repo.bin_path().join("libfoo"), "real file").unwrap();
        assert!(f.repo.link_directory(&install).is_err());
    }

    #[test]
    fn test_unlink_directory_removes_only_own_links() {
        let f = fixture();
        let foo = stage_install(&f.repo, "libfoo");
        let bar = stage_install(&f.repo, "libbar");
        f.repo.link_directory(&foo).unwrap();
        f.repo.link_directory(&bar).unwrap();

        f.repo.unlink_directory(&foo).unwrap();
        assert!(!f.repo.bin_path().join("libfoo").exists());
        assert!(f.repo.bin_path().join("libbar").is_symlink());
    }

    #[test]
    fn test_unlink_directory_never_linked_is_noop() {
        let f = fixture();
        let install = stage_install(&f.repo, "libfoo");
        f.repo.unlink_directory(&install).unwrap();
        f.repo.unlink_directory(&f.repo.install_path("ghost")).unwrap();
    }

    #[test]
    fn test_unlink_directory_is_idempotent() {
        let f = fixture();
        let install = stage_install(&f.repo, "libfoo");
        f.repo.link_directory(&install).unwrap();
        f.repo.unlink_directory(&install).unwrap();
        f.repo.unlink_directory(&install).unwrap();
    }

    #[test]
    fn test_unlink_leaves_foreign_links() {
        let f = fixture();
        let install = stage_install(&f.repo, "libfoo");
        f.repo.link_directory(&install).unwrap();

        // a link at a mirrored path pointing somewhere else entirely
        let foreign = f.repo.lib_path().join("libfoo.so");
        fs::remove_file(&foreign).unwrap();
        std::os::unix::fs::symlink("/somewhere/else", &foreign).unwrap();

        f.repo.unlink_directory(&install).unwrap();
        assert!(foreign.is_symlink());
        assert!(!f.repo.bin_path().join("libfoo").exists());
    }
}
