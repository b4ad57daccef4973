//! Build and run environment derived from the repository layout.
//!
//! Compiler and linker search paths for the repository's shared trees are
//! layered ahead of whatever the operator's environment already carries, so
//! freshly linked packages win over system copies.

use crate::repository::Repository;
use crate::runtime::Runtime;

#[cfg(target_os = "macos")]
pub const LD_PATH_VAR: &str = "DYLD_LIBRARY_PATH";
#[cfg(not(target_os = "macos"))]
pub const LD_PATH_VAR: &str = "LD_LIBRARY_PATH";

/// The augmented variable set for building and running packages in `repo`.
pub fn build_vars<R: Runtime>(repo: &Repository<'_, R>) -> Vec<(String, String)> {
    let runtime = repo.runtime();
    let inherited = |key: &str| runtime.env_var(key).unwrap_or_default();

    let include_flag = format!("-I{}", repo.include_path().display());
    let lib_flag = format!("-L{}", repo.lib_path().display());

    vec![
        ("CPPFLAGS".to_string(), prepend_flag(&include_flag, &inherited("CPPFLAGS"))),
        ("CXXFLAGS".to_string(), prepend_flag(&include_flag, &inherited("CXXFLAGS"))),
        ("LDFLAGS".to_string(), prepend_flag(&lib_flag, &inherited("LDFLAGS"))),
        (
            "PATH".to_string(),
            prepend_path(&repo.bin_path().display().to_string(), &inherited("PATH")),
        ),
        (
            LD_PATH_VAR.to_string(),
            prepend_path(&repo.lib_path().display().to_string(), &inherited(LD_PATH_VAR)),
        ),
    ]
}

/// The same set rendered as `KEY=VALUE` lines, for handing to plugins or
/// printing to the operator.
pub fn build_env_lines<R: Runtime>(repo: &Repository<'_, R>) -> Vec<String> {
    build_vars(repo).into_iter().map(|(key, value)| format!("{key}={value}")).collect()
}

fn prepend_flag(flag: &str, existing: &str) -> String {
    if existing.is_empty() {
        flag.to_string()
    } else {
        format!("{flag} {existing}")
    }
}

fn prepend_path(dir: &str, existing: &str) -> String {
    if existing.is_empty() {
        dir.to_string()
    } else {
        format!("{dir}:{existing}")
    }
}
