//! The environment-population stages: clearing, environment directories, and
//! environment files. Applied after the lock stage and before descriptor
//! shaping, so the launched program sees the final environment.

use anyhow::{bail, Context as _, Result};
use std::{
    env,
    ffi::OsString,
    fs,
    os::unix::ffi::OsStringExt as _,
    path::Path,
};

/// Remove every variable from the environment.
pub fn clear() {
    for (name, _) in env::vars_os() {
        env::remove_var(&name);
    }
}

/// Populate the environment from a directory of files: each regular file
/// whose name neither starts with a dot nor contains `=` names a variable.
/// An empty file unsets the variable; otherwise the cleaned contents become
/// the value.
pub fn apply_env_dir(dir: &Path) -> Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("unable to open environment directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry
            .with_context(|| format!("unable to read environment directory {}", dir.display()))?;
        let name = entry.file_name();
        match name.to_str() {
            Some(name) if name.starts_with('.') || name.contains('=') => continue,
            _ => {}
        }
        let path = entry.path();
        let metadata = fs::metadata(&path)
            .with_context(|| format!("unable to read {}", path.display()))?;
        if !metadata.is_file() {
            continue;
        }
        let contents =
            fs::read(&path).with_context(|| format!("unable to read {}", path.display()))?;
        if contents.is_empty() {
            env::remove_var(&name);
        } else {
            let value = clean_value(&contents)
                .with_context(|| format!("bad value in {}", path.display()))?;
            env::set_var(&name, value);
        }
    }
    Ok(())
}

/// Populate the environment from a file of KEY=VALUE lines. Lines without an
/// assignment are ignored; an empty value unsets the variable.
pub fn apply_env_file(file: &Path) -> Result<()> {
    let contents = fs::read_to_string(file)
        .with_context(|| format!("unable to open environment file {}", file.display()))?;
    for line in contents.lines() {
        let line = line.trim_ascii();
        if line.contains('\0') {
            bail!("NUL byte in environment file {}", file.display());
        }
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        if value.is_empty() {
            env::remove_var(name);
        } else {
            env::set_var(name, value);
        }
    }
    Ok(())
}

/// Strip surrounding whitespace and turn interior NUL bytes into newlines,
/// the convention for multi-line values in single-line files.
fn clean_value(raw: &[u8]) -> Result<OsString> {
    let stripped = raw.trim_ascii();
    if stripped.contains(&b'=') {
        bail!("'=' in value");
    }
    let bytes = stripped
        .iter()
        .map(|&byte| if byte == 0 { b'\n' } else { byte })
        .collect::<Vec<_>>();
    Ok(OsString::from_vec(bytes))
}
