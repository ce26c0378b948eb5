use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;
use indexmap::IndexMap;
use lifecycle_archive::Platform;

use crate::{EnvError, RootDirEnv};

/// Maps the name of a subdirectory of a layer to the variables it is added
/// to.
pub type RootDirMap = IndexMap<String, Vec<String>>;

/// Variables that are meaningful to the lifecycle itself and are never
/// passed on to launched processes.
pub const LAUNCH_EXCLUDED_VARS: &[&str] = &["CNB_APP_DIR", "CNB_LAYERS_DIR", "CNB_PROCESS_TYPE"];

fn root_dir_map(entries: &[(&str, &[&str])]) -> RootDirMap {
    entries
        .iter()
        .map(|(dir, vars)| {
            (
                (*dir).to_owned(),
                vars.iter().map(|var| (*var).to_owned()).collect(),
            )
        })
        .collect()
}

/// The search paths of a build on a POSIX system.
pub fn posix_build_env() -> RootDirMap {
    root_dir_map(&[
        ("bin", &["PATH"]),
        ("lib", &["LD_LIBRARY_PATH", "LIBRARY_PATH"]),
        ("include", &["CPATH"]),
        ("pkgconfig", &["PKG_CONFIG_PATH"]),
    ])
}

/// The search paths of a launched process on a POSIX system.
pub fn posix_launch_env() -> RootDirMap {
    root_dir_map(&[("bin", &["PATH"]), ("lib", &["LD_LIBRARY_PATH"])])
}

/// The search paths of builds and launched processes on Windows.
pub fn windows_env() -> RootDirMap {
    root_dir_map(&[("bin", &["PATH"])])
}

/// A set of environment variables and the rules to extend it with layer
/// directories.
#[derive(Debug, Clone)]
pub struct Env {
    platform: Platform,
    root_dir_map: RootDirMap,
    vars: BTreeMap<String, String>,
}

impl Env {
    /// The environment of a build step, starting from `vars` which are
    /// `KEY=VALUE` pairs.
    pub fn build<I, S>(vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::build_for(Platform::current(), vars)
    }

    /// The environment of a launched process, starting from `vars` which
    /// are `KEY=VALUE` pairs. The lifecycle's own variables are removed.
    pub fn launch<I, S>(vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::launch_for(Platform::current(), vars)
    }

    /// Like [`Env::build`] but for an explicit platform.
    pub fn build_for<I, S>(platform: Platform, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let root_dir_map = match platform {
            Platform::Posix => posix_build_env(),
            Platform::Windows => windows_env(),
        };
        Self::from_vars(platform, root_dir_map, vars, &[])
    }

    /// Like [`Env::launch`] but for an explicit platform.
    pub fn launch_for<I, S>(platform: Platform, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let root_dir_map = match platform {
            Platform::Posix => posix_launch_env(),
            Platform::Windows => windows_env(),
        };
        Self::from_vars(platform, root_dir_map, vars, LAUNCH_EXCLUDED_VARS)
    }

    fn from_vars<I, S>(
        platform: Platform,
        root_dir_map: RootDirMap,
        vars: I,
        excluded: &[&str],
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut env = Self {
            platform,
            root_dir_map,
            vars: BTreeMap::new(),
        };
        for var in vars {
            let var = var.as_ref();
            let Some((key, value)) = var.split_once('=') else {
                tracing::debug!("ignoring malformed variable {var:?}");
                continue;
            };
            // Windows keeps per-drive working directories in keys like `=C:`.
            if key.is_empty() {
                continue;
            }
            let key = env.key(key);
            if excluded.contains(&key.as_str()) {
                continue;
            }
            env.vars.insert(key, value.to_owned());
        }
        env
    }

    /// The platform whose conventions apply to keys and path lists.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// The directories that [`RootDirEnv::add_root_dir`] looks for.
    pub fn root_dir_map(&self) -> &RootDirMap {
        &self.root_dir_map
    }

    /// Returns the value of a variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(&self.key(key)).map(String::as_str)
    }

    /// Sets a variable, replacing any previous value.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let key = self.key(key);
        self.vars.insert(key, value.into());
    }

    /// Returns all variables as `KEY=VALUE` pairs sorted by key.
    pub fn list(&self) -> Vec<String> {
        self.vars
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }

    /// Iterates over all variables sorted by key.
    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.vars
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Applies the variable files in `dir`.
    ///
    /// The name of each file is the variable name optionally followed by an
    /// action:
    ///
    /// * `NAME` or `NAME.override`: set the variable to the file contents.
    /// * `NAME.default`: set the variable unless it already has a value.
    /// * `NAME.prepend` / `NAME.append`: add the file contents before or
    ///   after the current value, separated by the contents of `NAME.delim`.
    ///
    /// A missing directory contributes nothing.
    pub fn add_env_dir(&mut self, dir: &Path) -> Result<(), EnvError> {
        let io_error = |path: &Path, source: io::Error| EnvError::Io {
            path: path.to_path_buf(),
            source,
        };

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_error(dir, err)),
        };
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| io_error(dir, err))?.path();
            if fs::metadata(&path).map_err(|err| io_error(&path, err))?.is_file() {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                tracing::warn!("ignoring variable file with a non UTF-8 name {}", path.display());
                continue;
            };
            let (name, action) = match file_name.split_once('.') {
                Some((name, action)) => (name, action),
                None => (file_name, "override"),
            };

            match action {
                "override" => {
                    let value = fs::read_to_string(&path).map_err(|err| io_error(&path, err))?;
                    self.set(name, value);
                }
                "default" => {
                    if self.get(name).is_some_and(|value| !value.is_empty()) {
                        continue;
                    }
                    let value = fs::read_to_string(&path).map_err(|err| io_error(&path, err))?;
                    self.set(name, value);
                }
                "prepend" | "append" => {
                    let value = fs::read_to_string(&path).map_err(|err| io_error(&path, err))?;
                    let delimiter = read_delimiter(dir, name).map_err(|err| io_error(dir, err))?;
                    let combined = match self.get(name).filter(|current| !current.is_empty()) {
                        None => value,
                        Some(current) if action == "prepend" => {
                            format!("{value}{delimiter}{current}")
                        }
                        Some(current) => format!("{current}{delimiter}{value}"),
                    };
                    self.set(name, combined);
                }
                "delim" => {}
                _ => {
                    tracing::debug!("ignoring {} with unknown action {action:?}", path.display());
                }
            }
        }

        Ok(())
    }

    /// Adds `path` in front of the current value of `key`.
    fn prepend_path(&mut self, key: &str, path: &Path) {
        let path = path.to_string_lossy();
        let value = match self.get(key).filter(|current| !current.is_empty()) {
            Some(current) => format!("{path}{}{current}", self.path_list_separator()),
            None => path.into_owned(),
        };
        self.set(key, value);
    }

    fn path_list_separator(&self) -> char {
        match self.platform {
            Platform::Posix => ':',
            Platform::Windows => ';',
        }
    }

    /// Variable names are case insensitive on Windows.
    fn key(&self, key: &str) -> String {
        match self.platform {
            Platform::Posix => key.to_owned(),
            Platform::Windows => key.to_uppercase(),
        }
    }
}

impl RootDirEnv for Env {
    fn add_root_dir(&mut self, dir: &Path) -> Result<(), EnvError> {
        let dir = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|source| EnvError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?
                .join(dir)
        };

        let mut additions: Vec<(String, PathBuf)> = Vec::new();
        for (subdir, vars) in &self.root_dir_map {
            let path = dir.join(subdir);
            match fs::metadata(&path) {
                Ok(metadata) if metadata.is_dir() => {
                    additions.extend(vars.iter().map(|var| (var.clone(), path.clone())));
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(EnvError::Io { path, source }),
            }
        }

        for (var, path) in additions {
            tracing::debug!("adding {} to {var}", path.display());
            self.prepend_path(&var, &path);
        }
        Ok(())
    }
}

/// Reads the delimiter for `name` from `NAME.delim`, empty if there is none.
fn read_delimiter(dir: &Path, name: &str) -> io::Result<String> {
    match fs::read_to_string(dir.join(format!("{name}.delim"))) {
        Ok(delimiter) => Ok(delimiter),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    #[test]
    fn test_launch_env_excludes_lifecycle_vars() {
        let env = Env::launch_for(
            Platform::Posix,
            [
                "CNB_APP_DIR=excluded",
                "CNB_LAYERS_DIR=excluded",
                "CNB_PROCESS_TYPE=excluded",
                "CNB_FOO=not-excluded",
            ],
        );
        assert_eq!(env.list(), vec!["CNB_FOO=not-excluded"]);
    }

    #[test]
    fn test_build_env_keeps_lifecycle_vars() {
        let env = Env::build_for(Platform::Posix, ["CNB_APP_DIR=/workspace"]);
        assert_eq!(env.get("CNB_APP_DIR"), Some("/workspace"));
    }

    #[test]
    fn test_values_may_contain_equals() {
        let env = Env::launch_for(Platform::Posix, ["CNB_FOO=some=key"]);
        assert_eq!(env.list(), vec!["CNB_FOO=some=key"]);
    }

    #[test]
    fn test_malformed_vars_are_ignored() {
        let env = Env::build_for(Platform::Windows, ["=C:=C:\\", "NOVALUE", "A=b"]);
        assert_eq!(env.list(), vec!["A=b"]);
    }

    #[test]
    fn test_windows_keys_ignore_case() {
        let env = Env::build_for(Platform::Windows, ["Path=some-path"]);
        assert_eq!(env.list(), vec!["PATH=some-path"]);
        assert_eq!(env.get("path"), Some("some-path"));

        let env = Env::launch_for(Platform::Windows, ["cnb_app_dir=excluded"]);
        assert!(env.list().is_empty());
    }

    #[test]
    fn test_root_dir_maps() {
        assert_eq!(
            Env::launch_for(Platform::Posix, [""; 0]).root_dir_map(),
            &posix_launch_env()
        );
        assert_eq!(
            Env::build_for(Platform::Posix, [""; 0]).root_dir_map(),
            &posix_build_env()
        );
        assert_eq!(
            Env::build_for(Platform::Windows, [""; 0]).root_dir_map(),
            &windows_env()
        );
    }

    #[test]
    fn test_add_root_dir_prepends_existing_subdirectories() {
        let layer = tempfile::tempdir().unwrap();
        std::fs::create_dir(layer.path().join("bin")).unwrap();
        std::fs::create_dir(layer.path().join("lib")).unwrap();
        std::fs::write(layer.path().join("include"), "not a directory").unwrap();

        let mut env = Env::build_for(Platform::Posix, ["PATH=/usr/bin:/bin"]);
        env.add_root_dir(layer.path()).unwrap();

        let bin = layer.path().join("bin");
        let lib = layer.path().join("lib");
        assert_eq!(
            env.get("PATH"),
            Some(format!("{}:/usr/bin:/bin", bin.display()).as_str())
        );
        assert_eq!(env.get("LD_LIBRARY_PATH"), Some(&*lib.to_string_lossy()));
        assert_eq!(env.get("LIBRARY_PATH"), Some(&*lib.to_string_lossy()));
        assert_eq!(env.get("CPATH"), None);
        assert_eq!(env.get("PKG_CONFIG_PATH"), None);
    }

    #[test]
    fn test_add_root_dir_uses_platform_separator() {
        let layer = tempfile::tempdir().unwrap();
        std::fs::create_dir(layer.path().join("bin")).unwrap();
        std::fs::create_dir(layer.path().join("lib")).unwrap();

        let mut env = Env::launch_for(Platform::Windows, ["Path=C:\\Windows"]);
        env.add_root_dir(layer.path()).unwrap();

        let bin = layer.path().join("bin");
        assert_eq!(
            env.list(),
            vec![format!("PATH={};C:\\Windows", bin.display())]
        );
    }

    #[test]
    fn test_add_root_dir_later_dirs_take_precedence() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::create_dir(first.path().join("bin")).unwrap();
        std::fs::create_dir(second.path().join("bin")).unwrap();

        let mut env = Env::launch_for(Platform::Posix, [""; 0]);
        env.add_root_dir(first.path()).unwrap();
        env.add_root_dir(second.path()).unwrap();

        assert_eq!(
            env.get("PATH"),
            Some(
                format!(
                    "{}:{}",
                    second.path().join("bin").display(),
                    first.path().join("bin").display()
                )
                .as_str()
            )
        );
    }

    #[rstest]
    #[case::no_suffix("VAR", None, "VAR=value")]
    #[case::override_existing("VAR.override", Some("old"), "VAR=value")]
    #[case::default_unset("VAR.default", None, "VAR=value")]
    #[case::default_set("VAR.default", Some("old"), "VAR=old")]
    #[case::prepend_unset("VAR.prepend", None, "VAR=value")]
    #[case::prepend("VAR.prepend", Some("old"), "VAR=value:old")]
    #[case::append("VAR.append", Some("old"), "VAR=old:value")]
    fn test_add_env_dir_actions(
        #[case] file_name: &str,
        #[case] existing: Option<&str>,
        #[case] expected: &str,
    ) {
        let env_dir = tempfile::tempdir().unwrap();
        std::fs::write(env_dir.path().join(file_name), "value").unwrap();
        std::fs::write(env_dir.path().join("VAR.delim"), ":").unwrap();

        let mut env = Env::build_for(Platform::Posix, existing.map(|value| format!("VAR={value}")));
        env.add_env_dir(env_dir.path()).unwrap();

        assert_eq!(env.list(), vec![expected]);
    }

    #[test]
    fn test_add_env_dir_without_delimiter() {
        let env_dir = tempfile::tempdir().unwrap();
        std::fs::write(env_dir.path().join("VAR.append"), "b").unwrap();

        let mut env = Env::build_for(Platform::Posix, ["VAR=a"]);
        env.add_env_dir(env_dir.path()).unwrap();

        assert_eq!(env.get("VAR"), Some("ab"));
    }

    #[test]
    fn test_add_env_dir_ignores_subdirectories_and_missing_dirs() {
        let env_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(env_dir.path().join("NESTED")).unwrap();

        let mut env = Env::build_for(Platform::Posix, [""; 0]);
        env.add_env_dir(env_dir.path()).unwrap();
        env.add_env_dir(&env_dir.path().join("missing")).unwrap();

        assert!(env.list().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_env_file_is_an_error() {
        let env_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(env_dir.path().join("VAR.override")).unwrap();
        let broken = env_dir.path().join("BROKEN");
        std::os::unix::fs::symlink(env_dir.path().join("missing"), &broken).unwrap();

        let mut env = Env::build_for(Platform::Posix, [""; 0]);
        assert_matches!(
            env.add_env_dir(env_dir.path()),
            Err(EnvError::Io { path, .. }) if path == broken
        );
    }
}
