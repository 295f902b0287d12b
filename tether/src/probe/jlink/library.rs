//! Loading of the vendor's native probe library.
//!
//! The library is searched in a fixed order and its entry points are resolved by name. A missing
//! entry point is not an error at this level: [`NativeLibrary::resolve`] returns `None` and the
//! caller decides whether the function was optional.

use std::path::{Path, PathBuf};

use libloading::Library;

/// File name of the probe library on this platform.
#[cfg(all(windows, target_pointer_width = "64"))]
pub const LIBRARY_FILE: &str = "JLink_x64.dll";
#[cfg(all(windows, not(target_pointer_width = "64")))]
pub const LIBRARY_FILE: &str = "JLinkARM.dll";
#[cfg(target_os = "macos")]
pub const LIBRARY_FILE: &str = "libjlinkarm.dylib";
#[cfg(not(any(windows, target_os = "macos")))]
pub const LIBRARY_FILE: &str = "libjlinkarm.so";

#[cfg(windows)]
const INSTALL_PATHS: &[&str] = &[
    LIBRARY_FILE,
    r"C:\Program Files\SEGGER\JLink\JLink_x64.dll",
];
#[cfg(target_os = "macos")]
const INSTALL_PATHS: &[&str] = &["/Applications/SEGGER/JLink/libjlinkarm.dylib"];
#[cfg(not(any(windows, target_os = "macos")))]
const INSTALL_PATHS: &[&str] = &["/opt/SEGGER/JLink/libjlinkarm.so"];

/// A failed attempt to load one candidate path.
#[derive(Debug)]
pub struct LoadAttempt {
    pub path: PathBuf,
    pub error: libloading::Error,
}

/// Could not load the native probe library. Tried: {display_attempts(attempts)}
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub struct LoadError {
    pub attempts: Vec<LoadAttempt>,
}

fn display_attempts(attempts: &[LoadAttempt]) -> String {
    if attempts.is_empty() {
        return "no candidate paths".to_string();
    }

    attempts
        .iter()
        .map(|attempt| format!("{} ({})", attempt.path.display(), attempt.error))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A loaded native library.
#[derive(Debug)]
pub struct NativeLibrary {
    path: PathBuf,
    library: Library,
}

impl NativeLibrary {
    /// Loads the first candidate that the platform loader accepts.
    pub fn load(candidates: &[PathBuf]) -> Result<Self, LoadError> {
        let mut attempts = Vec::new();

        for path in candidates {
            tracing::debug!("Trying to load probe library from {}", path.display());

            // SAFETY: Loading runs the library's initialisers. The candidates are vendor libraries
            // picked by the user or the platform install location.
            match unsafe { Library::new(path) } {
                Ok(library) => {
                    tracing::info!("Loaded probe library {}", path.display());
                    return Ok(Self {
                        path: path.clone(),
                        library,
                    });
                }
                Err(error) => {
                    tracing::debug!("Loading {} failed: {}", path.display(), error);
                    attempts.push(LoadAttempt {
                        path: path.clone(),
                        error,
                    });
                }
            }
        }

        Err(LoadError { attempts })
    }

    /// The platform search order: next to the executable, the working directory, then the vendor
    /// install location.
    pub fn default_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            candidates.push(dir.join(LIBRARY_FILE));
        }
        candidates.push(Path::new(".").join(LIBRARY_FILE));
        candidates.extend(INSTALL_PATHS.iter().map(PathBuf::from));

        candidates
    }

    /// Looks up `symbol` and returns it as the function pointer type `T`.
    ///
    /// # Safety
    ///
    /// `T` must match the signature of the exported function, and the returned pointer must not be
    /// called after this library has been unloaded.
    pub unsafe fn resolve<T: Copy>(&self, symbol: &str) -> Option<T> {
        match self.library.get::<T>(symbol.as_bytes()) {
            Ok(function) => Some(*function),
            Err(error) => {
                tracing::debug!("Symbol {symbol} not available: {error}");
                None
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unloads the library.
    pub fn unload(self) -> Result<(), libloading::Error> {
        tracing::debug!("Unloading probe library {}", self.path.display());
        self.library.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_reports_every_attempt() {
        let candidates = vec![
            PathBuf::from("/nonexistent/libtether-missing.so"),
            PathBuf::from("totally_nonexistent_library_xyz123.so"),
        ];

        let error = NativeLibrary::load(&candidates).unwrap_err();

        assert_eq!(error.attempts.len(), 2);
        assert_eq!(error.attempts[0].path, candidates[0]);
        let message = error.to_string();
        assert!(message.starts_with("Could not load the native probe library. Tried: "));
        assert!(message.contains("totally_nonexistent_library_xyz123.so"));
    }

    #[test]
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn resolve_then_unload() {
        let candidates = vec![
            PathBuf::from("/nonexistent/libjlinkarm.so"),
            PathBuf::from("libc.so.6"),
        ];
        let library = NativeLibrary::load(&candidates).unwrap();
        assert_eq!(library.path(), Path::new("libc.so.6"));

        type StrlenFn = unsafe extern "C" fn(*const std::ffi::c_char) -> usize;
        // SAFETY: matches the C prototype of strlen.
        let strlen = unsafe { library.resolve::<StrlenFn>("strlen") }.unwrap();
        // SAFETY: the argument is a NUL terminated string.
        assert_eq!(unsafe { strlen(c"tether".as_ptr()) }, 6);

        // SAFETY: no such export, the type is never used.
        assert!(unsafe { library.resolve::<StrlenFn>("JLINK_Open") }.is_none());

        library.unload().unwrap();
    }

    #[test]
    fn empty_candidate_list() {
        let error = NativeLibrary::load(&[]).unwrap_err();
        assert!(error.to_string().ends_with("no candidate paths"));
    }

    #[test]
    fn default_candidates_end_with_install_location() {
        let candidates = NativeLibrary::default_candidates();

        assert!(candidates.len() >= 2);
        assert_eq!(
            candidates.last().unwrap(),
            &PathBuf::from(*INSTALL_PATHS.last().unwrap())
        );
        assert!(candidates
            .iter()
            .any(|path| path == &Path::new(".").join(LIBRARY_FILE)));
    }
}
