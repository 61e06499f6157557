//! Locates ONNX Runtime and the GPU libraries it depends on before the first
//! session is created.

use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";
/// Extra directory searched ahead of the built-in candidates.
pub const ENV_LIB_DIR: &str = "TILEFUSE_LIB_DIR";

/// What [`setup_runtime_libs`] found and loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibReport {
    pub searched: Vec<PathBuf>,
    /// `None` when `ORT_DYLIB_PATH` was already set or nothing was found.
    pub ort_dylib: Option<PathBuf>,
    pub preloaded: Vec<PathBuf>,
}

/// Probes, in order:
///   1. `$TILEFUSE_LIB_DIR`
///   2. `<exe_dir>/` (Windows only)
///   3. `<exe_dir>/lib/`
///   4. `<exe_dir>/../lib/`
///   5. `<cwd>/lib/`
///   6. `/usr/local/lib/` and `/usr/lib/` (Unix only)
fn candidate_lib_dirs(override_dir: Option<PathBuf>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = override_dir {
        dirs.push(dir);
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Preload tier by lowercase file-name prefix: CUDA runtime first, then
/// cuDNN, then TensorRT. ORT provider libraries are not listed: they
/// resolve symbols from `libonnxruntime`, which the `ort` crate loads later.
#[cfg(unix)]
const PRELOAD_TIERS: &[(&str, u8)] = &[
    ("libcudart", 0),
    ("libcublas", 0),
    ("libcufft", 0),
    ("libcurand", 0),
    ("libcudnn", 1),
    ("libnvinfer", 2),
    ("libnvonnxparser", 2),
];
#[cfg(windows)]
const PRELOAD_TIERS: &[(&str, u8)] = &[
    ("cudart64_", 0),
    ("cublas64_", 0),
    ("cublaslt64_", 0),
    ("cudnn64_", 1),
    ("nvinfer", 2),
    ("nvonnxparser", 2),
];

fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    PRELOAD_TIERS
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map(|&(_, tier)| tier)
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// Libraries to preload, sorted by (tier, file name). The first directory
/// holding a given file name wins.
fn collect_preload_libs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    use std::collections::HashSet;

    let mut seen_names: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

            if !is_candidate_lib(&name, &path) {
                continue;
            }
            let Some(priority) = load_priority(&name) else {
                continue;
            };
            if seen_names.insert(name.clone()) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Point ORT at a bundled runtime and preload CUDA, cuDNN and TensorRT.
///
/// glibc reads `LD_LIBRARY_PATH` once at startup, so libraries are opened by
/// absolute path with `RTLD_GLOBAL` instead, lowest tier first so each
/// library finds its dependencies already resident. Must run before the
/// first ORT call.
pub fn setup_runtime_libs() -> RuntimeLibReport {
    let dirs = candidate_lib_dirs(env::var_os(ENV_LIB_DIR).map(PathBuf::from));
    let mut report = RuntimeLibReport::default();

    if env::var_os(ORT_DYLIB_ENV).is_none() {
        if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
            env::set_var(ORT_DYLIB_ENV, &path);
            report.ort_dylib = Some(path);
        }
    }

    for lib in collect_preload_libs(&dirs) {
        if unsafe { load_library(&lib) } {
            report.preloaded.push(lib);
        }
    }

    report.searched = dirs;
    report
}

/// Call once tracing is initialized.
pub fn log_runtime_lib_status(report: &RuntimeLibReport) {
    match env::var(ORT_DYLIB_ENV) {
        Ok(ort) if Path::new(&ort).is_file() => info!("ORT library: {ort}"),
        Ok(ort) => warn!("{ORT_DYLIB_ENV} set to {ort} but file not found"),
        Err(_) => warn!(
            searched = report.searched.len(),
            "{ORT_DYLIB_ENV} not set, ORT will try default search paths"
        ),
    }
    for lib in &report.preloaded {
        debug!(lib = %lib.display(), "Preloaded runtime library");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn candidate_lib_dirs_contains_system_paths() {
        let dirs = candidate_lib_dirs(None);
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn candidate_lib_dirs_includes_cwd_lib() {
        let dirs = candidate_lib_dirs(None);
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("lib")));
        }
    }

    #[test]
    fn override_dir_is_searched_first() {
        let dirs = candidate_lib_dirs(Some(PathBuf::from("/opt/tilefuse/lib")));
        assert_eq!(dirs.first(), Some(&PathBuf::from("/opt/tilefuse/lib")));
    }

    #[test]
    fn find_ort_dylib_prefers_first_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("mkdir first");
        std::fs::create_dir_all(&second).expect("mkdir second");
        std::fs::write(second.join(ORT_LIB_NAME), b"ort").expect("write second");

        let dirs = [first.clone(), second.clone()];
        assert_eq!(find_ort_dylib_in_dirs(&dirs), Some(second.join(ORT_LIB_NAME)));

        std::fs::write(first.join(ORT_LIB_NAME), b"ort").expect("write first");
        assert_eq!(find_ort_dylib_in_dirs(&dirs), Some(first.join(ORT_LIB_NAME)));
    }

    #[cfg(unix)]
    #[test]
    fn load_priority_orders_cuda_before_cudnn_before_trt() {
        assert!(load_priority("libcudart.so.12") < load_priority("libcudnn.so.9"));
        assert!(load_priority("libcublasLt.so.12") < load_priority("libcudnn_ops.so.9"));
        assert!(load_priority("libcudnn.so.9") < load_priority("libnvinfer.so.10"));
    }

    #[cfg(unix)]
    #[test]
    fn load_priority_excludes_ort_and_unknown_libs() {
        assert_eq!(load_priority("libonnxruntime.so.1.23.2"), None);
        assert_eq!(load_priority("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(load_priority("libpng16.so.16"), None);
    }

    #[cfg(unix)]
    #[test]
    fn collect_preload_libs_sorts_and_dedupes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("mkdir first");
        std::fs::create_dir_all(&second).expect("mkdir second");
        for name in ["libnvinfer.so.10", "libcudnn.so.9", "libonnxruntime.so"] {
            std::fs::write(first.join(name), b"").expect("write lib");
        }
        for name in ["libcudart.so.12", "libcudnn.so.9"] {
            std::fs::write(second.join(name), b"").expect("write lib");
        }

        let libs = collect_preload_libs(&[first.clone(), second.clone()]);
        assert_eq!(
            libs,
            vec![
                second.join("libcudart.so.12"),
                first.join("libcudnn.so.9"),
                first.join("libnvinfer.so.10"),
            ]
        );
    }

    #[cfg(windows)]
    #[test]
    fn load_priority_orders_cuda_before_cudnn_before_trt() {
        assert!(load_priority("cudart64_12.dll") < load_priority("cudnn64_9.dll"));
        assert!(load_priority("cudnn64_9.dll") < load_priority("nvinfer.dll"));
        assert_eq!(load_priority("onnxruntime.dll"), None);
    }
}
