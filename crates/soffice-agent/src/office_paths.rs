use std::{
    ffi::{OsStr, OsString},
    io,
    path::{Path, PathBuf},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Mac,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Mac
        } else {
            Platform::Linux
        }
    }

    /// Whether the launcher needs URE/basis directories appended to PATH.
    pub fn needs_runtime_path(&self) -> bool {
        matches!(self, Platform::Windows)
    }
}

pub fn office_executable(office_home: &Path, platform: Platform) -> PathBuf {
    match platform {
        Platform::Mac => office_home.join("MacOS").join("soffice"),
        Platform::Linux | Platform::Windows => office_home.join("program").join("soffice.bin"),
    }
}

fn default_home_candidates(platform: Platform) -> Vec<PathBuf> {
    match platform {
        Platform::Mac => vec![
            PathBuf::from("/Applications/LibreOffice.app/Contents"),
            PathBuf::from("/Applications/OpenOffice.org.app/Contents"),
        ],
        Platform::Windows => {
            let mut out = Vec::new();
            for var in ["ProgramFiles", "ProgramFiles(x86)"] {
                let Some(base) = std::env::var_os(var) else {
                    continue;
                };
                let base = PathBuf::from(base);
                for name in ["LibreOffice", "LibreOffice 4", "LibreOffice 3", "OpenOffice.org 3"] {
                    out.push(base.join(name));
                }
            }
            out
        }
        Platform::Linux => {
            let mut out = vec![PathBuf::from("/opt/libreoffice")];
            // Versioned installs from the upstream tarballs, newest first.
            if let Ok(rd) = std::fs::read_dir("/opt") {
                let mut versioned: Vec<PathBuf> = rd
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| {
                        p.file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n.starts_with("libreoffice") && n != "libreoffice")
                    })
                    .collect();
                versioned.sort();
                versioned.reverse();
                out.extend(versioned);
            }
            out.extend([
                PathBuf::from("/usr/lib/libreoffice"),
                PathBuf::from("/usr/lib64/libreoffice"),
                PathBuf::from("/usr/lib/openoffice"),
                PathBuf::from("/opt/openoffice.org3"),
            ]);
            out
        }
    }
}

/// First default install location that contains a launcher.
pub fn default_office_home(platform: Platform) -> Option<PathBuf> {
    default_home_candidates(platform)
        .into_iter()
        .find(|home| office_executable(home, platform).is_file())
}

/// Runtime library directories some office layouts need on PATH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub ure_bin: PathBuf,
    pub basis_program: Option<PathBuf>,
}

fn read_link_file(path: &Path) -> io::Result<String> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

/// Follows the `basis-link` / `ure-link` pointer files under the office home.
///
/// Returns `Ok(None)` for layouts that have neither pointer file.
pub fn runtime_paths(office_home: &Path) -> io::Result<Option<RuntimePaths>> {
    let basis_link = office_home.join("basis-link");
    if basis_link.is_file() {
        let basis_home = office_home.join(read_link_file(&basis_link)?);
        let ure_home = basis_home.join(read_link_file(&basis_home.join("ure-link"))?);
        return Ok(Some(RuntimePaths {
            ure_bin: ure_home.join("bin"),
            basis_program: Some(basis_home.join("program")),
        }));
    }

    let ure_link = office_home.join("ure-link");
    if ure_link.is_file() {
        return Ok(Some(RuntimePaths {
            ure_bin: office_home.join(read_link_file(&ure_link)?).join("bin"),
            basis_program: None,
        }));
    }

    Ok(None)
}

/// Finds the PATH variable in `vars`, ignoring case as Windows does.
pub fn path_var<I>(vars: I) -> (OsString, Option<OsString>)
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut found = (OsString::from("PATH"), None);
    for (k, v) in vars {
        if k.to_string_lossy().eq_ignore_ascii_case("PATH") {
            found = (k, Some(v));
        }
    }
    found
}

/// Appends the runtime directories to an existing `;`-separated PATH value.
pub fn augmented_path(current: Option<&OsStr>, paths: &RuntimePaths) -> OsString {
    let mut out = OsString::new();
    if let Some(cur) = current.filter(|c| !c.is_empty()) {
        out.push(cur);
        out.push(";");
    }
    out.push(absolute(&paths.ure_bin));
    if let Some(basis) = &paths.basis_program {
        out.push(";");
        out.push(absolute(basis));
    }
    out
}

fn absolute(p: &Path) -> PathBuf {
    std::path::absolute(p).unwrap_or_else(|_| p.to_path_buf())
}
