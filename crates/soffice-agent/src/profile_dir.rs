//! Per-instance office user profile directories.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use soffice_process::UnoUrl;

pub const PROFILE_DIR_PREFIX: &str = ".jodconverter_";

/// Directory name is a pure function of the accept string so a restarted
/// instance lands in the same place.
pub fn instance_profile_dir_name(url: &UnoUrl) -> String {
    format!(
        "{PROFILE_DIR_PREFIX}{}",
        url.accept_string().replace(',', "_").replace('=', "-")
    )
}

pub fn instance_profile_dir(work_dir: &Path, url: &UnoUrl) -> PathBuf {
    work_dir.join(instance_profile_dir_name(url))
}

/// A template profile must look like an office user installation.
pub fn is_valid_template(dir: &Path) -> bool {
    dir.join("user").is_dir()
}

/// Replaces whatever is at `instance_dir` with a fresh copy of `template`.
pub fn prepare(instance_dir: &Path, template: Option<&Path>) -> io::Result<()> {
    if instance_dir.exists() {
        tracing::warn!(
            profile_dir = %instance_dir.display(),
            "profile dir already exists; deleting"
        );
        delete(instance_dir);
    }
    if let Some(template) = template {
        copy_dir_recursive(template, instance_dir)?;
    }
    Ok(())
}

/// Best-effort removal. Never fails: an undeletable directory is renamed out
/// of the way so the path is free for the next start.
pub fn delete(instance_dir: &Path) {
    let Err(e) = fs::remove_dir_all(instance_dir) else {
        return;
    };
    if e.kind() == io::ErrorKind::NotFound {
        return;
    }
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    match retire(instance_dir, now_ms) {
        Ok(old) => tracing::warn!(
            error = %e,
            renamed_to = %old.display(),
            "could not delete profile dir; renamed it"
        ),
        Err(rename_err) => tracing::error!(
            error = %e,
            rename_error = %rename_err,
            profile_dir = %instance_dir.display(),
            "could not delete profile dir"
        ),
    }
}

fn retired_name(instance_dir: &Path, now_ms: u128) -> PathBuf {
    let name = instance_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    instance_dir.with_file_name(format!("{name}.old.{now_ms}"))
}

fn retire(instance_dir: &Path, now_ms: u128) -> io::Result<PathBuf> {
    let old = retired_name(instance_dir, now_ms);
    fs::rename(instance_dir, &old)?;
    Ok(old)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
            continue;
        }
        if file_type.is_file() {
            fs::copy(&src_path, &dst_path)?;
            continue;
        }
        if file_type.is_symlink() {
            let target_meta = fs::metadata(&src_path)?;
            if target_meta.is_dir() {
                copy_dir_recursive(&src_path, &dst_path)?;
            } else {
                fs::copy(&src_path, &dst_path)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_endpoint_dir_name() {
        let url = UnoUrl::socket(2002);
        assert_eq!(
            instance_profile_dir_name(&url),
            ".jodconverter_socket_host-127.0.0.1_port-2002"
        );
    }

    #[test]
    fn dir_names_are_stable_and_distinct() {
        let urls = [
            UnoUrl::socket(2002),
            UnoUrl::socket(2003),
            UnoUrl::socket_on("10.0.0.5", 2002),
            UnoUrl::pipe("office_0"),
            UnoUrl::pipe("office_1"),
        ];
        let names: Vec<String> = urls.iter().map(instance_profile_dir_name).collect();
        for (i, a) in names.iter().enumerate() {
            assert_eq!(a, &instance_profile_dir_name(&urls[i]));
            for b in &names[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(names[3], ".jodconverter_pipe_name-office_0");
    }

    #[test]
    fn prepare_replaces_existing_dir_with_template_copy() {
        let root = tempfile::tempdir().unwrap();
        let template = root.path().join("template");
        std::fs::create_dir_all(template.join("user").join("config")).unwrap();
        std::fs::write(template.join("user").join("registrymodifications.xcu"), b"<x/>").unwrap();

        let instance = instance_profile_dir(root.path(), &UnoUrl::socket(2002));
        std::fs::create_dir_all(&instance).unwrap();
        std::fs::write(instance.join("stale.lock"), b"1").unwrap();

        prepare(&instance, Some(&template)).unwrap();

        assert!(!instance.join("stale.lock").exists());
        assert!(instance.join("user").join("config").is_dir());
        assert_eq!(
            std::fs::read(instance.join("user").join("registrymodifications.xcu")).unwrap(),
            b"<x/>"
        );
        assert!(is_valid_template(&template));
        assert!(!is_valid_template(&instance.join("user")));
    }

    #[test]
    fn prepare_without_template_leaves_no_dir() {
        let root = tempfile::tempdir().unwrap();
        let instance = instance_profile_dir(root.path(), &UnoUrl::pipe("p"));
        std::fs::create_dir_all(&instance).unwrap();
        prepare(&instance, None).unwrap();
        assert!(!instance.exists());
    }

    #[test]
    fn prepare_fails_for_missing_template() {
        let root = tempfile::tempdir().unwrap();
        let instance = instance_profile_dir(root.path(), &UnoUrl::pipe("p"));
        let err = prepare(&instance, Some(&root.path().join("nope"))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn retire_renames_to_timestamped_sibling() {
        let root = tempfile::tempdir().unwrap();
        let instance = instance_profile_dir(root.path(), &UnoUrl::socket(2002));
        std::fs::create_dir_all(&instance).unwrap();

        let old = retire(&instance, 1_700_000_000_123).unwrap();
        assert!(!instance.exists());
        assert!(old.is_dir());
        assert_eq!(
            old.file_name().unwrap().to_string_lossy(),
            ".jodconverter_socket_host-127.0.0.1_port-2002.old.1700000000123"
        );
    }

    #[test]
    fn delete_missing_dir_is_a_no_op() {
        let root = tempfile::tempdir().unwrap();
        delete(&root.path().join("missing"));
    }

    #[cfg(unix)]
    #[test]
    fn delete_leaves_either_nothing_or_one_renamed_sibling() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let instance = instance_profile_dir(root.path(), &UnoUrl::socket(2002));
        let locked = instance.join("locked");
        std::fs::create_dir_all(&locked).unwrap();
        std::fs::write(locked.join("file"), b"x").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        delete(&instance);

        let siblings: Vec<String> = std::fs::read_dir(root.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(!instance.exists());
        let renamed: Vec<&String> = siblings
            .iter()
            .filter(|n| n.starts_with(".jodconverter_socket_host-127.0.0.1_port-2002.old."))
            .collect();
        // Root ignores the permission bits, in which case the delete succeeds.
        assert!(renamed.len() <= 1, "{siblings:?}");
        assert_eq!(siblings.len(), renamed.len(), "{siblings:?}");

        for name in renamed {
            let dir = root.path().join(name).join("locked");
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }
}
