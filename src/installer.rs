//! Installer (component E). Generalizes the teacher's
//! `install_packages_parallel`/`download_and_extract_package` into spec.md
//! §4.E's bounded-parallel-batches-of-4 shape, cache-hit skip, bin-stub writing
//! (rather than the teacher's real symlinks, per spec.md's cross-platform
//! rationale), and lockfile emission matching spec.md §3's schema.

use crate::cache::PackageCache;
use crate::resolver::ResolvedPackage;
use crate::tar_extract;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use sha2::{Digest, Sha512};
use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const MAX_CONCURRENT_INSTALLS: usize = 4;
const CACHE_MAX_AGE: Duration = Duration::from_secs(60 * 60 * 24 * 7);

#[derive(Debug, Serialize)]
pub struct LockfilePackage {
    pub version: String,
    pub resolved: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub requires: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct Lockfile {
    #[serde(rename = "lockfileVersion")]
    pub lockfile_version: u8,
    pub dependencies: BTreeMap<String, LockfilePackage>,
}

fn package_dest(node_modules: &Path, name: &str) -> PathBuf {
    if let Some((scope, pkg)) = name.split_once('/') {
        node_modules.join(scope).join(pkg)
    } else {
        node_modules.join(name)
    }
}

fn verify_integrity_sha512(data: &[u8], integrity: &str) -> bool {
    let Some(encoded) = integrity.strip_prefix("sha512-") else {
        return false;
    };
    let Ok(expected) = STANDARD.decode(encoded) else {
        return false;
    };
    let mut hasher = Sha512::new();
    hasher.update(data);
    hasher.finalize().as_slice() == expected.as_slice()
}

fn verify_tarball(package: &ResolvedPackage, data: &[u8]) -> Result<(), String> {
    if let Some(integrity) = package.integrity.as_deref() {
        if !verify_integrity_sha512(data, integrity) {
            return Err(format!(
                "integrity verification failed for {}@{}",
                package.name, package.version
            ));
        }
        return Ok(());
    }
    if let Some(shasum) = package.shasum.as_deref()
        && !PackageCache::verify_sha1_checksum(data, shasum)
    {
        return Err(format!(
            "checksum verification failed for {}@{}",
            package.name, package.version
        ));
    }
    Ok(())
}

/// Writes a bin stub: a small host-executable file whose body is a
/// require-target the script runner (component G) resolves at invocation time.
/// Platforms that forbid symlinks still honor these (spec.md §4.E).
fn write_bin_stub(bin_dir: &Path, bin_name: &str, target: &Path) -> Result<(), Box<dyn Error + Send + Sync>> {
    fs::create_dir_all(bin_dir)?;
    let stub_path = bin_dir.join(bin_name);
    let body = format!("#!/usr/bin/env node\n{}\n", target.display());
    fs::write(&stub_path, body)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&stub_path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&stub_path, perms)?;
    }

    Ok(())
}

fn installed_version_matches(dest: &Path, expected_version: &str) -> bool {
    let package_json = dest.join("package.json");
    let Ok(data) = fs::read_to_string(&package_json) else {
        return false;
    };
    let Ok(json) = serde_json::from_str::<serde_json::Value>(&data) else {
        return false;
    };
    json.get("version").and_then(|v| v.as_str()) == Some(expected_version)
}

async fn install_one(
    client: Arc<reqwest::Client>,
    package: ResolvedPackage,
    project_dir: PathBuf,
    cancel: CancellationToken,
) -> Result<bool, Box<dyn Error + Send + Sync>> {
    let node_modules = project_dir.join("node_modules");
    let dest = package_dest(&node_modules, &package.name);
    let version_string = package.version.to_string();

    if installed_version_matches(&dest, &version_string) {
        return Ok(false);
    }

    if cancel.is_cancelled() {
        return Ok(false);
    }

    let cache = PackageCache::new()?;
    let bytes = match cache.get_valid_tarball(
        &package.name,
        &version_string,
        package.shasum.as_deref(),
        CACHE_MAX_AGE,
    )? {
        Some(cached) if verify_tarball(&package, &cached).is_ok() => cached,
        _ => {
            cache.invalidate_tarball(&package.name, &version_string)?;
            let response = client.get(&package.tarball_url).send().await?;
            let downloaded = response.bytes().await?.to_vec();
            verify_tarball(&package, &downloaded).map_err(|e| -> Box<dyn Error + Send + Sync> { e.into() })?;
            if let Err(e) = cache.save_tarball(&package.name, &version_string, &downloaded) {
                tracing::warn!(package = %package.name, error = %e, "failed to cache tarball");
            }
            downloaded
        }
    };

    if dest.exists() {
        fs::remove_dir_all(&dest)?;
    }
    fs::create_dir_all(&dest)?;
    tar_extract::extract_gz_tarball(&bytes, &dest)?;

    if !package.bin.is_empty() {
        let bin_dir = node_modules.join(".bin");
        for (bin_name, rel_path) in &package.bin {
            let target = dest.join(rel_path);
            write_bin_stub(&bin_dir, bin_name, &target)?;
        }
    }

    Ok(true)
}

/// Installs a resolved dependency map in bounded-parallel batches of 4,
/// checking the cancellation token at each batch boundary (spec.md §4.E/§5).
pub async fn install_resolved(
    resolved: &std::collections::HashMap<String, ResolvedPackage>,
    project_dir: &Path,
    cancel: CancellationToken,
) -> Result<usize, Box<dyn Error + Send + Sync>> {
    fs::create_dir_all(project_dir.join("node_modules"))?;
    fs::create_dir_all(project_dir.join("node_modules").join(".bin"))?;

    let client = Arc::new(reqwest::Client::new());
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_INSTALLS));
    let mut handles = Vec::new();

    for package in resolved.values() {
        if cancel.is_cancelled() {
            break;
        }
        let semaphore = Arc::clone(&semaphore);
        let client = Arc::clone(&client);
        let package = package.clone();
        let project_dir = project_dir.to_path_buf();
        let cancel = cancel.clone();

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.unwrap();
            install_one(client, package, project_dir, cancel).await
        }));
    }

    let mut installed = 0usize;
    for handle in handles {
        match handle.await? {
            Ok(true) => installed += 1,
            Ok(false) => {}
            Err(err) => tracing::warn!(error = %err, "package install failed"),
        }
    }

    Ok(installed)
}

pub fn write_lockfile(
    resolved: &std::collections::HashMap<String, ResolvedPackage>,
    project_dir: &Path,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut dependencies = BTreeMap::new();
    for package in resolved.values() {
        dependencies.insert(
            package.name.clone(),
            LockfilePackage {
                version: package.version.to_string(),
                resolved: package.tarball_url.clone(),
                integrity: package.integrity.clone(),
                requires: package.dependencies.clone().into_iter().collect(),
            },
        );
    }

    let lockfile = Lockfile {
        lockfile_version: 1,
        dependencies,
    };

    let serialized = serde_json::to_string_pretty(&lockfile)?;
    fs::write(project_dir.join("package-lock.json"), serialized)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semver::Version;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn fake_package(name: &str) -> ResolvedPackage {
        ResolvedPackage {
            name: name.to_string(),
            version: Version::parse("1.0.0").unwrap(),
            tarball_url: "https://example.test/pkg.tgz".to_string(),
            integrity: None,
            shasum: None,
            dependencies: HashMap::new(),
            bin: HashMap::new(),
        }
    }

    #[test]
    fn package_dest_handles_scoped_names() {
        let node_modules = Path::new("node_modules");
        assert_eq!(
            package_dest(node_modules, "@scope/pkg"),
            Path::new("node_modules/@scope/pkg")
        );
        assert_eq!(package_dest(node_modules, "left-pad"), Path::new("node_modules/left-pad"));
    }

    #[test]
    fn lockfile_round_trips_version() {
        let dir = tempdir().unwrap();
        let mut resolved = HashMap::new();
        resolved.insert("left-pad".to_string(), fake_package("left-pad"));
        write_lockfile(&resolved, dir.path()).unwrap();

        let data = fs::read_to_string(dir.path().join("package-lock.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(
            json["dependencies"]["left-pad"]["version"].as_str().unwrap(),
            "1.0.0"
        );
    }
}
