use super::{check_fingerprint, etag_response, mime_type, IMMUTABLE_CACHE_CONTROL};
use crate::assets::fingerprint::build_fingerprint;
use crate::error::{Error, Result};
use crate::server::{build_response, ActiveRequest, Response};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

/// A package whose resources may be served.
#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub root: PathBuf,
    paths: BTreeSet<String>,
}

impl Package {
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn is_servable(&self, path: &str) -> bool {
        self.paths.contains(path)
    }
}

/// Registry of packages and their servable paths.
///
/// Populated during setup and read-only afterwards; only registered paths
/// can be requested, whatever else the package root contains.
#[derive(Debug, Clone, Default)]
pub struct PackageRegistry {
    packages: HashMap<String, Package>,
}

impl PackageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<I, S>(
        &mut self,
        name: &str,
        version: &str,
        root: impl Into<PathBuf>,
        paths: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.packages.contains_key(name) {
            return Err(Error::Registration(format!(
                "package '{name}' is already registered"
            )));
        }
        let package = Package {
            name: name.to_string(),
            version: version.to_string(),
            root: root.into(),
            paths: paths
                .into_iter()
                .map(|p| p.into().trim_start_matches('/').to_string())
                .collect(),
        };
        debug!(
            package = %name,
            version = %version,
            paths_count = package.paths.len(),
            "Package registered"
        );
        self.packages.insert(name.to_string(), package);
        Ok(())
    }

    /// Add another servable path to a registered package.
    pub fn add_path(&mut self, name: &str, path: &str) -> Result<()> {
        let package = self
            .packages
            .get_mut(name)
            .ok_or_else(|| Error::Registration(format!("package '{name}' is not registered")))?;
        package.paths.insert(path.trim_start_matches('/').to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Package> {
        self.packages.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Check that `path` is a registered path of `package`.
    pub fn validate(&self, package: &str, path: &str) -> Result<&Package> {
        let Some(pkg) = self.packages.get(package) else {
            let mut names: Vec<&str> = self.packages.keys().map(String::as_str).collect();
            names.sort_unstable();
            return Err(Error::InvalidResource(format!(
                "Error loading dependency. \"{package}\" is not a registered library.\n\
                 Registered libraries are:\n{names:?}"
            )));
        };
        if !pkg.is_servable(path) {
            return Err(Error::InvalidResource(format!(
                "Error loading dependency. \"{package}\" is registered but the path \
                 requested is not valid.\n\
                 The path requested: \"{path}\"\n\
                 List of registered paths: {:?}",
                pkg.paths
            )));
        }
        Ok(pkg)
    }

    /// Fingerprinted URL path (relative to the suites prefix) for a resource.
    ///
    /// The hash part is the file's modification time in seconds, so a
    /// changed file gets a new URL.
    pub fn fingerprinted_path(&self, package: &str, path: &str) -> Result<String> {
        let pkg = self.validate(package, path)?;
        let modified = fs::metadata(pkg.root.join(path))
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(format!(
            "{package}/{}",
            build_fingerprint(path, &pkg.version, &modified.to_string())
        ))
    }
}

/// Serve `fingerprinted_path` from `package_name`.
///
/// Fingerprinted requests get the immutable cache header and never a 304;
/// the rest negotiate with a content-hash ETag.
pub fn serve_component_suite(
    registry: &PackageRegistry,
    req: &ActiveRequest,
    package_name: &str,
    fingerprinted_path: &str,
) -> Result<Response> {
    let (path_in_pkg, has_fingerprint) = check_fingerprint(fingerprinted_path);
    let package = registry.validate(package_name, &path_in_pkg)?;
    let file = package.root.join(&path_in_pkg);
    let mimetype = mime_type(Path::new(&path_in_pkg));
    debug!(
        package = %package_name,
        version = %package.version,
        resource = %path_in_pkg,
        location = %file.display(),
        fingerprinted = has_fingerprint,
        "Serving component suite resource"
    );
    let bytes = fs::read(&file).map_err(|e| {
        Error::InvalidResource(format!(
            "Error loading dependency. \"{package_name}\" path \"{path_in_pkg}\" \
             could not be read: {e}"
        ))
    })?;

    if has_fingerprint {
        let mut resp = build_response(bytes, Some(mimetype), None);
        resp.add_header("Cache-Control", IMMUTABLE_CACHE_CONTROL);
        return Ok(resp);
    }
    Ok(etag_response(req, bytes, mimetype))
}
