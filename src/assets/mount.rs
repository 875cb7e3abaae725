use super::{etag_response, mime_type};
use crate::error::{Error, Result};
use crate::server::{ActiveRequest, Response};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// A directory served under a URL prefix.
#[derive(Debug, Clone)]
pub struct StaticMount {
    base_dir: PathBuf,
}

impl StaticMount {
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        Self {
            base_dir: base.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Map a URL path below the mount to a file path, refusing anything
    /// that would leave the base directory.
    fn map_path(&self, url_path: &str) -> Option<PathBuf> {
        let mut pb = self.base_dir.clone();
        for comp in Path::new(url_path.trim_start_matches('/')).components() {
            match comp {
                Component::Normal(s) => pb.push(s),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(pb)
    }

    /// Read a file below the mount.
    pub fn load(&self, url_path: &str) -> Result<(Vec<u8>, &'static str)> {
        let path = self
            .map_path(url_path)
            .ok_or_else(|| Error::NotFound(url_path.to_string()))?;
        if !path.is_file() {
            return Err(Error::NotFound(url_path.to_string()));
        }
        let bytes = fs::read(&path)?;
        Ok((bytes, mime_type(&path)))
    }

    /// Serve a file with ETag negotiation.
    pub fn serve(&self, req: &ActiveRequest, url_path: &str) -> Result<Response> {
        let (bytes, mimetype) = self.load(url_path)?;
        debug!(
            base_dir = %self.base_dir.display(),
            path = %url_path,
            size_bytes = bytes.len(),
            "Serving static file"
        );
        Ok(etag_response(req, bytes, mimetype))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn test_map_path_prevents_traversal() {
        let sf = StaticMount::new("/srv/static");
        assert!(sf.map_path("../Cargo.toml").is_none());
        assert!(sf.map_path("a/../../Cargo.toml").is_none());
        assert_eq!(
            sf.map_path("./css/site.css"),
            Some(PathBuf::from("/srv/static/css/site.css"))
        );
    }

    #[test]
    fn test_load_and_serve() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), "Hello\n").unwrap();
        let sf = StaticMount::new(dir.path());

        let (bytes, ct) = sf.load("hello.txt").unwrap();
        assert_eq!(ct, "text/plain");
        assert_eq!(bytes, b"Hello\n");

        let req = ActiveRequest::builder(Method::GET, "/assets/hello.txt").build();
        let resp = sf.serve(&req, "hello.txt").unwrap();
        assert_eq!(resp.status, 200);
        assert!(resp.header("etag").is_some());

        assert!(matches!(sf.load("missing.txt"), Err(Error::NotFound(_))));
        assert!(matches!(sf.load("../escape"), Err(Error::NotFound(_))));
    }
}
