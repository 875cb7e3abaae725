//! Fingerprinted file names.
//!
//! A fingerprinted resource carries its package version and a content hash
//! as an extra dot-separated part of the file name:
//!
//! ```text
//! dash_table/bundle.v5_2_0m1694412371.min.js  ->  dash_table/bundle.min.js
//!                   ^^^^^^^^^^^^^^^^^^^^^
//! ```
//!
//! The token is `v<version>m<hash>` where `<version>` matches `[\w-]+` and
//! `<hash>` is hexadecimal.

use once_cell::sync::Lazy;
use regex::Regex;

#[allow(clippy::expect_used)]
static VERSION_CLEAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w-]").expect("version pattern compiles"));

#[allow(clippy::expect_used)]
static FINGERPRINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^v[\w-]+m[0-9a-fA-F]+$").expect("fingerprint pattern compiles"));

/// Insert the fingerprint token into `path`.
///
/// The token goes after the first dot of the file name, so
/// `a/b.min.js` becomes `a/b.v<version>m<hash>.min.js`.
pub fn build_fingerprint(path: &str, version: &str, hash_value: &str) -> String {
    let (dir, file) = match path.rsplit_once('/') {
        Some((d, f)) => (Some(d), f),
        None => (None, path),
    };
    let (stem, extension) = match file.split_once('.') {
        Some((s, e)) => (s, Some(e)),
        None => (file, None),
    };
    let version = VERSION_CLEAN.replace_all(version, "_");
    let mut out = String::with_capacity(path.len() + version.len() + hash_value.len() + 4);
    if let Some(d) = dir {
        out.push_str(d);
        out.push('/');
    }
    out.push_str(stem);
    out.push_str(".v");
    out.push_str(&version);
    out.push('m');
    out.push_str(hash_value);
    if let Some(ext) = extension {
        out.push('.');
        out.push_str(ext);
    }
    out
}

/// Strip a valid fingerprint from `path`.
///
/// Returns the original path and whether a valid fingerprint was found. A
/// file name with fewer than three dot-separated parts, or whose second
/// part is not a valid token, is returned unchanged.
pub fn check_fingerprint(path: &str) -> (String, bool) {
    let (dir, file) = match path.rsplit_once('/') {
        Some((d, f)) => (Some(d), f),
        None => (None, path),
    };
    let parts: Vec<&str> = file.split('.').collect();
    if parts.len() > 2 && FINGERPRINT.is_match(parts[1]) {
        let mut original = String::with_capacity(path.len());
        if let Some(d) = dir {
            original.push_str(d);
            original.push('/');
        }
        original.push_str(parts[0]);
        for part in &parts[2..] {
            original.push('.');
            original.push_str(part);
        }
        return (original, true);
    }
    (path.to_string(), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_fingerprint() {
        assert_eq!(
            build_fingerprint("dash_table/bundle.min.js", "5.2.0", "1694412371"),
            "dash_table/bundle.v5_2_0m1694412371.min.js"
        );
        assert_eq!(
            build_fingerprint("plain.js", "1.0.0-rc.1", "abc"),
            "plain.v1_0_0-rc_1mabc.js"
        );
    }

    #[test]
    fn test_check_fingerprint_strips_valid_token() {
        let (path, ok) = check_fingerprint("dash_table/bundle.v5_2_0m1694412371.min.js");
        assert!(ok);
        assert_eq!(path, "dash_table/bundle.min.js");
    }

    #[test]
    fn test_check_fingerprint_leaves_others() {
        assert_eq!(
            check_fingerprint("dash_table/bundle.min.js"),
            ("dash_table/bundle.min.js".to_string(), false)
        );
        assert_eq!(check_fingerprint("bundle.js"), ("bundle.js".to_string(), false));
        // Not hex after the `m`.
        assert_eq!(
            check_fingerprint("bundle.v1mxyz.js"),
            ("bundle.v1mxyz.js".to_string(), false)
        );
    }

    #[test]
    fn test_build_then_check_recovers_path() {
        let original = "deep/dir/component.min.js";
        let built = build_fingerprint(original, "2.14.1", "deadbeef");
        assert_eq!(check_fingerprint(&built), (original.to_string(), true));
    }
}
