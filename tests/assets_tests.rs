mod common;

use backplane::application::Application;
use backplane::assets::{build_fingerprint, IMMUTABLE_CACHE_CONTROL};
use backplane::BackendKind;
use common::http_client::get;
use common::test_app::{config, graph, start_with_package};
use std::fs;
use std::sync::Arc;

const BUNDLE: &str = "console.log('widgets');";

fn package_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("dist")).unwrap();
    fs::write(dir.path().join("dist/widgets.min.js"), BUNDLE).unwrap();
    fs::write(dir.path().join("dist/private.js"), "secret").unwrap();
    dir
}

#[test]
fn test_fingerprinted_and_plain_requests() {
    let dir = package_dir();
    for kind in BackendKind::ALL {
        let handle = start_with_package(kind, dir.path());
        let addr = handle.addr();
        let fingerprinted = format!(
            "/_backplane-component-suites/widgets/{}",
            build_fingerprint("dist/widgets.min.js", "1.2.0", "1a2b3c")
        );

        let resp = get(addr, &fingerprinted, &[]);
        assert_eq!(resp.status, 200, "{kind}");
        assert_eq!(resp.text(), BUNDLE);
        assert_eq!(resp.header("cache-control"), Some(IMMUTABLE_CACHE_CONTROL));
        assert_eq!(resp.header("content-type"), Some("application/javascript"));

        // Fingerprinted responses never negotiate.
        let again = get(addr, &fingerprinted, &[("If-None-Match", "*")]);
        assert_eq!(again.status, 200, "{kind}");

        let plain = get(addr, "/_backplane-component-suites/widgets/dist/widgets.min.js", &[]);
        assert_eq!(plain.status, 200, "{kind}");
        assert!(plain.header("cache-control").is_none());
        let etag = plain.header("etag").unwrap().to_string();

        let cached = get(
            addr,
            "/_backplane-component-suites/widgets/dist/widgets.min.js",
            &[("If-None-Match", &etag)],
        );
        assert_eq!(cached.status, 304, "{kind}");
        assert!(cached.body.is_empty());

        let unlisted = get(addr, "/_backplane-component-suites/widgets/dist/private.js", &[]);
        assert_eq!(unlisted.status, 404, "{kind}");
        assert!(unlisted.text().contains("private.js"));

        let unknown = get(addr, "/_backplane-component-suites/gadgets/dist/widgets.min.js", &[]);
        assert_eq!(unknown.status, 404, "{kind}");

        handle.stop();
    }
}

#[test]
fn test_static_mount_serves_assets_folder() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("css")).unwrap();
    fs::write(dir.path().join("css/site.css"), "body { margin: 0 }").unwrap();

    for kind in BackendKind::ALL {
        let mut cfg = config(kind);
        cfg.assets.folder = dir.path().to_path_buf();
        let handle = Application::new(cfg, Arc::new(graph())).unwrap().run().unwrap();
        handle.wait_ready().unwrap();
        let addr = handle.addr();

        let resp = get(addr, "/assets/css/site.css", &[]);
        assert_eq!(resp.status, 200, "{kind}");
        assert_eq!(resp.header("content-type"), Some("text/css; charset=utf-8"));
        assert_eq!(resp.text(), "body { margin: 0 }");

        assert_eq!(get(addr, "/assets/css/missing.css", &[]).status, 404, "{kind}");
        assert_eq!(get(addr, "/assets/../Cargo.toml", &[]).status, 404, "{kind}");
        handle.stop();
    }
}
