#![allow(dead_code)]

pub mod http_client {
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::time::Duration;

    /// A parsed HTTP/1.1 response.
    #[derive(Debug, Clone)]
    pub struct RawResponse {
        pub status: u16,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl RawResponse {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        pub fn header_all(&self, name: &str) -> Vec<&str> {
            self.headers
                .iter()
                .filter(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
                .collect()
        }

        pub fn text(&self) -> String {
            String::from_utf8_lossy(&self.body).to_string()
        }

        pub fn json(&self) -> serde_json::Value {
            serde_json::from_slice(&self.body).unwrap()
        }
    }

    /// Send one request and read exactly one response.
    pub fn send(
        addr: SocketAddr,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: &str,
    ) -> RawResponse {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut req = format!(
            "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\
             Content-Length: {}\r\n",
            body.len()
        );
        for (name, value) in headers {
            req.push_str(&format!("{name}: {value}\r\n"));
        }
        req.push_str("\r\n");
        req.push_str(body);
        stream.write_all(req.as_bytes()).unwrap();
        read_response(&mut stream)
    }

    /// A connection whose response is read as it arrives.
    pub struct OpenResponse {
        stream: TcpStream,
        received: Vec<u8>,
        closed: bool,
    }

    impl OpenResponse {
        /// Everything received so far, chunk framing included.
        pub fn text(&self) -> String {
            String::from_utf8_lossy(&self.received).to_string()
        }

        /// Read until `needle` has arrived; `false` on timeout or EOF.
        pub fn read_until(&mut self, needle: &str, timeout: Duration) -> bool {
            let deadline = std::time::Instant::now() + timeout;
            let mut tmp = [0u8; 4096];
            while find(&self.received, needle.as_bytes()).is_none() {
                if self.closed || std::time::Instant::now() >= deadline {
                    return false;
                }
                match self.stream.read(&mut tmp) {
                    Ok(0) => self.closed = true,
                    Ok(n) => self.received.extend_from_slice(&tmp[..n]),
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => panic!("read error: {e:?}"),
                }
            }
            true
        }
    }

    /// Send a JSON POST and return without waiting for the response.
    pub fn open_post_json(addr: SocketAddr, path: &str, body: &serde_json::Value) -> OpenResponse {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let body = body.to_string();
        let req = format!(
            "POST {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\
             Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(req.as_bytes()).unwrap();
        OpenResponse {
            stream,
            received: Vec::new(),
            closed: false,
        }
    }

    pub fn get(addr: SocketAddr, path: &str, headers: &[(&str, &str)]) -> RawResponse {
        send(addr, "GET", path, headers, "")
    }

    pub fn post_json(addr: SocketAddr, path: &str, body: &serde_json::Value) -> RawResponse {
        send(
            addr,
            "POST",
            path,
            &[("Content-Type", "application/json")],
            &body.to_string(),
        )
    }

    fn read_response(stream: &mut TcpStream) -> RawResponse {
        let mut buf = Vec::new();
        let header_end = loop {
            if let Some(pos) = find(&buf, b"\r\n\r\n") {
                break pos;
            }
            if !fill(stream, &mut buf) {
                panic!("connection closed before headers: {:?}", String::from_utf8_lossy(&buf));
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.split("\r\n");
        let status = lines
            .next()
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|s| s.parse().ok())
            .unwrap();
        let headers: Vec<(String, String)> = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
            .collect();
        let mut rest = buf[header_end + 4..].to_vec();

        let find_header = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };
        let body = if status == 204 || status == 304 {
            Vec::new()
        } else if find_header("transfer-encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
        {
            while find(&rest, b"0\r\n\r\n").is_none() {
                if !fill(stream, &mut rest) {
                    break;
                }
            }
            decode_chunked(&rest)
        } else if let Some(len) =
            find_header("content-length").and_then(|v| v.parse::<usize>().ok())
        {
            while rest.len() < len {
                if !fill(stream, &mut rest) {
                    break;
                }
            }
            rest.truncate(len);
            rest
        } else {
            while fill(stream, &mut rest) {}
            rest
        };
        RawResponse {
            status,
            headers,
            body,
        }
    }

    fn fill(stream: &mut TcpStream, buf: &mut Vec<u8>) -> bool {
        let mut tmp = [0u8; 4096];
        match stream.read(&mut tmp) {
            Ok(0) => false,
            Ok(n) => {
                buf.extend_from_slice(&tmp[..n]);
                true
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                false
            }
            Err(e) => panic!("read error: {e:?}"),
        }
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    /// Decode a complete chunked body.
    pub fn decode_chunked(mut raw: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(line_end) = find(raw, b"\r\n") {
            let size_line = String::from_utf8_lossy(&raw[..line_end]).to_string();
            let size_hex = size_line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_hex, 16).unwrap_or(0);
            raw = &raw[line_end + 2..];
            if size == 0 || raw.len() < size {
                break;
            }
            out.extend_from_slice(&raw[..size]);
            raw = raw.get(size + 2..).unwrap_or(&[]);
        }
        out
    }
}

pub mod test_app {
    use backplane::application::Application;
    use backplane::background::set_progress;
    use backplane::config::AppConfig;
    use backplane::dispatcher::{
        async_callback, callback, no_update, ApiRoute, SimpleCallbackGraph,
    };
    use backplane::error::Error;
    use backplane::ids::StreamId;
    use backplane::sse::StreamCallback;
    use backplane::timing;
    use backplane::{BackendKind, ServerHandle};
    use serde_json::{json, Value};
    use std::path::Path;
    use std::sync::Arc;

    pub const PROGRESS_IDENTITY: &str = "app.progress";
    pub const PROGRESS_DEPENDENCIES: [&str; 1] = ["Input(go.n_clicks)"];

    pub fn config(kind: BackendKind) -> AppConfig {
        AppConfig {
            name: "it".to_string(),
            backend: kind.name().to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            workers: Some(2),
            ..AppConfig::default()
        }
    }

    /// The callback graph shared by the integration tests.
    pub fn graph() -> SimpleCallbackGraph {
        let mut graph = SimpleCallbackGraph::new();
        graph
            .register(
                "greeting.children",
                "greet",
                callback(|args| match args.first().and_then(Value::as_str) {
                    Some("") | None => Ok(no_update()),
                    Some(name) => Ok(json!(format!("Hello, {name}!"))),
                }),
            )
            .unwrap();
        graph
            .register(
                "..left.children...right.children..",
                "split",
                callback(|args| Ok(json!([args[0].clone(), no_update()]))),
            )
            .unwrap();
        graph
            .register(
                "broken.children",
                "broken",
                callback(|_| Err(Error::callback(anyhow::anyhow!("database unavailable")))),
            )
            .unwrap();
        graph
            .register(
                "later.children",
                "later",
                async_callback(|args| async move { Ok(json!(format!("later {}", args[0]))) }),
            )
            .unwrap();
        graph
            .register(
                "timed.children",
                "timed",
                callback(|_| {
                    timing::record("db", Some(4.0), Some("query"))?;
                    Ok(json!("timed"))
                }),
            )
            .unwrap();
        graph
            .register_background(
                "report.children",
                "report",
                callback(|args| {
                    set_progress(json!("halfway"));
                    std::thread::sleep(std::time::Duration::from_millis(50));
                    Ok(json!(format!("report for {}", args[0])))
                }),
            )
            .unwrap();
        graph
    }

    pub fn progress_stream() -> StreamCallback {
        StreamCallback::new(
            PROGRESS_IDENTITY,
            &PROGRESS_DEPENDENCIES,
            &["steps"],
            Arc::new(|args, emitter| {
                let steps = args.get("steps").and_then(Value::as_u64).unwrap_or(0);
                for step in 1..=steps {
                    emitter.emit("bar", json!({"value": step}))?;
                }
                Ok(())
            }),
        )
    }

    pub fn progress_id() -> StreamId {
        StreamId::derive(PROGRESS_IDENTITY, &PROGRESS_DEPENDENCIES)
    }

    pub const TICKER_IDENTITY: &str = "app.ticker";

    /// Async twin of [`progress_stream`].
    pub fn ticker_stream() -> StreamCallback {
        StreamCallback::new_async(
            TICKER_IDENTITY,
            &PROGRESS_DEPENDENCIES,
            &["steps"],
            |args, emitter| async move {
                let steps = args.get("steps").and_then(Value::as_u64).unwrap_or(0);
                for step in 1..=steps {
                    emitter.emit("bar", json!({"value": step})).await?;
                }
                Ok::<(), Error>(())
            },
        )
    }

    pub fn ticker_id() -> StreamId {
        StreamId::derive(TICKER_IDENTITY, &PROGRESS_DEPENDENCIES)
    }

    /// Start the shared application on `kind`, optionally adjusting the
    /// config first.
    pub fn start(kind: BackendKind, adjust: impl FnOnce(&mut AppConfig)) -> ServerHandle {
        start_with_streams(kind, adjust, Vec::new())
    }

    /// Like [`start`] with additional stream callbacks registered.
    pub fn start_with_streams(
        kind: BackendKind,
        adjust: impl FnOnce(&mut AppConfig),
        streams: Vec<StreamCallback>,
    ) -> ServerHandle {
        let mut config = config(kind);
        adjust(&mut config);
        let mut app = Application::new(config, Arc::new(graph())).unwrap();
        app.register_stream(progress_stream()).unwrap();
        app.register_stream(ticker_stream()).unwrap();
        for stream in streams {
            app.register_stream(stream).unwrap();
        }
        app.add_api_route(ApiRoute::sync("/api/add", &["a", "b"], |args| {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!({"sum": a + b}))
        }));
        let handle = app.run().unwrap();
        handle.wait_ready().unwrap();
        handle
    }

    /// Like [`start`] with a component-suite package rooted at `root`.
    pub fn start_with_package(kind: BackendKind, root: &Path) -> ServerHandle {
        let mut app = Application::new(config(kind), Arc::new(graph())).unwrap();
        app.packages_mut()
            .register("widgets", "1.2.0", root, ["dist/widgets.min.js"])
            .unwrap();
        let handle = app.run().unwrap();
        handle.wait_ready().unwrap();
        handle
    }

    /// A dispatch envelope for a single-input callback.
    pub fn envelope(output: &str, input_id: &str, value: Value) -> Value {
        json!({
            "output": output,
            "outputs": {"id": output.split('.').next().unwrap_or(""), "property": "children"},
            "inputs": [{"id": input_id, "property": "value", "value": value}],
            "changedPropIds": [format!("{input_id}.value")],
        })
    }
}
