
/// One server-push event.
///
/// Serialized as a `data:` line followed by optional `event:`, `id:` and
/// `retry:` lines and a blank line. Multi-line payloads get one `data:`
/// line per line so that the receiver rebuilds them with `\n` joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPushEvent {
    pub data: String,
    pub event: Option<String>,
    pub id: Option<u64>,
    pub retry_ms: Option<u64>,
}

impl ServerPushEvent {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            event: None,
            id: None,
            retry_ms: None,
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry_ms = Some(retry_ms);
        self
    }

    /// Wire form of the event.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + 32);
        for (i, line) in self.data.split('\n').enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str("data: ");
            out.push_str(line);
        }
        if let Some(event) = &self.event {
            out.push_str(&format!("\nevent: {event}"));
        }
        if let Some(id) = self.id {
            out.push_str(&format!("\nid: {id}"));
        }
        if let Some(retry) = self.retry_ms {
            out.push_str(&format!("\nretry: {retry}"));
        }
        out.push_str("\n\n");
        out
    }

    /// Parse a `text/event-stream` body back into events.
    ///
    /// Comment lines and unknown fields are ignored; an event without any
    /// `data:` line is dropped, as a browser would.
    pub fn parse_stream(text: &str) -> Vec<ServerPushEvent> {
        let mut events = Vec::new();
        for block in text.split("\n\n") {
            let mut data: Option<String> = None;
            let mut event = ServerPushEvent::new("");
            for line in block.lines() {
                let (field, value) = match line.split_once(':') {
                    Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                    None => (line, ""),
                };
                match field {
                    "data" => match data.as_mut() {
                        Some(d) => {
                            d.push('\n');
                            d.push_str(value);
                        }
                        None => data = Some(value.to_string()),
                    },
                    "event" => event.event = Some(value.to_string()),
                    "id" => event.id = value.parse().ok(),
                    "retry" => event.retry_ms = value.parse().ok(),
                    _ => {}
                }
            }
            if let Some(d) = data {
                event.data = d;
                events.push(event);
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_field_order() {
        let ev = ServerPushEvent::new("hello")
            .with_retry(500)
            .with_id(3)
            .with_event("update");
        assert_eq!(
            ev.encode(),
            "data: hello\nevent: update\nid: 3\nretry: 500\n\n"
        );
        assert_eq!(ServerPushEvent::new("x").encode(), "data: x\n\n");
    }

    #[test]
    fn test_multiline_data() {
        let ev = ServerPushEvent::new("a\nb");
        assert_eq!(ev.encode(), "data: a\ndata: b\n\n");
        assert_eq!(ServerPushEvent::parse_stream(&ev.encode()), vec![ev]);
    }

    #[test]
    fn test_parse_stream() {
        let body = ": comment\n\ndata: one\nid: 1\n\ndata: two\nevent: e\n\n";
        let events = ServerPushEvent::parse_stream(body);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "one");
        assert_eq!(events[0].id, Some(1));
        assert_eq!(events[1].event.as_deref(), Some("e"));
    }
}
