//! Renderers for the unhandled-exception handler.
//!
//! A renderer turns `(secret, error)` into the plain-text body of a 500
//! response. The secret is the one registered with the handler on the
//! [`Backend`](crate::backend::Backend); what it unlocks is entirely up to
//! the renderer.

use crate::context;
use crate::error::Error;
use minijinja::{context as tpl_context, Environment};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::error::Error as StdError;
use std::sync::Arc;
use tracing::warn;

pub type TracebackRenderer = Arc<dyn Fn(Option<&str>, &Error) -> String + Send + Sync>;

/// Header a client sends to unlock detailed reports from [`secret_gated`].
pub const SECRET_HEADER: &str = "x-backplane-secret";

pub const GENERIC_MESSAGE: &str = "Internal Server Error";

const REPORT_TEMPLATE: &str = "\
{{ kind }}: {{ message }}
{% for cause in causes %}  caused by: {{ cause }}
{% endfor %}{% if request %}
request: {{ request.method }} {{ request.path }}
request id: {{ request.id }}
{% endif %}";

static TEMPLATES: Lazy<Environment<'static>> = Lazy::new(|| {
    let mut env = Environment::new();
    if let Err(e) = env.add_template("report", REPORT_TEMPLATE) {
        warn!(error = %e, "Traceback template failed to compile");
    }
    env
});

/// Detailed plain-text report of `err` and its source chain.
pub fn render_report(err: &Error) -> String {
    let mut causes = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }
    let request = context::current().ok().map(|r| {
        tpl_context! {
            method => r.method().as_str(),
            path => r.path(),
            id => r.id().to_string(),
        }
    });
    let rendered = TEMPLATES.get_template("report").and_then(|t| {
        t.render(tpl_context! {
            kind => err.kind(),
            message => err.to_string(),
            causes => causes,
            request => request,
        })
    });
    match rendered {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Traceback rendering failed");
            format!("{}: {}", err.kind(), err)
        }
    }
}

/// Never shows details.
pub fn generic() -> TracebackRenderer {
    Arc::new(|_secret, _err| GENERIC_MESSAGE.to_string())
}

/// Always shows details. Meant for `debug` runs only.
pub fn detailed() -> TracebackRenderer {
    Arc::new(|_secret, err| render_report(err))
}

/// Compare secrets in time independent of where they differ.
///
/// Both sides are hashed first so lengths leak nothing either.
pub fn secrets_match(expected: &str, given: &str) -> bool {
    let a = Sha256::digest(expected.as_bytes());
    let b = Sha256::digest(given.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Shows details only to requests whose [`SECRET_HEADER`] matches the
/// handler's secret; everyone else gets [`GENERIC_MESSAGE`].
pub fn secret_gated() -> TracebackRenderer {
    Arc::new(|secret, err| {
        let presented = context::current()
            .ok()
            .and_then(|r| r.header(SECRET_HEADER).map(str::to_string));
        match (secret, presented) {
            (Some(expected), Some(given))
                if !expected.is_empty() && secrets_match(expected, &given) =>
            {
                render_report(err)
            }
            _ => GENERIC_MESSAGE.to_string(),
        }
    })
}
