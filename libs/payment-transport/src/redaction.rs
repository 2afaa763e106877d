//! What a successful response body looks like in the logs.

use std::borrow::Cow;

/// Decides how a response body is rendered in the `info` record emitted after
/// each successful call.
pub trait ResponseLogPolicy: Send + Sync {
    /// Text to log for `body`; `None` suppresses the record entirely.
    fn render<'a>(&self, body: &'a str) -> Option<Cow<'a, str>>;
}

/// Logs the body verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFullBody;

impl ResponseLogPolicy for LogFullBody {
    fn render<'a>(&self, body: &'a str) -> Option<Cow<'a, str>> {
        Some(Cow::Borrowed(body))
    }
}

/// Logs only the body size.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogBodyLength;

impl ResponseLogPolicy for LogBodyLength {
    fn render<'a>(&self, body: &'a str) -> Option<Cow<'a, str>> {
        Some(Cow::Owned(format!("<{} bytes>", body.len())))
    }
}

/// Logs nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuppressBody;

impl ResponseLogPolicy for SuppressBody {
    fn render<'a>(&self, _body: &'a str) -> Option<Cow<'a, str>> {
        None
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn policies_render() {
        let body = "TOKEN=abc&ACK=Success";
        assert_eq!(LogFullBody.render(body).as_deref(), Some(body));
        assert_eq!(LogBodyLength.render(body).as_deref(), Some("<21 bytes>"));
        assert_eq!(SuppressBody.render(body), None);
    }

    #[test]
    fn full_body_does_not_copy() {
        let body = String::from("ACK=Success");
        assert!(matches!(LogFullBody.render(&body), Some(Cow::Borrowed(_))));
    }
}
