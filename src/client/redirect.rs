//! Follow-up requests for redirect responses.
//!
//! 307 and 308 repeat the request as is. 301, 302 and 303 turn anything but
//! GET and HEAD into a bodiless GET, the way browsers do.

use crate::error::RequestError;
use crate::http::request::{Method, Request};
use crate::http::response::StatusCode;

/// How a redirect status rewrites the original request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectPolicy {
    /// Same method, same body.
    Preserve,
    /// GET without a body.
    DowngradeToGet,
}

impl RedirectPolicy {
    pub fn for_status(status: StatusCode, method: Method) -> Self {
        match status.as_u16() {
            301..=303 if !matches!(method, Method::GET | Method::HEAD) => {
                RedirectPolicy::DowngradeToGet
            }
            _ => RedirectPolicy::Preserve,
        }
    }
}

/// Builds the request that follows `location` after `request` got `status`.
///
/// `request` must carry its endpoint; a relative `location` resolves against
/// it. The result is normalized.
pub fn follow(
    request: &Request,
    status: StatusCode,
    location: &str,
) -> Result<Request, RequestError> {
    let base = request
        .url()
        .ok_or_else(|| RequestError::InvalidLocation(location.to_string()))?;
    let target = base
        .join(location.trim())
        .map_err(|_| RequestError::InvalidLocation(location.to_string()))?;

    let mut next = Request {
        method: request.method,
        path: target.to_string(),
        headers: request.headers.clone(),
        tracking: request.tracking.clone(),
        ..Request::default()
    };
    // Host follows the new target.
    next.headers.remove("Host");

    match RedirectPolicy::for_status(status, request.method) {
        RedirectPolicy::Preserve => {
            next.body = request.body.clone();
            next.data = request.data.clone();
            next.fargs = request.fargs.clone();
        }
        RedirectPolicy::DowngradeToGet => {
            next.method = Method::GET;
            next.headers.remove("Content-Type");
        }
    }

    next.normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::{RequestBuilder, Scheme};

    fn origin(method: Method) -> Request {
        RequestBuilder::new()
            .method(method)
            .path("/echo?name=fame")
            .header("Content-Type", "text/plain")
            .body(b"payload".to_vec())
            .host("127.0.0.1")
            .port(6101)
            .scheme(Scheme::Http)
            .build()
            .unwrap()
    }

    #[test]
    fn temporary_redirect_keeps_method_and_body() {
        let next = follow(
            &origin(Method::POST),
            StatusCode(307),
            "http://localhost:6101/redirect?name=fame",
        )
        .unwrap();
        assert_eq!(next.method, Method::POST);
        assert_eq!(next.body, b"payload");
        assert_eq!(next.host.as_deref(), Some("localhost"));
        assert_eq!(next.port, Some(6101));
        assert_eq!(next.path, "/redirect");
        assert_eq!(next.qargs.get("name"), Some("fame"));
    }

    #[test]
    fn see_other_downgrades_post_to_get() {
        let next = follow(&origin(Method::POST), StatusCode(303), "/done").unwrap();
        assert_eq!(next.method, Method::GET);
        assert!(next.body.is_empty());
        assert!(next.header("Content-Type").is_none());
        assert_eq!(next.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(next.path, "/done");
        assert!(next.qargs.is_empty());
    }

    #[test]
    fn found_keeps_get() {
        let mut request = origin(Method::GET);
        request.body.clear();
        let next = follow(&request, StatusCode(302), "other").unwrap();
        assert_eq!(next.method, Method::GET);
        assert_eq!(next.path, "/other");
    }

    #[test]
    fn unparseable_location_is_rejected() {
        let result = follow(&origin(Method::GET), StatusCode(301), "http://[::1");
        assert!(matches!(result, Err(RequestError::InvalidLocation(_))));
    }
}
