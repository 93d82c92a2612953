// crates/conduit-rpc/src/middleware.rs
//
// Middleware for the HTTP binding: request logging interceptor.

use tonic::{Request, Status};

/// Logging interceptor for the tonic HTTP server.
///
/// Logs the user agent and content type of each incoming request at debug
/// level; everything else in the metadata is left to trace level.
pub fn logging_interceptor(req: Request<()>) -> Result<Request<()>, Status> {
    let metadata = req.metadata();
    let header = |name: &str| {
        metadata
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string()
    };
    tracing::debug!(
        "Incoming API request: user-agent={} content-type={}",
        header("user-agent"),
        header("content-type")
    );
    tracing::trace!("Request metadata: {:?}", metadata);
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interceptor_passes_requests_through() {
        let mut req = Request::new(());
        req.metadata_mut()
            .insert("user-agent", "conduit-test".parse().unwrap());
        let out = logging_interceptor(req).unwrap();
        assert_eq!(out.metadata().get("user-agent").unwrap(), "conduit-test");
    }
}
