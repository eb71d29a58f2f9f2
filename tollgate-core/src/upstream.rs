use crate::error::GatewayError;
use http::HeaderValue;
use http::uri::{Authority, PathAndQuery, Scheme, Uri};

/// The single upstream origin all authorized traffic is forwarded to.
///
/// Parsed once at startup from `upstream.url` and shared read-only.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    scheme: Scheme,
    authority: Authority,
    /// Path prefix from the configured URL, without trailing slash ("" for none).
    base_path: String,
    host_header: HeaderValue,
}

impl UpstreamTarget {
    /// Parse an `http://host[:port][/base]` origin.
    pub fn parse(url: &str) -> Result<Self, GatewayError> {
        let invalid = |why: &str| GatewayError::InvalidUpstream(format!("{url}: {why}"));

        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;

        let scheme = uri.scheme().cloned().ok_or_else(|| invalid("missing scheme"))?;
        if scheme != Scheme::HTTP {
            return Err(invalid("only the http scheme is supported"));
        }

        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| invalid("missing host"))?;
        if authority.host().is_empty() {
            return Err(invalid("missing host"));
        }

        if uri.query().is_some() {
            return Err(invalid("query strings are not allowed"));
        }

        let base_path = uri.path().trim_end_matches('/').to_string();
        let host_header =
            HeaderValue::from_str(authority.as_str()).map_err(|e| invalid(&e.to_string()))?;

        Ok(Self {
            scheme,
            authority,
            base_path,
            host_header,
        })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// `host[:port]` exactly as configured.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn host(&self) -> &str {
        self.authority.host()
    }

    /// Value sent as the `Host` header on forwarded requests.
    pub fn host_header(&self) -> &HeaderValue {
        &self.host_header
    }

    /// Absolute upstream URI for an inbound request's path and query.
    pub fn uri_for(&self, path_and_query: Option<&PathAndQuery>) -> Result<Uri, GatewayError> {
        let path = path_and_query.map(|pq| pq.path()).unwrap_or("/");
        let mut target = join_path(&self.base_path, path);
        if let Some(query) = path_and_query.and_then(|pq| pq.query()) {
            target.push('?');
            target.push_str(query);
        }

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(target)
            .build()
            .map_err(|e| GatewayError::Upstream(format!("cannot build upstream uri: {e}")))
    }
}

fn join_path(base: &str, path: &str) -> String {
    if base.is_empty() {
        return path.to_string();
    }
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}
