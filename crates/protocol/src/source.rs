use url::Url;

/// A parsed `worker://host:port/<cache-name>` peer source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSource {
    /// Transfer-server host of the source worker.
    pub host: String,
    /// Transfer-server port of the source worker.
    pub port: u16,
    /// Cache entry offered by the source worker.
    pub cache_name: String,
}

impl PeerSource {
    /// Parse a peer source URI, rejecting anything that is not `worker://`.
    pub fn parse(uri: &str) -> Option<PeerSource> {
        let url = Url::parse(uri).ok()?;
        if url.scheme() != "worker" {
            return None;
        }
        let host = url.host_str()?.to_string();
        let port = url.port()?;
        let cache_name = url.path().strip_prefix('/')?.to_string();
        if cache_name.is_empty() {
            return None;
        }
        Some(PeerSource {
            host,
            port,
            cache_name,
        })
    }
}

/// Render the source URI under which a peer worker offers a cache entry.
pub fn peer_source_uri(host: &str, port: u16, cache_name: &str) -> String {
    format!("worker://{host}:{port}/{cache_name}")
}

/// Whether a source URI names a peer worker rather than an origin URL.
pub fn is_peer_source(uri: &str) -> bool {
    uri.starts_with("worker://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let uri = peer_source_uri("10.1.2.3", 9123, "file-md5-0a1b");
        assert_eq!(uri, "worker://10.1.2.3:9123/file-md5-0a1b");
        assert!(is_peer_source(&uri));
        let parsed = PeerSource::parse(&uri).unwrap();
        assert_eq!(parsed.host, "10.1.2.3");
        assert_eq!(parsed.port, 9123);
        assert_eq!(parsed.cache_name, "file-md5-0a1b");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(PeerSource::parse("http://example.com/x").is_none());
        assert!(!is_peer_source("https://example.com/x"));
    }

    #[test]
    fn rejects_missing_parts() {
        assert!(PeerSource::parse("worker://host:1/").is_none());
        assert!(PeerSource::parse("worker://host/x").is_none());
    }
}
