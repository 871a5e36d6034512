//! Path Resolver
//!
//! Maps an inbound request onto the script file that should handle it, using
//! the CGI-style headers a reverse proxy forwards:
//!
//! - `path_translated` - document root override
//! - `script_name` - script path relative to the document root
//!
//! Precedence: an explicit script name beats the URL path, which beats no
//! mapping at all (the raw URL path is used verbatim).

use std::path::{Path, PathBuf};

use hyper::header::HeaderMap;
use hyper::Uri;

/// Header carrying the document root override.
pub const PATH_TRANSLATED_HEADER: &str = "path_translated";

/// Header carrying the script name override.
pub const SCRIPT_NAME_HEADER: &str = "script_name";

/// Outcome of path resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Document root in effect for this request
    pub document_root: PathBuf,
    /// True when the document root came from the configured default
    pub default_root: bool,
    /// Script file to execute
    pub file: PathBuf,
}

/// Resolves the script file for a request.
///
/// This is a pure function of the headers, the URI, and the configured
/// default document root. Creating the default root on disk is the caller's
/// business.
pub fn resolve(headers: &HeaderMap, uri: &Uri, default_root: &Path) -> ResolvedPath {
    let root_override = header_str(headers, PATH_TRANSLATED_HEADER);
    let script_name = header_str(headers, SCRIPT_NAME_HEADER);

    let document_root = match root_override {
        Some(root) => PathBuf::from(root),
        None => default_root.to_path_buf(),
    };
    let root_text = document_root.to_string_lossy();

    let file = if let Some(script) = script_name {
        PathBuf::from(format!("{}{}", root_text, script))
    } else if root_override.is_some() {
        PathBuf::from(format!("{}{}", root_text, uri.path()))
    } else {
        PathBuf::from(uri.path())
    };

    ResolvedPath {
        default_root: root_override.is_none(),
        document_root,
        file,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_script_name_wins() {
        let resolved = resolve(
            &headers(&[("path_translated", "/docroot"), ("script_name", "/app.js")]),
            &"/something/else.js?x=1".parse().unwrap(),
            Path::new("/default"),
        );
        assert_eq!(resolved.file, PathBuf::from("/docroot/app.js"));
        assert_eq!(resolved.document_root, PathBuf::from("/docroot"));
        assert!(!resolved.default_root);
    }

    #[test]
    fn test_url_path_under_document_root() {
        let resolved = resolve(
            &headers(&[("path_translated", "/docroot")]),
            &"/app.js?debug=true".parse().unwrap(),
            Path::new("/default"),
        );
        assert_eq!(resolved.file, PathBuf::from("/docroot/app.js"));
    }

    #[test]
    fn test_raw_url_path_without_headers() {
        let resolved = resolve(&HeaderMap::new(), &"/app.js".parse().unwrap(), Path::new("/default"));
        assert_eq!(resolved.file, PathBuf::from("/app.js"));
        assert_eq!(resolved.document_root, PathBuf::from("/default"));
        assert!(resolved.default_root);
    }

    #[test]
    fn test_script_name_with_default_root() {
        let resolved = resolve(
            &headers(&[("script_name", "/hello.js")]),
            &"/ignored".parse().unwrap(),
            Path::new("/srv/www"),
        );
        assert_eq!(resolved.file, PathBuf::from("/srv/www/hello.js"));
        assert!(resolved.default_root);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let h = headers(&[("path_translated", "/docroot")]);
        let uri: Uri = "/a/b.js".parse().unwrap();
        assert_eq!(
            resolve(&h, &uri, Path::new("/x")),
            resolve(&h, &uri, Path::new("/x"))
        );
    }
}
