//! Translation of inbound HTTP requests into a protocol-neutral descriptor.

use std::collections::HashMap;

use axum::http::{header, request::Parts, HeaderMap, Method};
use url::Url;

use crate::error::MalformedRequestError;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Per-request view consumed by the SAML engine. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    https: bool,
    host: String,
    path: String,
    port: u16,
    get_data: HashMap<String, String>,
    post_data: HashMap<String, String>,
}

/// How much of the request's forwarding headers to believe.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterOptions {
    /// Honour `X-Forwarded-Proto`, `X-Forwarded-Host` and `X-Forwarded-Port`.
    pub trust_proxy_headers: bool,
}

/// Build a [`RequestContext`] from request parts and the buffered body.
///
/// `get_data` holds the form body for POST requests and the query string
/// otherwise. `post_data` holds the form body regardless of method.
pub fn adapt(
    parts: &Parts,
    body: &[u8],
    options: AdapterOptions,
) -> Result<RequestContext, MalformedRequestError> {
    let https = if options.trust_proxy_headers {
        forwarded(&parts.headers, "x-forwarded-proto")
            .map(|proto| proto.eq_ignore_ascii_case("https"))
            .unwrap_or(false)
    } else {
        parts.uri.scheme_str() == Some("https")
    };

    let authority = options
        .trust_proxy_headers
        .then(|| forwarded(&parts.headers, "x-forwarded-host"))
        .flatten()
        .or_else(|| {
            parts
                .headers
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
        })
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .ok_or(MalformedRequestError::MissingHost)?;

    let (host, authority_port) = split_authority(&authority)?;

    let forwarded_port = if options.trust_proxy_headers {
        forwarded(&parts.headers, "x-forwarded-port")
            .map(|value| {
                value
                    .parse::<u16>()
                    .map_err(|_| MalformedRequestError::InvalidPort(value.to_string()))
            })
            .transpose()?
    } else {
        None
    };

    let port = forwarded_port
        .or(authority_port)
        .unwrap_or(if https { 443 } else { 80 });

    let query = parse_urlencoded(parts.uri.query().unwrap_or(""), "query")?;

    let is_form = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .eq_ignore_ascii_case(FORM_CONTENT_TYPE)
        })
        .unwrap_or(false);

    let post_data = if is_form {
        let text = std::str::from_utf8(body).map_err(|_| MalformedRequestError::BodyEncoding)?;
        parse_urlencoded(text, "form")?
    } else {
        HashMap::new()
    };

    let get_data = if parts.method == Method::POST {
        post_data.clone()
    } else {
        query
    };

    Ok(RequestContext {
        https,
        host,
        path: parts.uri.path().to_string(),
        port,
        get_data,
        post_data,
    })
}

impl RequestContext {
    pub fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }

    pub fn get_param(&self, name: &str) -> Option<&str> {
        self.get_data.get(name).map(String::as_str)
    }

    pub fn post_param(&self, name: &str) -> Option<&str> {
        self.post_data.get(name).map(String::as_str)
    }

    /// The URL this request was received at, without query string.
    pub fn self_url(&self) -> String {
        let default_port = if self.https { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            format!("{}://{}{}", self.scheme(), host, self.path)
        } else {
            format!("{}://{}:{}{}", self.scheme(), host, self.port, self.path)
        }
    }

    /// Whether this request arrived at `url`, ignoring query and fragment.
    pub fn received_at(&self, url: &str) -> bool {
        let (Ok(ours), Ok(theirs)) = (Url::parse(&self.self_url()), Url::parse(url)) else {
            return false;
        };
        ours.scheme() == theirs.scheme()
            && ours.host_str().map(str::to_ascii_lowercase)
                == theirs.host_str().map(str::to_ascii_lowercase)
            && ours.port_or_known_default() == theirs.port_or_known_default()
            && ours.path() == theirs.path()
    }

    #[cfg(test)]
    pub fn for_test(
        https: bool,
        host: &str,
        path: &str,
        port: u16,
        get_data: HashMap<String, String>,
        post_data: HashMap<String, String>,
    ) -> Self {
        Self {
            https,
            host: host.to_string(),
            path: path.to_string(),
            port,
            get_data,
            post_data,
        }
    }
}

fn forwarded<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
fn split_authority(authority: &str) -> Result<(String, Option<u16>), MalformedRequestError> {
    let authority = authority.trim();
    if authority.is_empty() {
        return Err(MalformedRequestError::MissingHost);
    }

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| MalformedRequestError::InvalidHost(authority.to_string()))?;
        match tail {
            "" => (host, None),
            _ => match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(MalformedRequestError::InvalidHost(authority.to_string())),
            },
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
        return Err(MalformedRequestError::InvalidHost(authority.to_string()));
    }

    let port = port
        .map(|p| {
            p.parse::<u16>()
                .map_err(|_| MalformedRequestError::InvalidPort(p.to_string()))
        })
        .transpose()?;

    Ok((host.to_ascii_lowercase(), port))
}

/// Parse `application/x-www-form-urlencoded` text. The first occurrence of a
/// name wins.
fn parse_urlencoded(
    input: &str,
    source_name: &'static str,
) -> Result<HashMap<String, String>, MalformedRequestError> {
    let mut params = HashMap::new();
    for pair in input.split('&').filter(|pair| !pair.is_empty()) {
        let (raw_name, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = decode_component(raw_name).map_err(|_| {
            MalformedRequestError::ParameterEncoding {
                source_name,
                name: raw_name.to_string(),
            }
        })?;
        let value = decode_component(raw_value).map_err(|_| {
            MalformedRequestError::ParameterEncoding {
                source_name,
                name: name.clone(),
            }
        })?;
        params.entry(name).or_insert(value);
    }
    Ok(params)
}

fn decode_component(raw: &str) -> Result<String, std::string::FromUtf8Error> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced).map(|decoded| decoded.into_owned())
}
