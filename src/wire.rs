//! Formats exchanged with the outside world: the Netscape cookie-jar file,
//! `Set-Cookie` response headers and `WWW-Authenticate` challenges.

use std::time::UNIX_EPOCH;

use crate::cookies::Cookie;

const JAR_HEADER: &str = "# Netscape HTTP Cookie File\n# Written by obs-http. Edit at your own risk.\n\n";
const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

/// A malformed line in a cookie-jar file.
#[derive(Debug, thiserror::Error)]
#[error("cookie jar line {line}: {reason}")]
pub(crate) struct JarFormatError {
    pub line: usize,
    pub reason: String,
}

/// Decodes a Netscape cookie-jar file.
///
/// Each data line carries 7 TAB-separated fields: `domain`, `tailmatch`,
/// `path`, `secure`, `expires`, `name`, `value`. An `expires` of `0` marks a
/// session cookie. Any malformed data line rejects the whole file.
pub(crate) fn decode_cookie_jar(text: &str) -> Result<Vec<Cookie>, JarFormatError> {
    let mut cookies = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_number = idx + 1;
        let line = raw.trim_end_matches('\r');
        let line = match line.strip_prefix(HTTP_ONLY_PREFIX) {
            Some(rest) => rest,
            None if line.trim().is_empty() || line.starts_with('#') => continue,
            None => line,
        };

        let invalid = |reason: String| JarFormatError {
            line: line_number,
            reason,
        };

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 7 {
            return Err(invalid(format!(
                "expected 7 TAB-separated fields, found {}",
                fields.len()
            )));
        }

        let tailmatch = parse_flag(fields[1]).ok_or_else(|| {
            invalid(format!("tailmatch must be TRUE or FALSE, got '{}'", fields[1]))
        })?;
        let secure = parse_flag(fields[3])
            .ok_or_else(|| invalid(format!("secure must be TRUE or FALSE, got '{}'", fields[3])))?;
        let expires = fields[4]
            .parse::<u64>()
            .map_err(|_| invalid(format!("expires must be a unix timestamp, got '{}'", fields[4])))?;

        let mut domain = fields[0].to_ascii_lowercase();
        if domain.is_empty() {
            return Err(invalid("domain is empty".to_owned()));
        }
        if tailmatch && !domain.starts_with('.') {
            domain.insert(0, '.');
        }
        if fields[5].is_empty() {
            return Err(invalid("cookie name is empty".to_owned()));
        }

        cookies.push(Cookie {
            name: fields[5].to_owned(),
            value: fields[6].to_owned(),
            domain,
            path: (if fields[2].is_empty() { "/" } else { fields[2] }).to_owned(),
            secure,
            expires: (expires != 0).then_some(expires),
        });
    }

    Ok(cookies)
}

/// Encodes cookies in the format read by [`decode_cookie_jar`].
pub(crate) fn encode_cookie_jar(cookies: &[Cookie]) -> String {
    let mut out = String::from(JAR_HEADER);
    for cookie in cookies {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
            cookie.domain,
            flag(cookie.domain.starts_with('.')),
            cookie.path,
            flag(cookie.secure),
            cookie.expires.unwrap_or(0),
            cookie.name,
            cookie.value,
        ));
    }
    out
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "TRUE" => Some(true),
        "FALSE" => Some(false),
        _ => None,
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "TRUE"
    } else {
        "FALSE"
    }
}

/// A cookie as announced by a `Set-Cookie` response header.
#[derive(Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    value: String,
    /// Normalized `Domain` attribute, always with a leading `.`.
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    /// `Max-Age` delta in seconds; takes precedence over `expires`.
    pub max_age: Option<i64>,
    /// `Expires` attribute as a unix timestamp.
    pub expires: Option<u64>,
}

impl SetCookie {
    /// Parses a `Set-Cookie` header value, returning `None` when it has no
    /// `name=value` pair. Unknown attributes are ignored.
    ///
    /// Cookies whose name, value, domain or path contain control characters
    /// are rejected: the jar is TAB and line separated and cannot hold them.
    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        let value = value.trim().trim_matches('"');
        if name.is_empty() || has_control(name) || has_control(value) {
            return None;
        }

        let mut cookie = Self {
            name: name.to_owned(),
            value: value.to_owned(),
            domain: None,
            path: None,
            secure: false,
            max_age: None,
            expires: None,
        };

        for attribute in parts {
            let (key, val) = match attribute.split_once('=') {
                Some((key, val)) => (key.trim(), val.trim()),
                None => (attribute.trim(), ""),
            };
            let key = key.to_ascii_lowercase();
            if matches!(key.as_str(), "domain" | "path") && has_control(val) {
                return None;
            }
            match key.as_str() {
                "domain" if !val.is_empty() => {
                    let host = val.trim_start_matches('.').to_ascii_lowercase();
                    cookie.domain = Some(format!(".{host}"));
                }
                "path" if val.starts_with('/') => cookie.path = Some(val.to_owned()),
                "secure" => cookie.secure = true,
                "max-age" => cookie.max_age = val.parse().ok(),
                "expires" => {
                    // A date before the epoch is as expired as it gets.
                    cookie.expires = httpdate::parse_http_date(val).ok().map(|time| {
                        time.duration_since(UNIX_EPOCH)
                            .map_or(0, |since| since.as_secs())
                    });
                }
                _ => {}
            }
        }

        Some(cookie)
    }

    /// The cookie value. Avoid logging it.
    pub fn value(&self) -> &str {
        &self.value
    }
}

fn has_control(text: &str) -> bool {
    text.chars().any(char::is_control)
}

impl std::fmt::Debug for SetCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetCookie")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .field("domain", &self.domain)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .field("max_age", &self.max_age)
            .field("expires", &self.expires)
            .finish()
    }
}

/// One `WWW-Authenticate` challenge: an auth scheme and its parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    /// Scheme name, lowercased.
    pub scheme: String,
    pub params: Vec<(String, String)>,
}

impl Challenge {
    /// Parses the first challenge of a header value, see [`Challenge::parse_all`].
    pub fn parse(header: &str) -> Option<Self> {
        Self::parse_all(header).into_iter().next()
    }

    /// Parses every challenge of one `WWW-Authenticate` field, e.g.
    /// `Basic realm="obs", Signature realm="x",headers="(created)"`.
    ///
    /// A bare token starts a new challenge unless it directly follows a
    /// scheme, where it is a token68 credential and skipped. Parameter
    /// names are lowercased. An unterminated quoted string ends parsing;
    /// the schemes seen so far are kept.
    pub fn parse_all(header: &str) -> Vec<Self> {
        let mut challenges: Vec<Self> = Vec::new();
        let mut chars = header.chars().peekable();
        let mut after_scheme = false;

        loop {
            while let Some(c) = chars.next_if(|c| c.is_ascii_whitespace() || *c == ',') {
                if c == ',' {
                    after_scheme = false;
                }
            }

            let mut name = String::new();
            while let Some(c) = chars.next_if(|c| *c != '=' && *c != ',' && !c.is_ascii_whitespace()) {
                name.push(c);
            }
            if name.is_empty() {
                break;
            }

            while chars.next_if(|c| c.is_ascii_whitespace()).is_some() {}
            if chars.next_if_eq(&'=').is_none() {
                if !after_scheme {
                    challenges.push(Self {
                        scheme: name.to_ascii_lowercase(),
                        params: Vec::new(),
                    });
                }
                after_scheme = !after_scheme;
                continue;
            }
            while chars.next_if(|c| c.is_ascii_whitespace()).is_some() {}

            let mut value = String::new();
            if chars.next_if_eq(&'"').is_some() {
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => value.push(other),
                    }
                }
                if !closed {
                    break;
                }
            } else {
                // also swallows token68 padding such as `abc==`
                while let Some(c) = chars.next_if(|c| *c != ',' && !c.is_ascii_whitespace()) {
                    value.push(c);
                }
            }

            after_scheme = false;
            if let Some(current) = challenges.last_mut() {
                current.params.push((name.to_ascii_lowercase(), value));
            }
        }

        challenges
    }

    /// Looks up a parameter by case-insensitive name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_cookie_jar, encode_cookie_jar, Challenge, SetCookie};
    use crate::cookies::Cookie;

    fn session_cookie() -> Cookie {
        Cookie {
            name: "openSUSE_session".to_owned(),
            value: "abc123".to_owned(),
            domain: "api.opensuse.org".to_owned(),
            path: "/".to_owned(),
            secure: true,
            expires: Some(1_900_000_000),
        }
    }

    #[test]
    fn decode_reads_encoded_jar() {
        let encoded = encode_cookie_jar(&[session_cookie()]);
        assert!(encoded.starts_with("# Netscape HTTP Cookie File"));
        assert!(encoded.contains(
            "api.opensuse.org\tFALSE\t/\tTRUE\t1900000000\topenSUSE_session\tabc123\n"
        ));

        let decoded = decode_cookie_jar(&encoded).expect("jar must decode");
        assert_eq!(decoded, vec![session_cookie()]);
    }

    #[test]
    fn decode_handles_session_cookies_tailmatch_and_http_only() {
        let input = "\
# Netscape HTTP Cookie File

example.com\tTRUE\t/\tFALSE\t0\tsession\tv1
#HttpOnly_.other.org\tTRUE\t/api\tTRUE\t1700000000\ttoken\tv2\r
";
        let cookies = decode_cookie_jar(input).expect("jar must decode");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].domain, ".example.com");
        assert_eq!(cookies[0].expires, None);
        assert_eq!(cookies[1].domain, ".other.org");
        assert_eq!(cookies[1].path, "/api");
        assert_eq!(cookies[1].value(), "v2");
    }

    #[test]
    fn decode_rejects_malformed_line() {
        let input = "example.com\tFALSE\t/\tFALSE\t0\tok\tv\nnot a cookie line\n";
        let err = decode_cookie_jar(input).expect_err("malformed jar must fail");
        assert_eq!(err.line, 2);

        let input = "example.com\tMAYBE\t/\tFALSE\t0\tname\tv\n";
        assert!(decode_cookie_jar(input).is_err());
    }

    #[test]
    fn set_cookie_parses_attributes() {
        let cookie = SetCookie::parse(
            "openSUSE_session=xyz; Domain=OpenSUSE.org; path=/; Max-Age=3600; Secure; HttpOnly",
        )
        .expect("must parse");
        assert_eq!(cookie.name, "openSUSE_session");
        assert_eq!(cookie.value(), "xyz");
        assert_eq!(cookie.domain.as_deref(), Some(".opensuse.org"));
        assert_eq!(cookie.path.as_deref(), Some("/"));
        assert!(cookie.secure);
        assert_eq!(cookie.max_age, Some(3600));
    }

    #[test]
    fn set_cookie_parses_http_date_expiry() {
        let cookie =
            SetCookie::parse("a=b; Expires=Thu, 01 Jan 2015 00:00:00 GMT").expect("must parse");
        assert_eq!(cookie.expires, Some(1_420_070_400));
        assert_eq!(cookie.domain, None);
    }

    #[test]
    fn set_cookie_without_pair_is_rejected() {
        assert!(SetCookie::parse("garbage").is_none());
        assert!(SetCookie::parse("=value").is_none());
    }

    #[test]
    fn set_cookie_with_control_characters_is_rejected() {
        assert!(SetCookie::parse("other=a\tb").is_none());
        assert!(SetCookie::parse("na\tme=value").is_none());
        assert!(SetCookie::parse("a=b; Path=/x\ty").is_none());
        assert!(SetCookie::parse("a=b; Domain=exam\rple.org").is_none());
        assert!(SetCookie::parse("a=b; Comment=x\ty").is_some());
    }

    #[test]
    fn combined_field_yields_every_challenge() {
        let challenges = Challenge::parse_all(
            r#"Basic realm="obs", Signature realm="Use your developer account",headers="(created)""#,
        );
        assert_eq!(challenges.len(), 2);
        assert_eq!(challenges[0].scheme, "basic");
        assert_eq!(challenges[0].params, [("realm".to_owned(), "obs".to_owned())]);
        assert_eq!(challenges[1].scheme, "signature");
        assert_eq!(challenges[1].param("realm"), Some("Use your developer account"));
        assert_eq!(challenges[1].param("headers"), Some("(created)"));
    }

    #[test]
    fn token68_credentials_do_not_start_a_challenge() {
        let challenges = Challenge::parse_all("Bearer abc123, Negotiate, Basic realm=obs");
        let schemes: Vec<_> = challenges.iter().map(|c| c.scheme.as_str()).collect();
        assert_eq!(schemes, ["bearer", "negotiate", "basic"]);
        assert_eq!(challenges[2].param("realm"), Some("obs"));
        assert!(Challenge::parse_all("").is_empty());
    }

    #[test]
    fn challenge_parses_scheme_and_quoted_params() {
        let challenge = Challenge::parse(
            r#"Signature realm="Use your developer account",headers="(created)""#,
        )
        .expect("must parse");
        assert_eq!(challenge.scheme, "signature");
        assert_eq!(challenge.param("realm"), Some("Use your developer account"));
        assert_eq!(challenge.param("HEADERS"), Some("(created)"));
    }

    #[test]
    fn challenge_parses_escapes_and_tokens() {
        let challenge =
            Challenge::parse(r#"basic realm="say \"hi\"", charset=UTF-8"#).expect("must parse");
        assert_eq!(challenge.scheme, "basic");
        assert_eq!(challenge.param("realm"), Some(r#"say "hi""#));
        assert_eq!(challenge.param("charset"), Some("UTF-8"));
    }

    #[test]
    fn challenge_scheme_alone_is_enough() {
        let challenge = Challenge::parse("Negotiate").expect("must parse");
        assert_eq!(challenge.scheme, "negotiate");
        assert!(challenge.params.is_empty());
        assert!(Challenge::parse("   ").is_none());
    }
}
