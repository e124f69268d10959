//! File-backed session cookie store.
//!
//! The jar is read lazily on first use and written back in full after every
//! mutation. Concurrent processes sharing one jar file are not coordinated:
//! the last writer's view of the jar wins.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::Url;
use tracing::{debug, warn};

use crate::wire::{self, SetCookie};

/// A persisted session cookie.
#[derive(Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub(crate) value: String,
    /// Host the cookie belongs to; a leading `.` also matches subdomains.
    pub domain: String,
    pub path: String,
    pub secure: bool,
    /// Absolute expiry as a unix timestamp, `None` for session cookies.
    pub expires: Option<u64>,
}

impl Cookie {
    /// Returns the cookie value. Avoid logging it.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Standard cookie domain matching against a request host.
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        if self.domain == host {
            return true;
        }
        match self.domain.strip_prefix('.') {
            Some(bare) => host == bare || host.ends_with(&self.domain),
            None => false,
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookie")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .field("domain", &self.domain)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .field("expires", &self.expires)
            .finish()
    }
}

/// Session cookies persisted in a Netscape cookie-jar file.
pub struct CookieStore {
    path: PathBuf,
    cookies: Mutex<Option<Vec<Cookie>>>,
}

impl fmt::Debug for CookieStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl CookieStore {
    /// Creates a store backed by `path`. Nothing is read until first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cookies: Mutex::new(None),
        }
    }

    /// Creates a store and reads the jar immediately.
    ///
    /// A missing, unreadable or malformed file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cookies = read_jar(&path);
        Self {
            path,
            cookies: Mutex::new(Some(cookies)),
        }
    }

    /// Location of the backing jar file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All unexpired cookies whose domain matches `host`.
    pub fn filter(&self, host: &str) -> Vec<Cookie> {
        let now = unix_now();
        let mut guard = self.lock();
        self.loaded(&mut guard)
            .iter()
            .filter(|cookie| cookie.matches_host(host) && !cookie.is_expired(now))
            .cloned()
            .collect()
    }

    /// Renders the `Cookie` request header for `host`, if any cookie matches.
    pub fn header_for(&self, host: &str) -> Option<String> {
        let cookies = self.filter(host);
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|cookie| format!("{}={}", cookie.name, cookie.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Merges cookies received from `response_url` and writes the jar back.
    ///
    /// A `Max-Age` attribute wins over `Expires`; a cookie that is already
    /// expired removes any stored cookie of the same name and domain. Cookies
    /// whose `Domain` does not match the responding host are ignored.
    pub fn update(&self, incoming: &[SetCookie], response_url: &Url) -> io::Result<()> {
        if incoming.is_empty() {
            return Ok(());
        }

        let host = response_url.host_str().unwrap_or_default().to_ascii_lowercase();
        let now = unix_now();
        let mut guard = self.lock();
        let cookies = self.loaded(&mut guard);

        for set_cookie in incoming {
            let expires = match (set_cookie.max_age, set_cookie.expires) {
                (Some(delta), _) => Some(now.saturating_add_signed(delta)),
                (None, Some(at)) => Some(at),
                (None, None) => None,
            };
            let cookie = Cookie {
                name: set_cookie.name.clone(),
                value: set_cookie.value().to_owned(),
                domain: set_cookie.domain.clone().unwrap_or_else(|| host.clone()),
                path: set_cookie.path.clone().unwrap_or_else(|| "/".to_owned()),
                secure: set_cookie.secure,
                expires,
            };
            if !cookie.matches_host(&host) {
                warn!(name = %cookie.name, domain = %cookie.domain, %host, "ignoring cookie for a foreign domain");
                continue;
            }

            cookies.retain(|stored| !(stored.name == cookie.name && stored.domain == cookie.domain));
            if cookie.is_expired(now) {
                debug!(name = %cookie.name, domain = %cookie.domain, "dropping expired cookie");
            } else {
                debug!(name = %cookie.name, domain = %cookie.domain, "storing cookie");
                cookies.push(cookie);
            }
        }

        cookies.retain(|cookie| !cookie.is_expired(now));
        write_jar(&self.path, cookies)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<Cookie>>> {
        // The guarded state is a plain Vec; a panic elsewhere cannot leave it torn.
        self.cookies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn loaded<'a>(&self, guard: &'a mut MutexGuard<'_, Option<Vec<Cookie>>>) -> &'a mut Vec<Cookie> {
        guard.get_or_insert_with(|| read_jar(&self.path))
    }
}

fn read_jar(path: &Path) -> Vec<Cookie> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot read cookie jar, starting empty");
            return Vec::new();
        }
    };

    match wire::decode_cookie_jar(&text) {
        Ok(cookies) => {
            debug!(path = %path.display(), count = cookies.len(), "loaded cookie jar");
            cookies
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring malformed cookie jar");
            Vec::new()
        }
    }
}

fn write_jar(path: &Path, cookies: &[Cookie]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_private_dir(parent)?;
        }
    }
    fs::write(path, wire::encode_cookie_jar(cookies))?;
    set_owner_only_permissions(path)
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

#[cfg(test)]
mod tests {
    use reqwest::Url;

    use super::{unix_now, Cookie, CookieStore};
    use crate::wire::SetCookie;

    fn url(raw: &str) -> Url {
        Url::parse(raw).expect("valid url")
    }

    fn set_cookie(header: &str) -> SetCookie {
        SetCookie::parse(header).expect("valid Set-Cookie")
    }

    #[test]
    fn persisted_cookie_is_visible_to_a_fresh_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state/osc/cookiejar");

        let store = CookieStore::new(&path);
        store
            .update(
                &[set_cookie("openSUSE_session=s3cr3t; Path=/; Max-Age=3600")],
                &url("https://api.example.org/source"),
            )
            .expect("update must persist");

        let reloaded = CookieStore::load(&path);
        let cookies = reloaded.filter("api.example.org");
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "openSUSE_session");
        assert_eq!(cookies[0].value(), "s3cr3t");
        assert!(cookies[0].expires.is_some_and(|at| at > unix_now()));
    }

    #[cfg(unix)]
    #[test]
    fn jar_directory_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let jar_dir = dir.path().join("osc");
        let store = CookieStore::new(jar_dir.join("cookiejar"));
        store
            .update(&[set_cookie("a=b")], &url("https://api.example.org/"))
            .expect("update must persist");

        let mode = std::fs::metadata(&jar_dir).expect("dir exists").permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn malformed_jar_is_treated_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cookiejar");
        std::fs::write(&path, "this is\tnot a jar\n").expect("write");

        let store = CookieStore::load(&path);
        assert!(store.filter("anything.example.org").is_empty());
    }

    #[test]
    fn filter_applies_domain_matching() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CookieStore::new(dir.path().join("cookiejar"));
        store
            .update(
                &[
                    set_cookie("host_only=1"),
                    set_cookie("wide=2; Domain=example.org"),
                ],
                &url("https://api.example.org/"),
            )
            .expect("update must persist");

        let names = |host: &str| -> Vec<String> {
            let mut names: Vec<_> = store.filter(host).into_iter().map(|c| c.name).collect();
            names.sort();
            names
        };
        assert_eq!(names("api.example.org"), ["host_only", "wide"]);
        assert_eq!(names("build.example.org"), ["wide"]);
        assert_eq!(names("example.org"), ["wide"]);
        assert!(names("notexample.org").is_empty());
    }

    #[test]
    fn cookies_for_foreign_domains_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CookieStore::new(dir.path().join("cookiejar"));
        store
            .update(
                &[
                    set_cookie("planted=1; Domain=bank.example.com"),
                    set_cookie("parent=2; Domain=example.org"),
                    set_cookie("sibling=3; Domain=build.example.org"),
                ],
                &url("https://api.example.org/"),
            )
            .expect("update must persist");

        assert!(store.filter("bank.example.com").is_empty());
        let names: Vec<_> = store
            .filter("api.example.org")
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["parent"]);
        assert!(CookieStore::load(store.path())
            .filter("bank.example.com")
            .is_empty());
    }

    #[test]
    fn unstorable_cookie_does_not_wipe_the_jar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cookiejar");
        let origin = url("https://api.example.org/");
        let store = CookieStore::new(&path);

        store.update(&[set_cookie("session=keepme")], &origin).expect("update");
        let incoming: Vec<SetCookie> = ["other=a\tb", "next=ok"]
            .into_iter()
            .filter_map(SetCookie::parse)
            .collect();
        store.update(&incoming, &origin).expect("update");

        let mut names: Vec<_> = CookieStore::load(&path)
            .filter("api.example.org")
            .into_iter()
            .map(|c| c.name)
            .collect();
        names.sort();
        assert_eq!(names, ["next", "session"]);
    }

    #[test]
    fn last_write_wins_and_expired_cookies_are_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CookieStore::new(dir.path().join("cookiejar"));
        let origin = url("https://api.example.org/");

        store.update(&[set_cookie("session=old")], &origin).expect("update");
        store.update(&[set_cookie("session=new")], &origin).expect("update");
        let cookies = store.filter("api.example.org");
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].value(), "new");

        store
            .update(&[set_cookie("session=gone; Max-Age=0")], &origin)
            .expect("update");
        assert!(store.filter("api.example.org").is_empty());
        assert!(CookieStore::load(store.path())
            .filter("api.example.org")
            .is_empty());
    }

    #[test]
    fn explicit_expiry_is_kept_when_no_max_age() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CookieStore::new(dir.path().join("cookiejar"));
        store
            .update(
                &[set_cookie("a=b; Expires=Wed, 01 Jan 2098 00:00:00 GMT")],
                &url("https://api.example.org/"),
            )
            .expect("update");
        assert_eq!(store.filter("api.example.org")[0].expires, Some(4_039_372_800));
    }

    #[test]
    fn header_joins_matching_cookies() {
        let cookie = Cookie {
            name: "n".to_owned(),
            value: "v".to_owned(),
            domain: ".example.org".to_owned(),
            path: "/".to_owned(),
            secure: false,
            expires: None,
        };
        assert!(cookie.matches_host("API.example.org"));
        assert!(!format!("{cookie:?}").contains("\"v\""));

        let dir = tempfile::tempdir().expect("tempdir");
        let store = CookieStore::new(dir.path().join("cookiejar"));
        assert_eq!(store.header_for("example.org"), None);
        store
            .update(&[set_cookie("x=1"), set_cookie("y=2")], &url("https://example.org/"))
            .expect("update");
        assert_eq!(store.header_for("example.org").as_deref(), Some("x=1; y=2"));
    }
}
