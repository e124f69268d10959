//! Client configuration and credential resolution.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::{ObsError, Result};

/// API URL used when neither the environment nor an oscrc names one.
pub const DEFAULT_API_URL: &str = "https://api.opensuse.org";

pub const ENV_USER: &str = "OSC_USER";
pub const ENV_PASSWORD: &str = "OSC_PASSWORD";
pub const ENV_SSH_KEY: &str = "OSC_SSH_PUBKEY";
pub const ENV_API_URL: &str = "OSC_APIURL";

/// The secret material a user authenticates with.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password(String),
    SshKey(PathBuf),
    /// Both are available; the server's challenge decides which one is used.
    PasswordAndSshKey { password: String, ssh_key: PathBuf },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::SshKey(path) => f.debug_tuple("SshKey").field(path).finish(),
            Self::PasswordAndSshKey { ssh_key, .. } => f
                .debug_struct("PasswordAndSshKey")
                .field("password", &"<redacted>")
                .field("ssh_key", ssh_key)
                .finish(),
        }
    }
}

/// Immutable settings of one [`ObsClient`](crate::ObsClient).
///
/// Unless the configuration is public, it always carries a non-empty
/// username and at least one of a password or an SSH key path.
#[derive(Clone)]
pub struct ClientConfig {
    username: String,
    password: Option<String>,
    ssh_key_path: Option<PathBuf>,
    api_url: String,
    public: bool,
    cookie_jar: PathBuf,
    headers: HeaderMap,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssh_key_path", &self.ssh_key_path)
            .field("api_url", &self.api_url)
            .field("public", &self.public)
            .field("cookie_jar", &self.cookie_jar)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Creates an authenticated configuration against [`DEFAULT_API_URL`].
    pub fn new(username: impl Into<String>, credentials: Credentials) -> Result<Self> {
        let username = username.into();
        if username.trim().is_empty() {
            return Err(ObsError::Config("username must not be empty".to_owned()));
        }

        let (password, ssh_key_path) = match credentials {
            Credentials::Password(password) => (Some(password), None),
            Credentials::SshKey(path) => (None, Some(path)),
            Credentials::PasswordAndSshKey { password, ssh_key } => (Some(password), Some(ssh_key)),
        };
        let password = password.filter(|password| !password.is_empty());
        let ssh_key_path = ssh_key_path.filter(|path| !path.as_os_str().is_empty());
        if password.is_none() && ssh_key_path.is_none() {
            return Err(ObsError::Config(
                "a non-empty password or SSH key path is required".to_owned(),
            ));
        }

        Ok(Self {
            username,
            password,
            ssh_key_path,
            api_url: DEFAULT_API_URL.to_owned(),
            public: false,
            cookie_jar: default_cookie_jar(),
            headers: HeaderMap::new(),
        })
    }

    /// Creates an unauthenticated configuration using the public routes.
    pub fn public(api_url: impl Into<String>) -> Self {
        Self {
            username: String::new(),
            password: None,
            ssh_key_path: None,
            api_url: api_url.into(),
            public: true,
            cookie_jar: default_cookie_jar(),
            headers: HeaderMap::new(),
        }
    }

    /// Resolves credentials from `OSC_USER`, `OSC_PASSWORD`, `OSC_SSH_PUBKEY`
    /// and `OSC_APIURL`.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an injected variable lookup.
    pub fn from_env_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let username = non_empty(ENV_USER)
            .ok_or_else(|| ObsError::Config(format!("environment variable {ENV_USER} is not set")))?;
        let credentials = match (non_empty(ENV_PASSWORD), non_empty(ENV_SSH_KEY)) {
            (Some(password), Some(ssh_key)) => Credentials::PasswordAndSshKey {
                password,
                ssh_key: PathBuf::from(ssh_key),
            },
            (Some(password), None) => Credentials::Password(password),
            (None, Some(ssh_key)) => Credentials::SshKey(PathBuf::from(ssh_key)),
            (None, None) => {
                return Err(ObsError::Config(format!(
                    "environment variable {ENV_PASSWORD} or {ENV_SSH_KEY} is not set"
                )))
            }
        };

        let config = Self::new(username, credentials)?;
        Ok(match non_empty(ENV_API_URL) {
            Some(api_url) => config.with_api_url(api_url),
            None => config,
        })
    }

    /// Resolves credentials from the oscrc at its default location.
    ///
    /// Looks for `$XDG_CONFIG_HOME/osc/oscrc` first and falls back to the
    /// legacy `~/.oscrc`.
    pub fn from_default_oscrc(api_url: Option<&str>) -> Result<Self> {
        let path = default_oscrc_path()
            .ok_or_else(|| ObsError::Config("no oscrc found".to_owned()))?;
        Self::from_oscrc(path, api_url)
    }

    /// Resolves credentials from an oscrc file.
    ///
    /// `api_url` overrides the `apiurl` of the `[general]` section. The
    /// section named after the API URL must provide `user` and either
    /// `pass` or `sshkey`; `sshkey = name` resolves to `~/.ssh/name.pub`.
    pub fn from_oscrc(path: impl AsRef<Path>, api_url: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            ObsError::Config(format!("cannot read oscrc {}: {err}", path.display()))
        })?;
        Self::from_oscrc_str(&text, api_url)
    }

    pub(crate) fn from_oscrc_str(text: &str, api_url: Option<&str>) -> Result<Self> {
        let ini = Ini::parse(text);

        let api_url = match api_url {
            Some(url) => url.to_owned(),
            None => ini
                .get("general", "apiurl")
                .ok_or_else(|| {
                    ObsError::Config("oscrc general section is missing the apiurl option".to_owned())
                })?
                .to_owned(),
        };

        let section = ini
            .section(&api_url)
            .or_else(|| ini.section(api_url.trim_end_matches('/')))
            .or_else(|| ini.section(&format!("{}/", api_url.trim_end_matches('/'))))
            .ok_or_else(|| ObsError::Config(format!("Missing section '{api_url}' in oscrc")))?;

        let username = section
            .get("user")
            .filter(|user| !user.is_empty())
            .ok_or_else(|| {
                ObsError::Config(format!("user option missing in section '{api_url}'"))
            })?;

        let credentials = match (
            section.get("pass").filter(|pass| !pass.is_empty()),
            section.get("sshkey").filter(|key| !key.is_empty()),
        ) {
            (Some(password), _) => Credentials::Password(password.clone()),
            (None, Some(key)) => Credentials::SshKey(ssh_public_key_path(key)?),
            (None, None) => {
                return Err(ObsError::Config(format!(
                    "pass and sshkey are both missing in section '{api_url}'"
                )))
            }
        };

        Ok(Self::new(username.clone(), credentials)?.with_api_url(api_url))
    }

    /// Points the configuration at another build service instance.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Overrides where session cookies are persisted.
    pub fn with_cookie_jar(mut self, path: impl Into<PathBuf>) -> Self {
        self.cookie_jar = path.into();
        self
    }

    /// Adds a header sent with every request.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| ObsError::InvalidRequest(format!("header name {name:?}: {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| ObsError::InvalidRequest(format!("header {name}: {err}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Account name; empty for public configurations.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Password for Basic authentication, never empty when present.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Public key whose private half signs `Signature` challenges.
    pub fn ssh_key_path(&self) -> Option<&Path> {
        self.ssh_key_path.as_deref()
    }

    /// Base URL of the API, without the public prefix.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Whether requests go to the unauthenticated `/public` routes.
    pub fn is_public(&self) -> bool {
        self.public
    }

    /// Location of the cookie-jar file.
    pub fn cookie_jar(&self) -> &Path {
        &self.cookie_jar
    }

    /// Extra headers sent with every request.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| ObsError::Config("cannot determine home directory".to_owned()))
}

fn ssh_public_key_path(name: &str) -> Result<PathBuf> {
    Ok(home_dir()?.join(".ssh").join(format!("{name}.pub")))
}

fn default_oscrc_path() -> Option<PathBuf> {
    let xdg = dirs::config_dir().map(|dir| dir.join("osc").join("oscrc"));
    let legacy = dirs::home_dir().map(|home| home.join(".oscrc"));
    match (xdg, legacy) {
        (Some(xdg), _) if xdg.is_file() => Some(xdg),
        (_, Some(legacy)) if legacy.is_file() => Some(legacy),
        _ => None,
    }
}

/// `$XDG_STATE_HOME/osc/cookiejar`, or `~/.local/state/osc/cookiejar`.
pub fn default_cookie_jar() -> PathBuf {
    dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("state")))
        .unwrap_or_default()
        .join("osc")
        .join("cookiejar")
}

/// The small INI dialect of oscrc files.
#[derive(Debug, Default)]
struct Ini {
    sections: HashMap<String, HashMap<String, String>>,
}

impl Ini {
    fn parse(text: &str) -> Self {
        let mut ini = Self::default();
        let mut current: Option<String> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                let name = name.trim().to_owned();
                ini.sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }

            let Some(section) = current.as_ref() else {
                continue;
            };
            let separator = line.find(|c: char| c == '=' || c == ':');
            if let Some((key, value)) = separator.map(|at| (&line[..at], &line[at + 1..])) {
                ini.sections
                    .entry(section.clone())
                    .or_default()
                    .insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
            }
        }

        ini
    }

    fn section(&self, name: &str) -> Option<&HashMap<String, String>> {
        self.sections.get(name)
    }

    fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)?.get(key).map(String::as_str)
    }
}
