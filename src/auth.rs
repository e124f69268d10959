//! Authorization material and `WWW-Authenticate` negotiation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::cookies::unix_now;
use crate::wire::Challenge;
use crate::{ClientConfig, ObsError, Result};

/// Realm signed over when a `Signature` challenge does not name one.
pub const DEFAULT_REALM: &str = "Use your developer account";

const SIGNATURE_BEGIN: &str = "-----BEGIN SSH SIGNATURE-----\n";
const SIGNATURE_END: &str = "\n-----END SSH SIGNATURE-----";

/// Credentials attached to outgoing requests.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum AuthMaterial {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Signature {
        key_id: String,
        algorithm: String,
        headers: String,
        created: u64,
        /// Base64 SSH signature with line breaks removed.
        signature: String,
    },
}

impl AuthMaterial {
    /// Material a client starts with: Basic when a password is configured.
    ///
    /// Signature material only ever results from a challenge.
    pub fn initial(config: &ClientConfig) -> Self {
        match config.password() {
            Some(password) if !config.is_public() => Self::Basic {
                username: config.username().to_owned(),
                password: password.to_owned(),
            },
            _ => Self::None,
        }
    }

    /// `Authorization` header value, if any.
    pub fn header_value(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Basic { username, password } => Some(format!(
                "Basic {}",
                BASE64.encode(format!("{username}:{password}"))
            )),
            Self::Signature {
                key_id,
                algorithm,
                headers,
                created,
                signature,
            } => Some(format!(
                r#"Signature keyId="{}",algorithm="{}",headers="{}",created={created},signature="{signature}""#,
                quoted(key_id),
                quoted(algorithm),
                quoted(headers),
            )),
        }
    }

    /// Lowercase scheme name, `"none"` when unauthenticated.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic { .. } => "basic",
            Self::Signature { .. } => "signature",
        }
    }
}

/// Escapes `\` and `"` for use inside an auth-param quoted-string.
fn quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Signature {
                key_id, created, ..
            } => f
                .debug_struct("Signature")
                .field("key_id", key_id)
                .field("created", created)
                .field("signature", &"<redacted>")
                .finish(),
        }
    }
}

/// Produces an armored SSH signature over `data` in the namespace `realm`.
///
/// Implementations return the full `-----BEGIN SSH SIGNATURE-----` block.
#[async_trait]
pub trait SshSigner: Send + Sync {
    async fn sign(&self, key_path: &Path, realm: &str, data: &str) -> Result<String>;
}

/// Signs by running `ssh-keygen -Y sign`.
#[derive(Clone, Debug)]
pub struct SshKeygenSigner {
    program: PathBuf,
}

impl SshKeygenSigner {
    /// Uses a specific `ssh-keygen` binary instead of the one on `PATH`.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SshKeygenSigner {
    fn default() -> Self {
        Self::with_program("ssh-keygen")
    }
}

#[async_trait]
impl SshSigner for SshKeygenSigner {
    async fn sign(&self, key_path: &Path, realm: &str, data: &str) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(["-Y", "sign", "-f"])
            .arg(key_path)
            .args(["-n", realm, "-q"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ObsError::Signing(format!("cannot run {}: {err}", self.program.display()))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ObsError::Signing("ssh-keygen stdin unavailable".to_owned()))?;
        stdin
            .write_all(data.as_bytes())
            .await
            .map_err(|err| ObsError::Signing(format!("cannot write to ssh-keygen: {err}")))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| ObsError::Signing(format!("ssh-keygen did not finish: {err}")))?;
        if !output.status.success() {
            return Err(ObsError::Signing(format!(
                "ssh-keygen exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|_| ObsError::Signing("ssh-keygen output is not UTF-8".to_owned()))
    }
}

/// Picks an auth scheme from the server's challenges and builds its material.
///
/// `Signature` wins when offered and an SSH key is configured, then `Basic`
/// when offered and a password is configured. `Ok(None)` means no offered
/// scheme can be satisfied.
pub async fn negotiate(
    challenges: &[Challenge],
    config: &ClientConfig,
    signer: &dyn SshSigner,
) -> Result<Option<AuthMaterial>> {
    let offered = |scheme: &str| challenges.iter().find(|challenge| challenge.scheme == scheme);

    if let (Some(challenge), Some(key_path)) = (offered("signature"), config.ssh_key_path()) {
        let realm = challenge.param("realm").unwrap_or(DEFAULT_REALM);
        debug!(realm, key = %key_path.display(), "answering signature challenge");
        let material = sign_challenge(config.username(), key_path, realm, signer).await?;
        return Ok(Some(material));
    }

    if let (Some(_), Some(password)) = (offered("basic"), config.password()) {
        debug!("answering basic challenge");
        return Ok(Some(AuthMaterial::Basic {
            username: config.username().to_owned(),
            password: password.to_owned(),
        }));
    }

    debug!(
        offered = ?challenges.iter().map(|c| c.scheme.as_str()).collect::<Vec<_>>(),
        "no usable authentication scheme offered"
    );
    Ok(None)
}

async fn sign_challenge(
    username: &str,
    key_path: &Path,
    realm: &str,
    signer: &dyn SshSigner,
) -> Result<AuthMaterial> {
    let created = unix_now();
    let armored = signer
        .sign(key_path, realm, &format!("(created): {created}"))
        .await?;

    Ok(AuthMaterial::Signature {
        key_id: username.to_owned(),
        algorithm: "ssh".to_owned(),
        headers: "(created)".to_owned(),
        created,
        signature: unarmor_signature(&armored)?,
    })
}

/// Extracts the base64 payload of an armored SSH signature, joined onto one line.
fn unarmor_signature(armored: &str) -> Result<String> {
    let invalid = || ObsError::Signing(format!("ssh-keygen output did not match: {armored:?}"));

    let body = armored.strip_prefix(SIGNATURE_BEGIN).ok_or_else(invalid)?;
    let end = body.find(SIGNATURE_END).ok_or_else(invalid)?;
    let signature: String = body[..end]
        .chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .collect();
    if signature.is_empty() {
        return Err(invalid());
    }
    Ok(signature)
}
