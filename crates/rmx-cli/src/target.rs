//! Resolving `[user@]host[:port]` targets into connection configs

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use rmx_core::config::{ClientConfig, ConnectionConfig, Credentials};

/// Environment variable consulted for password authentication
pub const PASSWORD_ENV: &str = "REMUX_PASSWORD";

/// A parsed `[user@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub username: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl Target {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let (username, rest) = match input.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => bail!("empty user name in '{}'", input),
            None => (None, input),
        };

        let (host, port) = match rest.rsplit_once(':') {
            // Bracketed IPv6 literal, optionally with a port
            _ if rest.starts_with('[') => match rest.find(']') {
                Some(end) => {
                    let host = &rest[1..end];
                    let port = match rest[end + 1..].strip_prefix(':') {
                        Some(port) => Some(parse_port(port)?),
                        None => None,
                    };
                    (host, port)
                }
                None => bail!("unterminated '[' in '{}'", input),
            },
            Some((host, port)) => (host, Some(parse_port(port)?)),
            None => (rest, None),
        };

        if host.is_empty() {
            bail!("missing host in '{}'", input);
        }
        Ok(Self {
            username,
            host: host.to_string(),
            port,
        })
    }
}

fn parse_port(text: &str) -> Result<u16> {
    text.parse()
        .with_context(|| format!("invalid port '{}'", text))
}

/// Authentication flags shared by every remote command
#[derive(Debug, Clone, Default, clap::Args)]
pub struct AuthArgs {
    /// Private key file
    #[arg(short = 'i', long)]
    pub identity: Option<PathBuf>,

    /// Passphrase for the private key
    #[arg(long, env = "REMUX_KEY_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,

    /// Password (also tried after the key when both are given)
    #[arg(long, env = "REMUX_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

/// Build a connection config for `target`, which is either a host profile
/// name from the config file or a `[user@]host[:port]` string
pub fn connection_config(
    target: &str,
    auth: &AuthArgs,
    settings: &ClientConfig,
) -> Result<ConnectionConfig> {
    let (host, port, username, identity) = match settings.hosts.get(target) {
        Some(profile) => (
            profile.host.clone(),
            profile.port,
            profile.username.clone(),
            profile.identity_file.clone(),
        ),
        None => {
            let parsed = Target::parse(target)?;
            (
                parsed.host,
                parsed.port.unwrap_or(rmx_core::config::DEFAULT_SSH_PORT),
                parsed.username,
                None,
            )
        }
    };

    let identity = auth.identity.clone().or(identity).or_else(default_identity);
    let private_key = match &identity {
        Some(path) => Some(read_key(path)?),
        None => None,
    };
    let credentials = Credentials {
        private_key,
        passphrase: auth.passphrase.clone(),
        password: auth.password.clone(),
    };
    if credentials.is_empty() {
        bail!(
            "no credentials for {}: pass --identity or set {}",
            target,
            PASSWORD_ENV
        );
    }

    let username = username.unwrap_or_else(whoami::username);
    Ok(ConnectionConfig::new(host, username, credentials)
        .with_id(target)
        .with_port(port))
}

fn read_key(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read private key {}", path.display()))
}

/// First of the usual key files that exists
fn default_identity() -> Option<PathBuf> {
    let ssh_dir = std::env::var_os("HOME").map(PathBuf::from)?.join(".ssh");
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmx_core::config::HostProfile;

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            Target::parse("dev@build.example.com:2222").unwrap(),
            Target {
                username: Some("dev".into()),
                host: "build.example.com".into(),
                port: Some(2222),
            }
        );
        assert_eq!(Target::parse("box").unwrap().port, None);
        assert_eq!(Target::parse("[::1]:22").unwrap().host, "::1");
        assert!(Target::parse("dev@").is_err());
        assert!(Target::parse("host:notaport").is_err());
        assert!(Target::parse("@host").is_err());
    }

    #[test]
    fn test_password_target() {
        let auth = AuthArgs {
            identity: Some(PathBuf::from("/no/such/key")),
            ..AuthArgs::default()
        };
        assert!(connection_config("dev@host", &auth, &ClientConfig::default()).is_err());

        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_test");
        std::fs::write(&key, "not really a key").unwrap();
        let auth = AuthArgs {
            identity: Some(key),
            password: Some("pw".into()),
            ..AuthArgs::default()
        };
        let config = connection_config("dev@host:2200", &auth, &ClientConfig::default()).unwrap();
        assert_eq!(config.username, "dev");
        assert_eq!(config.port, 2200);
        assert_eq!(config.id.as_deref(), Some("dev@host:2200"));
        assert!(config.credentials.private_key.is_some());
    }

    #[test]
    fn test_host_profile_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_profile");
        std::fs::write(&key, "key").unwrap();

        let mut settings = ClientConfig::default();
        settings.hosts.insert(
            "build".into(),
            HostProfile {
                host: "10.0.0.5".into(),
                port: 2022,
                username: Some("ci".into()),
                identity_file: Some(key),
            },
        );
        let config = connection_config("build", &AuthArgs::default(), &settings).unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 2022);
        assert_eq!(config.username, "ci");
    }
}
