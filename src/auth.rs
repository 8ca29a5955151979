//! Registry credentials from the local Docker client configuration.

use base64::Engine;
use bollard::auth::DockerCredentials;
use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Key Docker uses for Docker Hub in `config.json`.
pub const DOCKER_HUB: &str = "https://index.docker.io/v1/";

/// Resolves credentials for the registry an image is pulled from.
pub type AuthLookup = Arc<dyn Fn(&str) -> Option<DockerCredentials> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("HOME is not set")]
    NoHome,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid credentials JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid base64 auth entry: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Auth entry is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("Invalid auth format")]
    InvalidFormat,
    #[error("Credential helper {0} failed")]
    Helper(String),
}

#[derive(serde::Deserialize, Debug, Default)]
struct AuthEntry {
    auth: Option<String>,
}

#[derive(serde::Deserialize, Debug, Default)]
struct DockerConfig {
    auths: Option<HashMap<String, AuthEntry>>,
    #[serde(rename = "credsHelpers")]
    creds_helpers: Option<HashMap<String, String>>,
    #[serde(rename = "credsStore")]
    creds_store: Option<String>,
}

fn get_docker_config_path() -> Result<PathBuf, AuthError> {
    if let Ok(dir) = env::var("DOCKER_CONFIG") {
        return Ok(PathBuf::from(dir).join("config.json"));
    }
    let home_dir = env::var("HOME").map_err(|_| AuthError::NoHome)?;
    Ok(PathBuf::from(home_dir).join(".docker").join("config.json"))
}

fn read_docker_config() -> Result<DockerConfig, AuthError> {
    let file = BufReader::new(File::open(get_docker_config_path()?)?);
    Ok(serde_json::from_reader(file)?)
}

#[derive(serde::Deserialize)]
struct CredStoreOutput {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

fn call_credential_helper(helper: &str, registry: &str) -> Result<(String, String), AuthError> {
    let command = format!("docker-credential-{}", helper);
    let mut process = Command::new(&command)
        .arg("get")
        .stderr(Stdio::piped())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;

    let mut stdin = process
        .stdin
        .take()
        .ok_or_else(|| AuthError::Helper(command.clone()))?;
    stdin.write_all(registry.as_bytes())?;
    drop(stdin);

    let output = process.wait_with_output()?;
    if !output.status.success() {
        return Err(AuthError::Helper(command));
    }
    let creds: CredStoreOutput = serde_json::from_slice(&output.stdout)?;
    Ok((creds.username, creds.secret))
}

fn decode_auth(auth: &str) -> Result<(String, String), AuthError> {
    let decoded = base64::prelude::BASE64_STANDARD.decode(auth)?;
    let decoded_str = String::from_utf8(decoded)?;
    // Passwords may contain ':'
    let (username, password) = decoded_str
        .split_once(':')
        .ok_or(AuthError::InvalidFormat)?;
    Ok((username.to_string(), password.to_string()))
}

fn credentials_from(
    config: DockerConfig,
    registry: &str,
) -> Result<Option<(String, String)>, AuthError> {
    if let Some(helper) = config
        .creds_helpers
        .as_ref()
        .and_then(|helpers| helpers.get(registry))
    {
        return call_credential_helper(helper, registry).map(Some);
    }

    if let Some(helper) = config.creds_store.as_deref() {
        return call_credential_helper(helper, registry).map(Some);
    }

    // Fallback to plain text credentials from "auths"
    config
        .auths
        .as_ref()
        .and_then(|auths| auths.get(registry))
        .and_then(|entry| entry.auth.as_deref())
        .map(decode_auth)
        .transpose()
}

/// Registry host `image` is pulled from, as keyed in `config.json`.
pub fn registry_of(image: &str) -> &str {
    match image.split_once('/') {
        Some((host, _)) if host.contains(['.', ':']) || host == "localhost" => host,
        _ => DOCKER_HUB,
    }
}

pub fn get_docker_credentials(registry: &str) -> Result<Option<DockerCredentials>, AuthError> {
    let credentials = credentials_from(read_docker_config()?, registry)?;
    Ok(credentials.map(|(username, password)| DockerCredentials {
        username: Some(username),
        password: Some(password),
        serveraddress: Some(registry.to_string()),
        ..Default::default()
    }))
}

/// Lookup reading the Docker client configuration on every pull, so a
/// `docker login` on the host takes effect without a restart.
pub fn default_lookup() -> AuthLookup {
    Arc::new(|image: &str| {
        let registry = registry_of(image);
        match get_docker_credentials(registry) {
            Ok(credentials) => credentials,
            Err(AuthError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                log::warn!("Error retrieving credentials for {registry}: {e}");
                None
            }
        }
    })
}
