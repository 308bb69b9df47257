//! Keypair bootstrap: in-cluster `Secret` lookup/creation, or a local PEM
//! file when running outside the cluster. Either path always ends with the
//! resolved private key written to `cfg.signing_key_path` with owner-only
//! permissions, so the in-process `CredentialService` and any co-located
//! tooling read the same material from disk.

use std::collections::BTreeMap;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use rsa::RsaPrivateKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::EncodePublicKey;

use super::{CredentialError, CredentialService};
use crate::config::Config;

const IDENTITY_SECRET_NAME: &str = "agentland-identity";
const PUBLIC_SECRET_NAME: &str = "agentland-public-key";
const PRIVATE_KEY_FIELD: &str = "private.pem";
const PUBLIC_KEY_FIELD: &str = "public.pem";

/// Resolves (generating if necessary) the signing keypair and builds the
/// `CredentialService` from it. `client` is `Some` when running in-cluster.
pub async fn bootstrap(
    client: Option<&Client>,
    cfg: &Config,
) -> Result<CredentialService, CredentialError> {
    let (private_pem, public_pem) = match client {
        Some(client) => bootstrap_in_cluster(client, cfg).await?,
        None => bootstrap_out_of_cluster(&cfg.signing_key_path)?,
    };

    write_private_key(&cfg.signing_key_path, &private_pem)?;

    CredentialService::from_pem(
        private_pem.as_bytes(),
        public_pem.as_bytes(),
        &cfg.issuer,
        &cfg.audience,
        &cfg.kid,
        cfg.token_ttl,
        cfg.clock_skew,
    )
}

async fn bootstrap_in_cluster(
    client: &Client,
    cfg: &Config,
) -> Result<(String, String), CredentialError> {
    let identity: Api<Secret> = Api::namespaced(client.clone(), &cfg.gateway_namespace);

    if let Ok(secret) = identity.get(IDENTITY_SECRET_NAME).await {
        let private_pem = secret_field(&secret, PRIVATE_KEY_FIELD)?;
        let public_pem = secret_field(&secret, PUBLIC_KEY_FIELD)?;
        return Ok((private_pem, public_pem));
    }

    let (private_pem, public_pem) = generate_keypair()?;

    let mut data = BTreeMap::new();
    data.insert(
        PRIVATE_KEY_FIELD.to_owned(),
        ByteString(private_pem.clone().into_bytes()),
    );
    data.insert(
        PUBLIC_KEY_FIELD.to_owned(),
        ByteString(public_pem.clone().into_bytes()),
    );
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(IDENTITY_SECRET_NAME.to_owned()),
            namespace: Some(cfg.gateway_namespace.clone()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };
    identity
        .create(&PostParams::default(), &secret)
        .await
        .map_err(|_| CredentialError::KeyNotLoaded)?;

    publish_public_key(client, &cfg.sandbox_namespace, &public_pem).await?;

    Ok((private_pem, public_pem))
}

/// Publishes (or updates) the public-key-only secret mounted read-only into
/// every sandbox pod. Idempotent — called again on every gateway restart.
async fn publish_public_key(
    client: &Client,
    sandbox_namespace: &str,
    public_pem: &str,
) -> Result<(), CredentialError> {
    let sandbox_secrets: Api<Secret> = Api::namespaced(client.clone(), sandbox_namespace);
    let mut data = BTreeMap::new();
    data.insert(
        PUBLIC_KEY_FIELD.to_owned(),
        ByteString(public_pem.as_bytes().to_vec()),
    );
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(PUBLIC_SECRET_NAME.to_owned()),
            namespace: Some(sandbox_namespace.to_owned()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };
    sandbox_secrets
        .patch(
            PUBLIC_SECRET_NAME,
            &PatchParams::apply("agentland-gateway"),
            &Patch::Apply(&secret),
        )
        .await
        .map_err(|_| CredentialError::KeyNotLoaded)?;
    Ok(())
}

fn secret_field(secret: &Secret, field: &str) -> Result<String, CredentialError> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(field))
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        .ok_or(CredentialError::KeyNotLoaded)
}

fn bootstrap_out_of_cluster(signing_key_path: &str) -> Result<(String, String), CredentialError> {
    let private_path = Path::new(signing_key_path);
    let public_path = sibling_public_path(private_path);

    if private_path.exists() && public_path.exists() {
        let private_pem =
            std::fs::read_to_string(private_path).map_err(|_| CredentialError::KeyNotLoaded)?;
        let public_pem =
            std::fs::read_to_string(&public_path).map_err(|_| CredentialError::KeyNotLoaded)?;
        return Ok((private_pem, public_pem));
    }

    let (private_pem, public_pem) = generate_keypair()?;
    if let Some(parent) = public_path.parent() {
        std::fs::create_dir_all(parent).map_err(|_| CredentialError::KeyNotLoaded)?;
    }
    std::fs::write(&public_path, &public_pem).map_err(|_| CredentialError::KeyNotLoaded)?;
    Ok((private_pem, public_pem))
}

fn sibling_public_path(private_path: &Path) -> std::path::PathBuf {
    private_path.with_file_name("public.pem")
}

fn generate_keypair() -> Result<(String, String), CredentialError> {
    let mut rng = rand::rngs::OsRng;
    let private = RsaPrivateKey::new(&mut rng, 2048).map_err(|_| CredentialError::KeyNotLoaded)?;
    let public = private.to_public_key();
    let private_pem = private
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .map_err(|_| CredentialError::KeyNotLoaded)?
        .to_string();
    let public_pem = public
        .to_public_key_pem(rsa::pkcs1::LineEnding::LF)
        .map_err(|_| CredentialError::KeyNotLoaded)?;
    Ok((private_pem, public_pem))
}

fn write_private_key(path: &str, pem: &str) -> Result<(), CredentialError> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|_| CredentialError::KeyNotLoaded)?;
    }
    std::fs::write(path, pem).map_err(|_| CredentialError::KeyNotLoaded)?;

    #[cfg(unix)]
    {
        let mut perms = std::fs::metadata(path)
            .map_err(|_| CredentialError::KeyNotLoaded)?
            .permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms).map_err(|_| CredentialError::KeyNotLoaded)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_cluster_generates_then_reuses_keypair() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("private.pem");
        let key_path_str = key_path.to_str().unwrap();

        let (priv1, pub1) = bootstrap_out_of_cluster(key_path_str).unwrap();
        assert!(priv1.contains("PRIVATE KEY"));
        assert!(pub1.contains("PUBLIC KEY"));

        // Generation only writes the public half; simulate the private half
        // being persisted by `write_private_key` as `bootstrap()` would.
        write_private_key(key_path_str, &priv1).unwrap();

        let (priv2, pub2) = bootstrap_out_of_cluster(key_path_str).unwrap();
        assert_eq!(priv1, priv2);
        assert_eq!(pub1, pub2);
    }

    #[test]
    #[cfg(unix)]
    fn write_private_key_sets_owner_only_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("private.pem");
        write_private_key(key_path.to_str().unwrap(), "fake-pem").unwrap();
        let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn sibling_public_path_replaces_file_name() {
        let path = sibling_public_path(Path::new("/var/run/agentland/private.pem"));
        assert_eq!(path, Path::new("/var/run/agentland/public.pem"));
    }
}
