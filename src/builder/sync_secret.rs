//! Derived credential secret for a Sync
//!
//! Flattens the literal credentials of both sinks into environment-style
//! keys. A distributed sync additionally gets an SSH keypair so its workers
//! can reach each other.

use std::collections::BTreeMap;

use aws_lc_rs::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::{JuiceFsSync, SyncSink};
use crate::naming::sync_secret_name;
use crate::Error;

/// Private key entry of a distributed sync secret
pub const KEY_SSH_PRIVATE: &str = "id_rsa";
/// Public key entry of a distributed sync secret
pub const KEY_SSH_PUBLIC: &str = "id_rsa.pub";

const SSH_KEY_TYPE: &str = "ecdsa-sha2-nistp256";
const SSH_CURVE: &str = "nistp256";

/// A freshly generated SSH keypair
#[derive(Clone, Debug)]
pub struct SshKeyPair {
    /// PKCS#8 private key, PEM encoded
    pub private_pem: String,
    /// OpenSSH `authorized_keys` line
    pub public_line: String,
}

/// Generate an ECDSA P-256 keypair for sync workers
pub fn generate_ssh_keypair() -> Result<SshKeyPair, Error> {
    let key = rcgen::KeyPair::generate()
        .map_err(|e| Error::internal_with_context(format!("key generation failed: {e}"), "keygen"))?;
    let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &key.serialize_der())
        .map_err(|e| Error::internal_with_context(format!("generated key rejected: {e}"), "keygen"))?;

    Ok(SshKeyPair {
        private_pem: key.serialize_pem(),
        public_line: openssh_public_line(pair.public_key().as_ref()),
    })
}

fn put_ssh_string(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

/// `ecdsa-sha2-nistp256 <base64 blob>` for an uncompressed P-256 point
fn openssh_public_line(point: &[u8]) -> String {
    let mut blob = Vec::with_capacity(19 + 12 + point.len() + 12);
    put_ssh_string(&mut blob, SSH_KEY_TYPE.as_bytes());
    put_ssh_string(&mut blob, SSH_CURVE.as_bytes());
    put_ssh_string(&mut blob, point);
    format!("{SSH_KEY_TYPE} {}", STANDARD.encode(blob))
}

fn insert_non_empty(data: &mut BTreeMap<String, String>, key: String, value: &str) {
    if !value.is_empty() {
        data.insert(key, value.to_string());
    }
}

fn sink_credentials(data: &mut BTreeMap<String, String>, side: &str, sink: &SyncSink) {
    if let Some(jfs) = &sink.juicefs {
        insert_non_empty(data, format!("JUICEFS_{side}_TOKEN"), &jfs.token.value);
        insert_non_empty(data, format!("JUICEFS_{side}_ACCESS_KEY"), &jfs.access_key.value);
        insert_non_empty(data, format!("JUICEFS_{side}_SECRET_KEY"), &jfs.secret_key.value);
    }
    if let Some(ext) = &sink.external {
        insert_non_empty(data, format!("EXTERNAL_{side}_ACCESS_KEY"), &ext.access_key.value);
        insert_non_empty(data, format!("EXTERNAL_{side}_SECRET_KEY"), &ext.secret_key.value);
    }
}

/// Credential entries of a sync, without the SSH keypair
pub fn sync_credentials(sync: &JuiceFsSync) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    sink_credentials(&mut data, "FROM", &sync.spec.from);
    sink_credentials(&mut data, "TO", &sync.spec.to);
    data
}

/// Build the derived secret for a Sync
pub fn build_sync_secret(sync: &JuiceFsSync) -> Result<Secret, Error> {
    let owner = sync
        .controller_owner_ref(&())
        .ok_or_else(|| Error::internal_with_context("Sync has no UID", "sync-secret"))?;

    let mut data = sync_credentials(sync);
    if sync.spec.is_distributed() {
        let keys = generate_ssh_keypair()?;
        data.insert(KEY_SSH_PRIVATE.to_string(), keys.private_pem);
        data.insert(KEY_SSH_PUBLIC.to_string(), keys.public_line);
    }

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(sync_secret_name(&sync.name_any())),
            namespace: sync.namespace(),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        string_data: Some(data),
        ..Default::default()
    })
}
