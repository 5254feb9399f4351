use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

#[derive(Clone, Serialize, Deserialize)]
pub struct AgentKeypair {
    pub public_bs58: String, // ed25519:BASE58
    #[serde(default)]
    pub private_hex: String, // hex-encoded ed25519 private key
}

impl fmt::Debug for AgentKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentKeypair")
            .field("public_bs58", &self.public_bs58)
            .field("private_hex", &"<redacted>")
            .finish()
    }
}

impl AgentKeypair {
    pub fn generate() -> Self {
        use ed25519_dalek::SigningKey;
        use rand::rngs::OsRng;
        let signing = SigningKey::generate(&mut OsRng);
        let verify = signing.verifying_key();
        let public_bs58 = format!("ed25519:{}", bs58::encode(verify.to_bytes()).into_string());
        let private_hex = hex::encode(signing.to_bytes());
        Self { public_bs58, private_hex }
    }

    pub fn from_private_hex(hex_str: &str) -> anyhow::Result<Self> {
        let signing = signing_key(hex_str)?;
        let verify = signing.verifying_key();
        let public_bs58 = format!("ed25519:{}", bs58::encode(verify.to_bytes()).into_string());
        Ok(Self { public_bs58, private_hex: hex_str.to_string() })
    }
}

fn signing_key(private_hex: &str) -> anyhow::Result<ed25519_dalek::SigningKey> {
    if private_hex.trim().is_empty() {
        anyhow::bail!("agent private key missing; delete `agent.key.json` to regenerate it");
    }
    let sk_bytes = hex::decode(private_hex.trim())?;
    let sk_array: [u8; 32] = sk_bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("bad key len: expected 32-byte ed25519 private key"))?;
    Ok(ed25519_dalek::SigningKey::from_bytes(&sk_array))
}

pub fn sign_bytes_ed25519(private_hex: &str, data: &[u8]) -> anyhow::Result<Vec<u8>> {
    use ed25519_dalek::Signer;
    let signing = signing_key(private_hex)?;
    Ok(signing.sign(data).to_bytes().to_vec())
}

pub fn verify_bytes_ed25519(public_bs58: &str, data: &[u8], signature: &[u8]) -> anyhow::Result<bool> {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};
    let without_prefix = public_bs58.strip_prefix("ed25519:").unwrap_or(public_bs58);
    let pk_bytes = bs58::decode(without_prefix).into_vec()?;
    let vk = VerifyingKey::from_bytes(pk_bytes.as_slice().try_into().map_err(|_| anyhow::anyhow!("bad pub len"))?)?;
    let sig = Signature::from_bytes(signature.try_into().map_err(|_| anyhow::anyhow!("bad sig len"))?);
    Ok(vk.verify(data, &sig).is_ok())
}

/// Claims carried by a device credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceClaims {
    /// Registry identifier of the device.
    pub sub: String,
    /// Agent that issued the credential.
    pub agent: String,
    pub iat: u64,
    pub exp: u64,
}

/// Issue a credential scoped to one device: `base64(claims).base64(signature)`.
pub fn issue_device_token(
    keypair: &AgentKeypair,
    device_id: &str,
    agent_id: &str,
    ttl_secs: u64,
) -> anyhow::Result<String> {
    let iat = crate::now_millis() / 1000;
    let claims = DeviceClaims {
        sub: device_id.to_string(),
        agent: agent_id.to_string(),
        iat,
        exp: iat + ttl_secs,
    };
    let payload = serde_json::to_vec(&claims)?;
    let sig = sign_bytes_ed25519(&keypair.private_hex, &payload)?;
    Ok(format!("{}.{}", B64.encode(&payload), B64.encode(sig)))
}

/// Check the signature and expiry of a device credential and return its claims.
pub fn verify_device_token(public_bs58: &str, token: &str) -> anyhow::Result<DeviceClaims> {
    let (payload_b64, sig_b64) = token
        .split_once('.')
        .ok_or_else(|| anyhow::anyhow!("malformed device token"))?;
    let payload = B64.decode(payload_b64)?;
    let sig = B64.decode(sig_b64)?;
    if !verify_bytes_ed25519(public_bs58, &payload, &sig)? {
        anyhow::bail!("invalid device token signature");
    }
    let claims: DeviceClaims = serde_json::from_slice(&payload)?;
    if crate::now_millis() / 1000 > claims.exp {
        anyhow::bail!("device token expired");
    }
    Ok(claims)
}
