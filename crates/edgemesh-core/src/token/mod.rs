//! Scoped token generation and validation for the four caller kinds named
//! in spec.md section 6: bootstrap (worker registration), node (worker
//! liveness/claim), job (producer submission), admin (operator surface).
//!
//! Generalizes the teacher's `gator_core::token` HMAC-SHA256 scoped-token
//! module: same prefix+payload+hex-HMAC wire format and constant-time
//! verification, extended from a single (task_id, attempt) scope to four
//! independently keyed token kinds.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::ids::{NodeId, TaskId};

type HmacSha256 = Hmac<Sha256>;

const BOOTSTRAP_PREFIX: &str = "edgemesh_bs_";
const NODE_PREFIX: &str = "edgemesh_nt_";
const JOB_PREFIX: &str = "edgemesh_jt_";
const ADMIN_PREFIX: &str = "edgemesh_ad_";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("token HMAC verification failed")]
    HmacMismatch,

    #[error("missing token secret")]
    MissingSecret,

    #[error("token expired")]
    Expired,

    #[error("token already used (replay)")]
    Replayed,

    #[error("token is not scoped to the requested node")]
    NodeMismatch,

    #[error("token is not scoped to the requested task")]
    JobMismatch,
}

/// HMAC secret for one token kind.
#[derive(Debug, Clone)]
pub struct TokenSecret(Vec<u8>);

impl TokenSecret {
    pub fn new(secret: Vec<u8>) -> Self {
        Self(secret)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, TokenError> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| TokenError::InvalidFormat(format!("not valid hex: {e}")))?;
        Ok(Self(bytes))
    }
}

fn compute_hmac(secret: &TokenSecret, message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(&secret.0).expect("HMAC accepts a key of any size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn verify_hmac(secret: &TokenSecret, message: &[u8], provided_hex: &str) -> Result<(), TokenError> {
    let provided = hex::decode(provided_hex)
        .map_err(|e| TokenError::InvalidFormat(format!("invalid hex in hmac: {e}")))?;
    let mut mac = HmacSha256::new_from_slice(&secret.0).expect("HMAC accepts a key of any size");
    mac.update(message);
    mac.verify_slice(&provided).map_err(|_| TokenError::HmacMismatch)
}

fn rsplit_once_underscore<'a>(s: &'a str, what: &str) -> Result<(&'a str, &'a str), TokenError> {
    s.rsplit_once('_')
        .ok_or_else(|| TokenError::InvalidFormat(format!("expected underscore before {what}")))
}

/// Bootstrap token: a single shared secret presented by a worker to
/// register for the first time. Unscoped (no subject), since nothing
/// about the caller is known yet.
pub fn issue_bootstrap_token(secret: &TokenSecret) -> String {
    let mac = compute_hmac(secret, b"bootstrap");
    format!("{BOOTSTRAP_PREFIX}{}", hex::encode(mac))
}

pub fn validate_bootstrap_token(secret: &TokenSecret, token: &str) -> Result<(), TokenError> {
    let hmac_hex = token
        .strip_prefix(BOOTSTRAP_PREFIX)
        .ok_or_else(|| TokenError::InvalidFormat("bad bootstrap token prefix".to_string()))?;
    verify_hmac(secret, b"bootstrap", hmac_hex)
}

/// Claims carried by a validated node token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTokenClaims {
    pub node_id: NodeId,
    pub expires_at_unix_ms: i64,
}

/// Issue a node token scoped to `node_id`, expiring `ttl_ms` from `now`.
pub fn issue_node_token(secret: &TokenSecret, node_id: &NodeId, now_unix_ms: i64, ttl_ms: i64) -> String {
    let expires_at = now_unix_ms + ttl_ms;
    let message = format!("{node_id}:{expires_at}");
    let mac = compute_hmac(secret, message.as_bytes());
    format!("{NODE_PREFIX}{node_id}_{expires_at}_{}", hex::encode(mac))
}

/// Validate a node token, checking both its signature and expiry, and
/// that it is scoped to the node the caller claims to be.
pub fn validate_node_token(
    secret: &TokenSecret,
    token: &str,
    expected_node_id: &NodeId,
    now_unix_ms: i64,
) -> Result<NodeTokenClaims, TokenError> {
    let rest = token
        .strip_prefix(NODE_PREFIX)
        .ok_or_else(|| TokenError::InvalidFormat("bad node token prefix".to_string()))?;
    let (node_and_expiry, hmac_hex) = rsplit_once_underscore(rest, "hmac")?;
    let (node_id_str, expires_at_str) = rsplit_once_underscore(node_and_expiry, "expiry")?;

    let expires_at: i64 = expires_at_str
        .parse()
        .map_err(|_| TokenError::InvalidFormat("invalid expiry".to_string()))?;

    let message = format!("{node_id_str}:{expires_at}");
    verify_hmac(secret, message.as_bytes(), hmac_hex)?;

    if expires_at <= now_unix_ms {
        return Err(TokenError::Expired);
    }

    let node_id = NodeId::new(node_id_str);
    if &node_id != expected_node_id {
        return Err(TokenError::NodeMismatch);
    }

    Ok(NodeTokenClaims { node_id, expires_at_unix_ms: expires_at })
}

/// Claims carried by a validated job token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTokenClaims {
    pub task_id: TaskId,
    pub nonce: String,
}

/// Issue a job token scoped to `task_id`, single-use via a random nonce
/// that [`ReplayCache`] rejects on reuse (spec.md's job-token
/// replay-cache policy).
pub fn issue_job_token(secret: &TokenSecret, task_id: TaskId) -> String {
    let mut nonce_bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = hex::encode(nonce_bytes);
    let message = format!("{task_id}:{nonce}");
    let mac = compute_hmac(secret, message.as_bytes());
    format!("{JOB_PREFIX}{task_id}_{nonce}_{}", hex::encode(mac))
}

pub fn validate_job_token(
    secret: &TokenSecret,
    token: &str,
    expected_task_id: TaskId,
) -> Result<JobTokenClaims, TokenError> {
    let rest = token
        .strip_prefix(JOB_PREFIX)
        .ok_or_else(|| TokenError::InvalidFormat("bad job token prefix".to_string()))?;
    let (task_and_nonce, hmac_hex) = rsplit_once_underscore(rest, "hmac")?;
    let (task_id_str, nonce) = rsplit_once_underscore(task_and_nonce, "nonce")?;

    let task_id: TaskId = task_id_str
        .parse()
        .map_err(|_| TokenError::InvalidFormat("invalid task id".to_string()))?;

    let message = format!("{task_id}:{nonce}");
    verify_hmac(secret, message.as_bytes(), hmac_hex)?;

    if task_id != expected_task_id {
        return Err(TokenError::JobMismatch);
    }

    Ok(JobTokenClaims { task_id, nonce: nonce.to_string() })
}

/// Claims carried by a validated admin token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminTokenClaims {
    pub subject: String,
    pub expires_at_unix_ms: i64,
}

pub fn issue_admin_token(secret: &TokenSecret, subject: &str, now_unix_ms: i64, ttl_ms: i64) -> String {
    let expires_at = now_unix_ms + ttl_ms;
    let message = format!("{subject}:{expires_at}");
    let mac = compute_hmac(secret, message.as_bytes());
    format!("{ADMIN_PREFIX}{subject}_{expires_at}_{}", hex::encode(mac))
}

pub fn validate_admin_token(secret: &TokenSecret, token: &str, now_unix_ms: i64) -> Result<AdminTokenClaims, TokenError> {
    let rest = token
        .strip_prefix(ADMIN_PREFIX)
        .ok_or_else(|| TokenError::InvalidFormat("bad admin token prefix".to_string()))?;
    let (subject_and_expiry, hmac_hex) = rsplit_once_underscore(rest, "hmac")?;
    let (subject, expires_at_str) = rsplit_once_underscore(subject_and_expiry, "expiry")?;

    let expires_at: i64 = expires_at_str
        .parse()
        .map_err(|_| TokenError::InvalidFormat("invalid expiry".to_string()))?;

    let message = format!("{subject}:{expires_at}");
    verify_hmac(secret, message.as_bytes(), hmac_hex)?;

    if expires_at <= now_unix_ms {
        return Err(TokenError::Expired);
    }

    Ok(AdminTokenClaims { subject: subject.to_string(), expires_at_unix_ms: expires_at })
}

/// Rejects job tokens whose nonce has already been consumed. Bounded by a
/// capacity so it cannot grow unboundedly; once full, the oldest nonces
/// are evicted on a FIFO basis (matching the bus's bounded-subscriber
/// philosophy: bound everything that accumulates over the process
/// lifetime).
pub struct ReplayCache {
    capacity: usize,
    seen: std::sync::Mutex<std::collections::VecDeque<String>>,
}

impl ReplayCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: std::sync::Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
        }
    }

    /// Returns `Err(TokenError::Replayed)` if this nonce has been seen
    /// before; otherwise records it and returns `Ok(())`.
    pub fn check_and_record(&self, nonce: &str) -> Result<(), TokenError> {
        let mut seen = self.seen.lock().expect("replay cache mutex poisoned");
        if seen.iter().any(|s| s == nonce) {
            return Err(TokenError::Replayed);
        }
        if seen.len() >= self.capacity {
            seen.pop_front();
        }
        seen.push_back(nonce.to_string());
        Ok(())
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}
