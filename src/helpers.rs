use rand::Rng;
use sha2::{Digest, Sha256};

// ── Naming helpers ────────────────────────────────────────────────────────────

/// Suffixes appended to generated object names.
pub const SERVICE_SUFFIX: &str = "service";
pub const INGRESS_SUFFIX: &str = "ingress";
pub const DEPLOYMENT_SUFFIX: &str = "deployment";
pub const SECRET_SUFFIX: &str = "secret";
pub const PVC_SUFFIX: &str = "pvc";

/// `<resourceName>-<qualifier>-<suffix>`, the name of every per-qualifier child object.
pub fn standard_name(resource_name: &str, qualifier: &str, suffix: &str) -> String {
    format!("{resource_name}-{qualifier}-{suffix}")
}

/// `<resourceName>-ingress`: one Ingress per custom resource, shared by its qualifiers.
pub fn ingress_name(resource_name: &str) -> String {
    format!("{resource_name}-{INGRESS_SUFFIX}")
}

/// `<resourceName>-admin-secret`.
pub fn admin_secret_name(resource_name: &str) -> String {
    format!("{resource_name}-admin-secret")
}

/// `<resourceName>-<schemaQualifier>-secret`.
pub fn schema_secret_name(resource_name: &str, schema_qualifier: &str) -> String {
    standard_name(resource_name, schema_qualifier, SECRET_SUFFIX)
}

/// `<clientId>-secret`, where a confidential Keycloak client's credentials live.
pub fn keycloak_client_secret_name(client_id: &str) -> String {
    format!("{client_id}-{SECRET_SUFFIX}")
}

/// Label value shared by a Deployment, its pods and the Service selecting them.
pub fn deployment_label(resource_name: &str, qualifier: &str) -> String {
    format!("{resource_name}-{qualifier}")
}

/// Turn a Kubernetes name into a SQL-safe identifier: lowercase alphanumerics,
/// everything else becomes an underscore.
pub fn sanitise_identifier(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Database username for a schema, capped at `max_len` characters. Truncated
/// names get a short hash suffix so two long names cannot collide.
pub fn schema_username(resource_name: &str, schema_qualifier: &str, max_len: usize) -> String {
    let full = sanitise_identifier(&format!("{resource_name}_{schema_qualifier}"));
    if full.len() <= max_len {
        return full;
    }
    let hash = &sha256_hex(&full)[..6];
    let keep = max_len.saturating_sub(hash.len() + 1);
    format!("{}_{hash}", &full[..keep])
}

// ── Credentials ───────────────────────────────────────────────────────────────

/// Generate a cryptographically random 32-hex-char password.
pub fn generate_password() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 hash of a string, returned as hex.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ── Resource quantities ───────────────────────────────────────────────────────

/// Apply a request-to-limit ratio to a quantity string such as `768Mi` or
/// `1500m`. The numeric part is multiplied and truncated to three decimal
/// digits; the unit is reattached unchanged. Returns `None` when the quantity
/// has no leading number.
pub fn apply_ratio(limit: &str, ratio: f64) -> Option<String> {
    let split = limit
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(limit.len());
    let (number, unit) = limit.split_at(split);
    let value: f64 = number.parse().ok()?;
    // The epsilon absorbs binary representation error before truncation.
    let truncated = ((value * ratio * 1000.0) + 1e-6).floor() / 1000.0;
    Some(format!("{truncated}{unit}"))
}
