/// Number of leading key characters used to derive a user id.
const USER_ID_PREFIX_CHARS: usize = 8;

/// Equality check for API keys that takes the same time wherever the keys
/// differ. Only a length mismatch returns early, which reveals the key length
/// and nothing else.
pub fn secrets_match(expected: &str, presented: &str) -> bool {
    let (expected, presented) = (expected.as_bytes(), presented.as_bytes());
    expected.len() == presented.len()
        && expected
            .iter()
            .zip(presented)
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

/// Deterministic user id for a credential that carries no explicit one.
pub fn derive_user_id(credential: &str) -> String {
    let prefix: String = credential.chars().take(USER_ID_PREFIX_CHARS).collect();
    format!("user_{prefix}")
}
