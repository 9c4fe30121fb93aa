use anyhow::{Result, anyhow};

/// Shape check FCM applies to registration tokens. Fails before any network call.
pub fn validate_device_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(anyhow!("Device token cannot be empty"));
    }

    if token.len() < 20 {
        return Err(anyhow!("Device token too short (minimum 20 characters)"));
    }

    if token.len() > 4096 {
        return Err(anyhow!("Device token too long (maximum 4096 characters)"));
    }

    let valid_chars = token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.'));

    if !valid_chars {
        return Err(anyhow!("Device token contains invalid characters"));
    }

    Ok(())
}
