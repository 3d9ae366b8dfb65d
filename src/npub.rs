//! bech32 codec for Nostr public keys.

use anyhow::{anyhow, Result};
use bech32::{Bech32, Hrp};

/// Encode a 32-byte hex pubkey as an `npub` string.
pub fn encode(hex_pubkey: &str) -> Result<String> {
    let bytes = hex::decode(hex_pubkey)?;
    if bytes.len() != 32 {
        return Err(anyhow!("pubkey must be 32 bytes, got {}", bytes.len()));
    }
    let hrp = Hrp::parse("npub")?;
    Ok(bech32::encode::<Bech32>(hrp, &bytes)?)
}

/// Decode an `npub` string to a hex pubkey.
pub fn decode(npub: &str) -> Result<String> {
    let (hrp, data) = bech32::decode(npub)?;
    if hrp.as_str() != "npub" {
        return Err(anyhow!("expected npub prefix, got {}", hrp));
    }
    if data.len() != 32 {
        return Err(anyhow!("npub payload must be 32 bytes, got {}", data.len()));
    }
    Ok(hex::encode(data))
}

/// Accept either a hex pubkey or an `npub` and return the hex form.
pub fn normalize(input: &str) -> Result<String> {
    let input = input.trim();
    if input.starts_with("npub1") {
        return decode(input);
    }
    if input.len() == 64 && input.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(input.to_lowercase());
    }
    Err(anyhow!("not a hex pubkey or npub: {input}"))
}
