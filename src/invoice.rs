//! bolt11 invoice amount extraction for zap receipts.

/// Extract the amount in satoshis from a bolt11 invoice string.
///
/// Returns `(sats, true)` when the human-readable part carries a parsable
/// amount, `(0, false)` otherwise. Amounts below one satoshi round down.
pub fn amount_sats(invoice: &str) -> (u64, bool) {
    let lower = invoice.trim().to_lowercase();
    // The bech32 charset excludes '1', so the last '1' separates the
    // human-readable part from the data part.
    let hrp = match lower.rfind('1') {
        Some(sep) => &lower[..sep],
        None => return (0, false),
    };
    let amount_part = match ["lnbcrt", "lnbc", "lntb"]
        .iter()
        .find_map(|p| hrp.strip_prefix(p))
    {
        Some(r) => r,
        None => return (0, false),
    };
    if amount_part.is_empty() {
        return (0, false);
    }
    let (digits, multiplier) = match amount_part.as_bytes().last() {
        Some(b'm' | b'u' | b'n' | b'p') => {
            let (d, m) = amount_part.split_at(amount_part.len() - 1);
            (d, m.as_bytes()[0])
        }
        _ => (amount_part, 0),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return (0, false);
    }
    let amount: u64 = match digits.parse() {
        Ok(a) => a,
        Err(_) => return (0, false),
    };
    // Millisatoshis per unit of the HRP amount field (1 BTC = 1e11 msat).
    let msat = match multiplier {
        b'm' => amount.checked_mul(100_000_000),
        b'u' => amount.checked_mul(100_000),
        b'n' => amount.checked_mul(100),
        b'p' => Some(amount / 10),
        _ => amount.checked_mul(100_000_000_000),
    };
    match msat {
        Some(m) => (m / 1_000, true),
        None => (0, false),
    }
}
