use alloy::primitives::{
    utils::{format_units, parse_units},
    Address, U256,
};
use anyhow::{anyhow, Result};
use std::str::FromStr;

/// Validates and normalizes an Ethereum address
pub fn validate_address(address: &str) -> Result<Address> {
    let address = address.trim();

    if address.is_empty() {
        return Err(anyhow!("Address cannot be empty"));
    }

    if !address.starts_with("0x") && !address.starts_with("0X") {
        return Err(anyhow!(
            "Invalid address format: '{}'. Ethereum addresses must start with '0x'",
            address
        ));
    }

    if address.len() != 42 {
        return Err(anyhow!(
            "Invalid address length: '{}'. Ethereum addresses must be exactly 42 characters (0x + 40 hex characters)",
            address
        ));
    }

    let hex_part = &address[2..];
    if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!(
            "Invalid address format: '{}'. Contains non-hexadecimal characters",
            address
        ));
    }

    // Alloy's parser accepts any casing; comparisons happen on the bytes.
    Address::from_str(address)
        .map_err(|e| anyhow!("Invalid Ethereum address: '{}'. Error: {}", address, e))
}

/// Validates network name
pub fn validate_network(network: &str, available_networks: &[String]) -> Result<()> {
    if network.is_empty() {
        return Err(anyhow!("Network name cannot be empty"));
    }

    if !available_networks.contains(&network.to_string()) {
        return Err(anyhow!(
            "Unknown network: '{}'. Available networks: {}",
            network,
            available_networks.join(", ")
        ));
    }

    Ok(())
}

/// Converts a human-readable amount into raw token units (`amount * 10^decimals`)
/// using integer arithmetic only.
pub fn scale_up(amount: &str, decimals: u8) -> Result<U256> {
    let amount = amount.trim();

    if amount.is_empty() {
        return Err(anyhow!("Amount cannot be empty"));
    }

    if amount.starts_with('-') {
        return Err(anyhow!("Amount cannot be negative: '{}'", amount));
    }

    if let Some((_, fraction)) = amount.split_once('.') {
        if fraction.len() > decimals as usize {
            return Err(anyhow!(
                "Amount '{}' has more than {} decimal places",
                amount,
                decimals
            ));
        }
    }

    let parsed = parse_units(amount, decimals)
        .map_err(|e| anyhow!("Invalid amount '{}': {}", amount, e))?;

    if parsed.is_negative() {
        return Err(anyhow!("Amount cannot be negative: '{}'", amount));
    }

    Ok(parsed.get_absolute())
}

/// Converts raw token units back into a human-readable decimal string with
/// no trailing fractional zeros.
pub fn scale_down(raw: U256, decimals: u8) -> Result<String> {
    let formatted = format_units(raw, decimals)
        .map_err(|e| anyhow!("Cannot format {} with {} decimals: {}", raw, decimals, e))?;

    Ok(trim_fraction(&formatted))
}

fn trim_fraction(formatted: &str) -> String {
    match formatted.split_once('.') {
        Some((integer, fraction)) => {
            let fraction = fraction.trim_end_matches('0');
            if fraction.is_empty() {
                integer.to_string()
            } else {
                format!("{}.{}", integer, fraction)
            }
        }
        None => formatted.to_string(),
    }
}

/// Wall-clock milliseconds since the epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Creates user-friendly error messages for common RPC errors
pub fn interpret_rpc_error(error: &str) -> String {
    if error.contains("user rejected") || error.contains("User denied") {
        "Transaction rejected: The signer refused to sign the transaction.".to_string()
    } else if error.contains("execution reverted") {
        format!(
            "Transaction failed: The contract function reverted execution. {}",
            if error.contains("cap exceeded") {
                "Minting this amount would exceed the token's max supply."
            } else if error.contains("revert") {
                "This usually means the function's requirements were not met or an assertion failed."
            } else {
                "Check your parameters and try again."
            }
        )
    } else if error.contains("insufficient funds") {
        "Transaction failed: Insufficient funds to cover gas costs. Make sure your account has enough native currency for gas fees.".to_string()
    } else if error.contains("gas required exceeds allowance") || error.contains("out of gas") {
        "Transaction failed: Gas limit too low. Increase the configured gas limit for this network."
            .to_string()
    } else if error.contains("nonce too low") {
        "Transaction failed: Nonce too low. This usually means another transaction was already mined with this nonce.".to_string()
    } else if error.contains("replacement transaction underpriced") {
        "Transaction failed: Gas price too low to replace pending transaction. Increase the gas price.".to_string()
    } else if error.contains("connection refused") || error.contains("network unreachable") {
        "Network error: Cannot connect to RPC endpoint. Check your internet connection and RPC URL configuration.".to_string()
    } else if error.contains("timeout") || error.contains("timed out") {
        "Network error: Request timed out. The RPC endpoint may be overloaded or unreachable."
            .to_string()
    } else if error.contains("rate limit") || error.contains("429") {
        "Rate limit error: Too many requests to the RPC endpoint. Try again in a few moments or use a different endpoint.".to_string()
    } else if error.contains("method not found") {
        "RPC error: The requested method is not supported by this RPC endpoint. Try using a different endpoint.".to_string()
    } else {
        format!("RPC error: {}", error)
    }
}
