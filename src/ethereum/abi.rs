use alloy::{
    primitives::{Bytes, U256},
    sol,
    sol_types::{sol_data, SolType},
};
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::path::Path;
use tokio::fs;
use tracing::debug;

use super::TokenData;

sol! {
    /// Capped, owner-mintable ERC-20 with on-chain branding fields. Every
    /// read below must succeed for a contract to be recognized as one of ours.
    interface ICustomToken {
        function name() external view returns (string memory);
        function symbol() external view returns (string memory);
        function decimals() external view returns (uint8);
        function totalSupply() external view returns (uint256);
        function cap() external view returns (uint256);
        function logoUrl() external view returns (string memory);
        function description() external view returns (string memory);
        function mint(address to, uint256 amount) external;
    }
}

/// Constructor parameters: `(name, symbol, decimals, initialSupply, maxSupply, logoUrl, description)`.
pub type ConstructorArgs = (
    sol_data::String,
    sol_data::String,
    sol_data::Uint<8>,
    sol_data::Uint<256>,
    sol_data::Uint<256>,
    sol_data::String,
    sol_data::String,
);

/// Appends the ABI-encoded constructor arguments to the creation bytecode.
///
/// Constructor order: `(name, symbol, decimals, initialSupply, maxSupply, logoUrl, description)`.
pub fn encode_deployment(
    bytecode: &Bytes,
    token: &TokenData,
    initial_supply: U256,
    max_supply: U256,
) -> Bytes {
    let args = ConstructorArgs::abi_encode_params(&(
        token.name.clone(),
        token.symbol.clone(),
        token.decimals,
        initial_supply,
        max_supply,
        token.logo.clone(),
        token.description.clone(),
    ));

    [&bytecode[..], args.as_slice()].concat().into()
}

/// Load creation bytecode from a compiled artifact.
///
/// Accepts a Hardhat artifact (`"bytecode": "0x…"`), a Foundry artifact
/// (`"bytecode": {"object": "0x…"}`) or a plain hex file.
pub async fn load_bytecode<P: AsRef<Path>>(path: P) -> Result<Bytes> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| anyhow!("Failed to read token artifact {:?}: {}", path, e))?;

    let bytecode = parse_bytecode(&content)
        .map_err(|e| anyhow!("Invalid token artifact {:?}: {}", path, e))?;

    debug!("Loaded {} bytes of creation code from {:?}", bytecode.len(), path);
    Ok(bytecode)
}

fn parse_bytecode(content: &str) -> Result<Bytes> {
    let trimmed = content.trim();

    let hex_str = if trimmed.starts_with('{') {
        let artifact: Value = serde_json::from_str(trimmed)
            .map_err(|e| anyhow!("Failed to parse artifact JSON: {}", e))?;

        match &artifact["bytecode"] {
            Value::String(code) => code.clone(),
            Value::Object(obj) => obj
                .get("object")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| anyhow!("Artifact bytecode object has no 'object' field"))?,
            _ => return Err(anyhow!("Artifact has no 'bytecode' field")),
        }
    } else {
        trimmed.to_string()
    };

    let code = hex::decode(hex_str.trim().trim_start_matches("0x"))
        .map_err(|e| anyhow!("Bytecode is not valid hex: {}", e))?;

    if code.is_empty() {
        return Err(anyhow!("Bytecode is empty"));
    }

    Ok(code.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::SolCall;
    use tempfile::tempdir;

    fn token() -> TokenData {
        TokenData {
            name: "Test".to_string(),
            symbol: "TST".to_string(),
            decimals: 18,
            initial_supply: "1000000".to_string(),
            max_supply: "10000000".to_string(),
            logo: "https://example.com/logo.png".to_string(),
            description: "A test token".to_string(),
        }
    }

    #[test]
    fn test_encode_deployment_appends_constructor_args() {
        let bytecode = Bytes::from(vec![0x60, 0x80, 0x60, 0x40]);
        let (initial, max) = token().raw_supplies().unwrap();
        let encoded = encode_deployment(&bytecode, &token(), initial, max);

        assert_eq!(&encoded[..4], &bytecode[..]);

        let decoded = ConstructorArgs::abi_decode_params(&encoded[4..], true).unwrap();
        assert_eq!(decoded.0, "Test");
        assert_eq!(decoded.2, 18);
        assert_eq!(decoded.3, initial);
        assert_eq!(decoded.4, max);
        assert_eq!(decoded.6, "A test token");
    }

    #[test]
    fn test_mint_selector_matches_erc20_mint() {
        assert_eq!(ICustomToken::mintCall::SIGNATURE, "mint(address,uint256)");
        assert_eq!(ICustomToken::mintCall::SELECTOR, [0x40, 0xc1, 0x0f, 0x19]);
    }

    #[test]
    fn test_parse_bytecode_formats() {
        assert_eq!(parse_bytecode("0x6080").unwrap().to_vec(), vec![0x60, 0x80]);
        assert_eq!(
            parse_bytecode(r#"{"bytecode": "0x6080"}"#).unwrap().to_vec(),
            vec![0x60, 0x80]
        );
        assert_eq!(
            parse_bytecode(r#"{"bytecode": {"object": "0x6080"}}"#)
                .unwrap()
                .to_vec(),
            vec![0x60, 0x80]
        );
        assert!(parse_bytecode(r#"{"abi": []}"#).is_err());
        assert!(parse_bytecode("0x").is_err());
        assert!(parse_bytecode("zz").is_err());
    }

    #[tokio::test]
    async fn test_load_bytecode_from_artifact_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("CustomToken.json");
        tokio::fs::write(&path, r#"{"contractName": "CustomToken", "bytecode": "0x60806040"}"#)
            .await
            .unwrap();

        let code = load_bytecode(&path).await.unwrap();
        assert_eq!(code.len(), 4);

        assert!(load_bytecode(temp_dir.path().join("missing.json")).await.is_err());
    }
}
