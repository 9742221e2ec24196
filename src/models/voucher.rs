use crate::models::{amount, Network};
use chrono::{DateTime, Utc};
use ethers::{
    abi::{self, Token},
    types::{transaction::eip712::{EIP712Domain, Eip712}, Address, U256},
    utils::keccak256,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use uuid::Uuid;

pub const DEFERRED_SCHEME: &str = "deferred";

pub const VOUCHER_DOMAIN_NAME: &str = "x402 Deferred Voucher";
pub const VOUCHER_DOMAIN_VERSION: &str = "1";

const VOUCHER_TYPE: &str =
    "Voucher(address payer,address payee,uint256 amount,bytes nonce,uint256 validUntil)";

/// A structurally valid voucher, as signed by the payer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voucher {
    pub payer: Address,
    pub payee: Address,
    pub amount: U256,
    pub nonce: String,
    /// Unix seconds.
    pub valid_until: u64,
}

impl Voucher {
    /// Bytes the nonce contributes to the signed message: hex-decoded when it is
    /// `0x`-prefixed hex, otherwise its UTF-8 encoding.
    pub fn nonce_bytes(&self) -> Vec<u8> {
        nonce_bytes(&self.nonce)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.valid_until)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

pub fn nonce_bytes(nonce: &str) -> Vec<u8> {
    match nonce.strip_prefix("0x") {
        Some(body) if !body.is_empty() => {
            hex::decode(body).unwrap_or_else(|_| nonce.as_bytes().to_vec())
        }
        _ => nonce.as_bytes().to_vec(),
    }
}

/// Uniqueness key for a nonce: lowercase hex of the bytes that are actually signed.
/// Spellings that sign the same bytes (`"jb"`, `"0x6a62"`, `"0x6A62"`) share one key.
pub fn canonical_nonce(nonce: &str) -> String {
    format!("0x{}", hex::encode(nonce_bytes(nonce)))
}

/// Domain parameters a voucher signature is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoucherDomain {
    pub chain_id: u64,
    pub token: Address,
}

impl VoucherDomain {
    pub fn eip712(&self) -> EIP712Domain {
        EIP712Domain {
            name: Some(VOUCHER_DOMAIN_NAME.to_string()),
            version: Some(VOUCHER_DOMAIN_VERSION.to_string()),
            chain_id: Some(U256::from(self.chain_id)),
            verifying_contract: Some(self.token),
            salt: None,
        }
    }
}

/// A voucher paired with its domain, hashable per EIP-712.
#[derive(Debug, Clone)]
pub struct TypedVoucher {
    pub voucher: Voucher,
    pub domain: VoucherDomain,
}

impl Eip712 for TypedVoucher {
    type Error = Infallible;

    fn domain(&self) -> Result<EIP712Domain, Self::Error> {
        Ok(self.domain.eip712())
    }

    fn type_hash() -> Result<[u8; 32], Self::Error> {
        Ok(keccak256(VOUCHER_TYPE))
    }

    fn struct_hash(&self) -> Result<[u8; 32], Self::Error> {
        let encoded = abi::encode(&[
            Token::FixedBytes(Self::type_hash()?.to_vec()),
            Token::Address(self.voucher.payer),
            Token::Address(self.voucher.payee),
            Token::Uint(self.voucher.amount),
            Token::FixedBytes(keccak256(self.voucher.nonce_bytes()).to_vec()),
            Token::Uint(U256::from(self.voucher.valid_until)),
        ]);
        Ok(keccak256(encoded))
    }
}

/// Voucher fields exactly as received. Each is untyped so the validator can report
/// every malformed field rather than failing on the first one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawVoucher {
    #[serde(default)]
    pub payer: Option<serde_json::Value>,
    #[serde(default)]
    pub payee: Option<serde_json::Value>,
    #[serde(default)]
    pub amount: Option<serde_json::Value>,
    #[serde(default)]
    pub nonce: Option<serde_json::Value>,
    #[serde(default)]
    pub valid_until: Option<serde_json::Value>,
}

/// Body of `POST /deferred/verify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub voucher: RawVoucher,
    pub signature: String,
    pub network: Network,
}

/// Persisted voucher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoucherRecord {
    pub id: Uuid,
    pub payer: Address,
    pub payee: Address,
    #[serde(with = "amount::decimal")]
    pub amount: U256,
    pub nonce: String,
    pub signature: String,
    pub valid_until: DateTime<Utc>,
    pub settled: bool,
    pub network: Network,
    pub scheme: String,
    pub created_at: DateTime<Utc>,
}

impl VoucherRecord {
    pub fn from_new(id: Uuid, new: NewVoucherRecord, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            payer: new.payer,
            payee: new.payee,
            amount: new.amount,
            nonce: new.nonce,
            signature: new.signature,
            valid_until: new.valid_until,
            settled: false,
            network: new.network,
            scheme: new.scheme,
            created_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until <= now
    }

    /// The voucher as originally signed.
    pub fn voucher(&self) -> Voucher {
        Voucher {
            payer: self.payer,
            payee: self.payee,
            amount: self.amount,
            nonce: self.nonce.clone(),
            valid_until: u64::try_from(self.valid_until.timestamp()).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewVoucherRecord {
    pub payer: Address,
    pub payee: Address,
    pub amount: U256,
    pub nonce: String,
    pub signature: String,
    pub valid_until: DateTime<Utc>,
    pub network: Network,
    pub scheme: String,
}

/// Address rendered the way records store it: `0x` + lowercase hex.
pub fn lower_hex(address: &Address) -> String {
    format!("{address:?}")
}
