//! Structural and signature validation of incoming vouchers.
//!
//! Both checks are pure: they depend only on the request, the current time and the
//! per-network domain parameters loaded at startup.

use crate::error::DeferredError;
use crate::models::{amount::parse_decimal, Network, RawVoucher, TypedVoucher, Voucher, VoucherDomain};
use chrono::{DateTime, Utc};
use ethers::types::{transaction::eip712::Eip712, Address, Signature, H256, U256};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self { field: field.to_string(), message: message.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<FieldError>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Output of a successful structural check.
#[derive(Debug, Clone)]
pub struct StructuredVoucher {
    pub voucher: Voucher,
    pub signature: Signature,
    pub warnings: Vec<String>,
}

pub struct VoucherValidator {
    domains: HashMap<Network, VoucherDomain>,
    max_validity_secs: u64,
}

impl VoucherValidator {
    pub fn new(domains: HashMap<Network, VoucherDomain>, max_validity_secs: u64) -> Self {
        Self { domains, max_validity_secs }
    }

    pub fn domain(&self, network: Network) -> Result<VoucherDomain, DeferredError> {
        self.domains
            .get(&network)
            .copied()
            .ok_or_else(|| DeferredError::UnsupportedNetwork(network.to_string()))
    }

    /// Checks every field, collecting all problems before failing.
    pub fn check_structure(
        &self,
        raw: &RawVoucher,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<StructuredVoucher, ValidationReport> {
        let mut report = ValidationReport::default();

        let payer = parse_address("payer", raw.payer.as_ref(), &mut report);
        let payee = parse_address("payee", raw.payee.as_ref(), &mut report);
        let amount = parse_amount(raw.amount.as_ref(), &mut report);
        let nonce = parse_nonce(raw.nonce.as_ref(), &mut report);
        let valid_until = self.parse_valid_until(raw.valid_until.as_ref(), now, &mut report);
        let signature = parse_signature(signature, &mut report);

        if let (Some(payer), Some(payee)) = (payer, payee) {
            if payer == payee {
                report.warnings.push("payer and payee are the same address".to_string());
            }
        }

        match (payer, payee, amount, nonce, valid_until, signature) {
            (Some(payer), Some(payee), Some(amount), Some(nonce), Some(valid_until), Some(signature))
                if report.is_valid() =>
            {
                Ok(StructuredVoucher {
                    voucher: Voucher { payer, payee, amount, nonce, valid_until },
                    signature,
                    warnings: report.warnings,
                })
            }
            _ => Err(report),
        }
    }

    /// Recovers the signer over the network's domain and requires it to be the payer.
    pub fn verify_signature(
        &self,
        voucher: &Voucher,
        signature: &Signature,
        network: Network,
    ) -> Result<Address, DeferredError> {
        let domain = self.domain(network)?;
        let signer = recover_signer(voucher, domain, signature)?;

        if signer != voucher.payer {
            return Err(DeferredError::InvalidSignature(format!(
                "signer {signer:?} does not match payer {:?}",
                voucher.payer
            )));
        }

        Ok(signer)
    }

    fn parse_valid_until(
        &self,
        value: Option<&Value>,
        now: DateTime<Utc>,
        report: &mut ValidationReport,
    ) -> Option<u64> {
        let secs = match value {
            None | Some(Value::Null) => {
                report.errors.push(FieldError::new("validUntil", "missing"));
                return None;
            }
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse::<u64>().ok(),
            Some(_) => None,
        };

        let Some(secs) = secs else {
            report
                .errors
                .push(FieldError::new("validUntil", "must be a unix timestamp in seconds"));
            return None;
        };

        let representable = i64::try_from(secs)
            .ok()
            .and_then(|s| DateTime::from_timestamp(s, 0))
            .is_some();
        if !representable {
            report.errors.push(FieldError::new("validUntil", "timestamp is out of range"));
            return None;
        }

        let now_secs = u64::try_from(now.timestamp()).unwrap_or_default();
        if secs <= now_secs {
            report.errors.push(FieldError::new("validUntil", "voucher has already expired"));
            return None;
        }

        if secs - now_secs > self.max_validity_secs {
            report.warnings.push(format!(
                "validUntil is more than {}s in the future",
                self.max_validity_secs
            ));
        }

        Some(secs)
    }
}

/// EIP-712 signer recovery for a voucher under the given domain.
pub fn recover_signer(
    voucher: &Voucher,
    domain: VoucherDomain,
    signature: &Signature,
) -> Result<Address, DeferredError> {
    let typed = TypedVoucher { voucher: voucher.clone(), domain };
    let digest = match typed.encode_eip712() {
        Ok(digest) => digest,
        Err(never) => match never {},
    };

    signature
        .recover(H256::from(digest))
        .map_err(|e| DeferredError::InvalidSignature(e.to_string()))
}

fn parse_address(field: &str, value: Option<&Value>, report: &mut ValidationReport) -> Option<Address> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        report.errors.push(FieldError::new(field, "missing"));
        return None;
    };
    let Some(text) = value.as_str() else {
        report.errors.push(FieldError::new(field, "must be a string"));
        return None;
    };

    let well_formed = text.len() == 42
        && text.starts_with("0x")
        && text[2..].bytes().all(|b| b.is_ascii_hexdigit());
    if !well_formed {
        report
            .errors
            .push(FieldError::new(field, "must be a 0x-prefixed 20-byte hex address"));
        return None;
    }

    match Address::from_str(text) {
        Ok(address) => Some(address),
        Err(e) => {
            report.errors.push(FieldError::new(field, e.to_string()));
            None
        }
    }
}

fn parse_amount(value: Option<&Value>, report: &mut ValidationReport) -> Option<U256> {
    let amount = match value {
        None | Some(Value::Null) => {
            report.errors.push(FieldError::new("amount", "missing"));
            return None;
        }
        Some(Value::String(s)) => parse_decimal(s),
        Some(Value::Number(n)) => {
            report.warnings.push(
                "amount sent as a JSON number; send a decimal string to avoid precision loss"
                    .to_string(),
            );
            n.as_u64().map(U256::from)
        }
        Some(_) => None,
    };

    match amount {
        Some(amount) if amount.is_zero() => {
            report.errors.push(FieldError::new("amount", "must be greater than zero"));
            None
        }
        Some(amount) if amount > max_voucher_amount() => {
            report
                .errors
                .push(FieldError::new("amount", "must not exceed 2^128 - 1 base units"));
            None
        }
        Some(amount) => Some(amount),
        None => {
            report
                .errors
                .push(FieldError::new("amount", "must be a non-negative integer in base units"));
            None
        }
    }
}

/// Per-voucher ceiling. Keeps any realistic number of vouchers summable in 256 bits.
pub fn max_voucher_amount() -> U256 {
    U256::from(u128::MAX)
}

fn parse_nonce(value: Option<&Value>, report: &mut ValidationReport) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::String(_)) => {
            report.errors.push(FieldError::new("nonce", "must not be empty"));
            None
        }
        None | Some(Value::Null) => {
            report.errors.push(FieldError::new("nonce", "missing"));
            None
        }
        Some(_) => {
            report.errors.push(FieldError::new("nonce", "must be a string"));
            None
        }
    }
}

fn parse_signature(signature: &str, report: &mut ValidationReport) -> Option<Signature> {
    let body = signature.strip_prefix("0x").unwrap_or(signature);
    if body.len() != 130 || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
        report
            .errors
            .push(FieldError::new("signature", "must be 65 bytes of hex"));
        return None;
    }
    match Signature::from_str(signature) {
        Ok(sig) => Some(sig),
        Err(e) => {
            report.errors.push(FieldError::new("signature", e.to_string()));
            None
        }
    }
}
