use crate::models::{lower_hex, Network, TypedVoucher, Voucher, VoucherDomain};
use anyhow::{Context, Result};
use ethers::{
    signers::{LocalWallet, Signer},
    types::{Address, Signature, U256},
};
use serde_json::{json, Value};

/// Payer-side helper that signs vouchers with a local key.
#[derive(Clone)]
pub struct VoucherSigner {
    wallet: LocalWallet,
}

impl VoucherSigner {
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        let wallet = private_key
            .parse::<LocalWallet>()
            .context("Invalid payer private key")?;
        Ok(Self { wallet })
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Builds an unsigned voucher from this payer.
    pub fn voucher(&self, payee: Address, amount: U256, nonce: &str, valid_until: u64) -> Voucher {
        Voucher {
            payer: self.address(),
            payee,
            amount,
            nonce: nonce.to_string(),
            valid_until,
        }
    }

    pub async fn sign(&self, voucher: &Voucher, domain: VoucherDomain) -> Result<Signature> {
        let typed = TypedVoucher { voucher: voucher.clone(), domain };
        self.wallet
            .sign_typed_data(&typed)
            .await
            .context("Failed to sign voucher")
    }

    /// JSON body accepted by `POST /deferred/verify`.
    pub fn envelope(voucher: &Voucher, signature: &Signature, network: Network) -> Value {
        json!({
            "voucher": {
                "payer": lower_hex(&voucher.payer),
                "payee": lower_hex(&voucher.payee),
                "amount": voucher.amount.to_string(),
                "nonce": voucher.nonce,
                "validUntil": voucher.valid_until,
            },
            "signature": format!("0x{signature}"),
            "network": network,
        })
    }
}
