use anyhow::{bail, Context, Result};
use deferred_x402::client::voucher::VoucherSigner;
use deferred_x402::models::{Network, SupportedResponse, VoucherDomain};
use ethers::types::{Address, U256};
use reqwest::Client;
use serde_json::{json, Value};
use std::str::FromStr;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    dotenvy::dotenv().ok();

    let base_url = std::env::var("FACILITATOR_URL")
        .unwrap_or_else(|_| "http://localhost:3005".to_string());
    let payer_key = std::env::var("PAYER_PRIVATE_KEY").context("PAYER_PRIVATE_KEY required")?;
    let payee = Address::from_str(&std::env::var("PAYEE_ADDRESS").context("PAYEE_ADDRESS required")?)
        .context("Invalid PAYEE_ADDRESS")?;
    let network = Network::from_str(
        &std::env::var("NETWORK").unwrap_or_else(|_| "celo-sepolia".to_string()),
    )?;
    let count: u32 = std::env::var("VOUCHER_COUNT")
        .unwrap_or_else(|_| "3".to_string())
        .parse()
        .context("Invalid VOUCHER_COUNT")?;
    let amount = U256::from_dec_str(
        &std::env::var("VOUCHER_AMOUNT").unwrap_or_else(|_| "1000000".to_string()),
    )
    .map_err(|e| anyhow::anyhow!("Invalid VOUCHER_AMOUNT: {e:?}"))?;
    let settle = std::env::var("SETTLE").map(|v| v == "true").unwrap_or(false);

    let signer = VoucherSigner::from_private_key(&payer_key)?;
    let client = Client::new();

    println!("Deferred Voucher Test Agent");
    println!("===========================");
    println!("Facilitator: {}", base_url);
    println!("Network: {}", network);
    println!("Payer: {:?}", signer.address());
    println!("Payee: {:?}", payee);
    println!();

    let domain = fetch_domain(&client, &base_url, network).await?;
    println!("Signing domain: chainId {} token {:?}", domain.chain_id, domain.token);
    println!();

    let run_id = chrono::Utc::now().timestamp_millis();
    let valid_until = (chrono::Utc::now().timestamp() + 1800) as u64;

    for i in 0..count {
        let nonce = format!("agent-{run_id}-{i}");
        let voucher = signer.voucher(payee, amount, &nonce, valid_until);
        let signature = signer.sign(&voucher, domain).await?;
        let body = VoucherSigner::envelope(&voucher, &signature, network);

        println!("Step 1.{}: Verifying voucher {} for {}...", i + 1, nonce, amount);
        let response = post(&client, &format!("{base_url}/deferred/verify"), &body).await?;
        println!("   [OK] voucherId {}", response["voucherId"]);
    }
    println!();

    println!("Step 2: Checking accumulated balance...");
    let balance: Value = client
        .get(format!("{base_url}/deferred/balance/{payee:?}"))
        .query(&[("network", network.as_str())])
        .send()
        .await?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&balance)?);
    println!();

    if !settle {
        println!("Set SETTLE=true to aggregate and settle on-chain.");
        return Ok(());
    }

    println!("Step 3: Settling...");
    let body = json!({
        "payee": format!("{payee:?}"),
        "payer": format!("{:?}", signer.address()),
        "network": network,
    });
    match post(&client, &format!("{base_url}/deferred/settle"), &body).await {
        Ok(data) => {
            println!("[SUCCESS] Settlement confirmed:");
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Err(e) => {
            println!("[FAILED] {}", e);
        }
    }

    Ok(())
}

async fn fetch_domain(client: &Client, base_url: &str, network: Network) -> Result<VoucherDomain> {
    let supported: SupportedResponse = client
        .get(format!("{base_url}/supported"))
        .send()
        .await?
        .json()
        .await
        .context("Unexpected /supported response")?;

    let kind = supported
        .kinds
        .into_iter()
        .find(|k| k.network_id == network)
        .with_context(|| format!("Facilitator does not support {network}"))?;

    Ok(VoucherDomain { chain_id: kind.extra.chain_id, token: kind.extra.verifying_contract })
}

async fn post(client: &Client, url: &str, body: &Value) -> Result<Value> {
    let response = client.post(url).json(body).send().await?;
    let status = response.status();
    let data: Value = response.json().await?;

    if !status.is_success() {
        bail!(
            "{} {} (authorization_state: {})",
            status,
            data["error"],
            data["authorizationState"]
        );
    }
    Ok(data)
}
