use super::{StoreError, VoucherStore};
use crate::models::{
    canonical_nonce, lower_hex, Network, NewSettlementRecord, NewVoucherRecord, PendingSubmission,
    ReconciliationRecord, SettlementRecord, VoucherRecord,
};
use ::redis::{aio::ConnectionManager, AsyncCommands, Script};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use ethers::types::Address;
use uuid::Uuid;

const VOUCHER_PREFIX: &str = "deferred:voucher:";
const UNSETTLED_PREFIX: &str = "deferred:unsettled:";

// Settlement is decided by ZREM on the payee's unsettled index: exactly one caller
// removes a given member, so only that caller reports the id as flipped.
const MARK_SETTLED_SCRIPT: &str = r#"
local flipped = {}
for _, id in ipairs(ARGV) do
  local raw = redis.call('GET', 'deferred:voucher:' .. id)
  if raw then
    local record = cjson.decode(raw)
    local index = 'deferred:unsettled:' .. record.network .. ':' .. record.payee
    if redis.call('ZREM', index, id) == 1 then
      record.settled = true
      redis.call('SET', 'deferred:voucher:' .. id, cjson.encode(record))
      table.insert(flipped, id)
    end
  end
end
return flipped
"#;

// Nonce reservation, record and unsettled index are written together or not at all,
// so a failed insert never leaves a reserved nonce without its voucher.
// KEYS: nonce, voucher, unsettled index. ARGV: id, record json, score.
const STORE_VOUCHER_SCRIPT: &str = r#"
if not redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  return 0
end
redis.call('SET', KEYS[2], ARGV[2])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return 1
"#;

/// Redis-backed store for multi-instance deployments.
pub struct RedisVoucherStore {
    conn: ConnectionManager,
    store_voucher: Script,
    mark_settled: Script,
}

impl RedisVoucherStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = ::redis::Client::open(redis_url).context("Invalid REDIS_URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("Redis connection failed")?;
        tracing::info!("Redis voucher store connected");

        Ok(Self {
            conn,
            store_voucher: Script::new(STORE_VOUCHER_SCRIPT),
            mark_settled: Script::new(MARK_SETTLED_SCRIPT),
        })
    }

    fn voucher_key(id: Uuid) -> String {
        format!("{VOUCHER_PREFIX}{id}")
    }

    fn nonce_key(network: Network, nonce: &str) -> String {
        format!("deferred:nonce:{network}:{}", canonical_nonce(nonce))
    }

    fn unsettled_key(network: Network, payee: &Address) -> String {
        format!("{UNSETTLED_PREFIX}{network}:{}", lower_hex(payee))
    }

    fn settlement_key(id: Uuid) -> String {
        format!("deferred:settlement:{id}")
    }

    fn pending_key(network: Network, payee: &Address) -> String {
        format!("deferred:pending:{network}:{}", lower_hex(payee))
    }

    fn reconciliation_key(network: Network, payee: &Address) -> String {
        format!("deferred:reconciliation:{network}:{}", lower_hex(payee))
    }

    async fn load_vouchers(&self, ids: &[String]) -> Result<Vec<VoucherRecord>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| format!("{VOUCHER_PREFIX}{id}")).collect();
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = ::redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl VoucherStore for RedisVoucherStore {
    async fn store_voucher(&self, voucher: NewVoucherRecord) -> Result<VoucherRecord, StoreError> {
        let record = VoucherRecord::from_new(Uuid::new_v4(), voucher, Utc::now());
        let json = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();

        let inserted: i64 = self
            .store_voucher
            .key(Self::nonce_key(record.network, &record.nonce))
            .key(Self::voucher_key(record.id))
            .key(Self::unsettled_key(record.network, &record.payee))
            .arg(record.id.to_string())
            .arg(json)
            .arg(record.created_at.timestamp_micros())
            .invoke_async(&mut conn)
            .await?;
        if inserted == 0 {
            return Err(StoreError::Conflict { nonce: record.nonce, network: record.network });
        }

        Ok(record)
    }

    async fn get_voucher(&self, id: Uuid) -> Result<Option<VoucherRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::voucher_key(id)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn get_by_nonce(
        &self,
        nonce: &str,
        network: Network,
    ) -> Result<Option<VoucherRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn.get(Self::nonce_key(network, nonce)).await?;
        match id {
            Some(id) => Ok(self.load_vouchers(&[id]).await?.into_iter().next()),
            None => Ok(None),
        }
    }

    async fn get_unsettled(
        &self,
        payer: Option<Address>,
        payee: Address,
        network: Network,
    ) -> Result<Vec<VoucherRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrange(Self::unsettled_key(network, &payee), 0, -1)
            .await?;

        Ok(self
            .load_vouchers(&ids)
            .await?
            .into_iter()
            .filter(|r| !r.settled && payer.map_or(true, |p| r.payer == p))
            .collect())
    }

    async fn mark_settled(&self, ids: &[Uuid]) -> Result<Vec<Uuid>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut invocation = self.mark_settled.prepare_invoke();
        for id in ids {
            invocation.arg(id.to_string());
        }

        let mut conn = self.conn.clone();
        let flipped: Vec<String> = invocation.invoke_async(&mut conn).await?;
        flipped
            .iter()
            .map(|id| {
                Uuid::parse_str(id).map_err(|e| StoreError::Backend(format!("bad voucher id {id}: {e}")))
            })
            .collect()
    }

    async fn store_settlement(
        &self,
        settlement: NewSettlementRecord,
    ) -> Result<SettlementRecord, StoreError> {
        let record = SettlementRecord::from_new(Uuid::new_v4(), settlement, Utc::now());
        let json = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(Self::settlement_key(record.id), json).await?;
        Ok(record)
    }

    async fn get_settlement(&self, id: Uuid) -> Result<Option<SettlementRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::settlement_key(id)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn record_pending(&self, submission: PendingSubmission) -> Result<(), StoreError> {
        let json = serde_json::to_string(&submission)?;
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(
            Self::pending_key(submission.network, &submission.payee),
            format!("{:?}", submission.tx_hash),
            json,
        )
        .await?;
        Ok(())
    }

    async fn pending_submissions(
        &self,
        payee: Address,
        network: Network,
    ) -> Result<Vec<PendingSubmission>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.hvals(Self::pending_key(network, &payee)).await?;
        let mut pending = raw
            .iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect::<Result<Vec<PendingSubmission>, _>>()?;
        pending.sort_by_key(|p| p.broadcast_at);
        Ok(pending)
    }

    async fn clear_pending(&self, submission: &PendingSubmission) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(
            Self::pending_key(submission.network, &submission.payee),
            format!("{:?}", submission.tx_hash),
        )
        .await?;
        Ok(())
    }

    async fn record_reconciliation(&self, record: ReconciliationRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(
            Self::reconciliation_key(record.network, &record.payee),
            format!("{:?}", record.tx_hash),
            json,
        )
        .await?;
        Ok(())
    }

    async fn reconciliations(
        &self,
        payee: Address,
        network: Network,
    ) -> Result<Vec<ReconciliationRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.hvals(Self::reconciliation_key(network, &payee)).await?;
        let mut records = raw
            .iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect::<Result<Vec<ReconciliationRecord>, _>>()?;
        records.sort_by_key(|r| r.recorded_at);
        Ok(records)
    }

    async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        ::redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DEFERRED_SCHEME;
    use ethers::types::U256;

    fn new_voucher(nonce: &str, payee: Address) -> NewVoucherRecord {
        NewVoucherRecord {
            payer: Address::repeat_byte(1),
            payee,
            amount: U256::from(10u64),
            nonce: nonce.to_string(),
            signature: "0x00".to_string(),
            valid_until: Utc::now() + chrono::Duration::hours(1),
            network: Network::Celo,
            scheme: DEFERRED_SCHEME.to_string(),
        }
    }

    #[tokio::test]
    #[ignore = "needs a running Redis at REDIS_URL"]
    async fn test_insert_writes_reservation_record_and_index_together() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let store = RedisVoucherStore::new(&url).await.unwrap();
        let payee = Address::from_low_u64_be(Utc::now().timestamp_micros() as u64);
        let nonce = format!("0x{}", hex::encode(Uuid::new_v4().as_bytes()));

        let stored = store.store_voucher(new_voucher(&nonce, payee)).await.unwrap();
        let shouted = format!("0x{}", nonce[2..].to_uppercase());
        let found = store.get_by_nonce(&shouted, Network::Celo).await.unwrap();
        assert_eq!(found.map(|r| r.id), Some(stored.id));

        let err = store.store_voucher(new_voucher(&nonce, payee)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let unsettled = store.get_unsettled(None, payee, Network::Celo).await.unwrap();
        assert_eq!(unsettled.iter().map(|r| r.id).collect::<Vec<_>>(), vec![stored.id]);
    }
}
