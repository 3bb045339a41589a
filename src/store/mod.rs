//! Durable job records
//!
//! The record store is the sole source of truth that survives process
//! restarts: one hash record per workload holding the metadata the expiry
//! watchdog needs to tear the workload down, plus a parallel plain key whose
//! TTL mirrors the workload's allotted duration as a secondary expiry signal.
//!
//! Redeploys must delete-then-recreate the full field set: the store writes
//! whole records, never merges, so a stale field from a previous deployment
//! can never leak into the new one.

use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::Result;

/// Prefix for workload record keys
pub const RECORD_KEY_PREFIX: &str = "stratos:deploy:";

/// Value held by the TTL marker key
const MARKER_VALUE: &str = "wait-delete";

/// The durable metadata persisted for one deployed workload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobRecord {
    /// Requester wallet address
    pub wallet_address: String,
    /// Human-readable workload name
    pub space_name: String,
    /// Absolute expiry, Unix seconds
    pub expire_time: i64,
    /// Workload (space) UUID
    pub space_uuid: String,
    /// Lifecycle job UUID
    pub job_uuid: String,
    /// Task type (`CPU` / `GPU`)
    pub task_type: String,
    /// Cluster Deployment name
    pub deploy_name: String,
    /// Hardware tier description string
    pub hardware: String,
    /// Reachable workload URL
    pub url: String,
}

impl JobRecord {
    /// Field list exactly as persisted
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("wallet_address".into(), self.wallet_address.clone()),
            ("space_name".into(), self.space_name.clone()),
            ("expire_time".into(), self.expire_time.to_string()),
            ("space_uuid".into(), self.space_uuid.clone()),
            ("job_uuid".into(), self.job_uuid.clone()),
            ("task_type".into(), self.task_type.clone()),
            ("deploy_name".into(), self.deploy_name.clone()),
            ("hardware".into(), self.hardware.clone()),
            ("url".into(), self.url.clone()),
        ]
    }

    /// Rebuild a record from stored hash fields.
    ///
    /// Returns `None` for an empty hash (key vanished between enumeration and
    /// read) or an unparseable expiry.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        let get = |name: &str| fields.get(name).cloned().unwrap_or_default();
        let expire_time = get("expire_time").trim().parse::<i64>().ok()?;
        Some(Self {
            wallet_address: get("wallet_address"),
            space_name: get("space_name"),
            expire_time,
            space_uuid: get("space_uuid"),
            job_uuid: get("job_uuid"),
            task_type: get("task_type"),
            deploy_name: get("deploy_name"),
            hardware: get("hardware"),
            url: get("url"),
        })
    }
}

/// The record key for a workload id
pub fn record_key(space_uuid: &str) -> String {
    format!("{}{}", RECORD_KEY_PREFIX, space_uuid)
}

/// Handle to the durable record store.
///
/// Cheap to clone; the underlying connection manager multiplexes one
/// reconnecting connection across all users.
#[derive(Clone)]
pub struct RecordStore {
    conn: ConnectionManager,
}

impl RecordStore {
    /// Connect to the store and verify it responds to PING.
    pub async fn connect(url: &str, password: &str) -> Result<Self> {
        let url = with_password(url, password);
        let client = redis::Client::open(url.as_str())?;
        let mut conn = ConnectionManager::new(client).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self { conn })
    }

    /// Persist a workload record, clearing any previous record first.
    ///
    /// Also arms the TTL marker key for the workload's duration.
    pub async fn save(&self, record: &JobRecord, duration_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = record_key(&record.space_uuid);

        let _: () = conn
            .set_ex(&record.space_uuid, MARKER_VALUE, duration_secs)
            .await?;
        let _: () = conn.del(&key).await?;
        let _: () = conn.hset_multiple(&key, &record.to_fields()).await?;

        debug!(space_uuid = %record.space_uuid, expire_time = record.expire_time, "persisted job record");
        Ok(())
    }

    /// Load the record stored under `key`, if any.
    pub async fn load(&self, key: &str) -> Result<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(JobRecord::from_fields(&fields))
    }

    /// Load the record for a workload id, if any.
    pub async fn load_by_space(&self, space_uuid: &str) -> Result<Option<JobRecord>> {
        self.load(&record_key(space_uuid)).await
    }

    /// Enumerate all workload record keys.
    pub async fn record_keys(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{}*", RECORD_KEY_PREFIX)).await?;
        Ok(keys)
    }

    /// Remove one workload's record and its TTL marker.
    pub async fn remove(&self, space_uuid: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(vec![record_key(space_uuid), space_uuid.to_string()])
            .await?;
        Ok(())
    }

    /// Remove a batch of keys in a single round-trip.
    pub async fn remove_keys(&self, keys: Vec<String>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys).await?;
        Ok(())
    }
}

/// Inject the password into a `redis://` URL that does not already carry
/// userinfo.
fn with_password(url: &str, password: &str) -> String {
    if password.is_empty() || url.contains('@') {
        return url.to_string();
    }
    match url.split_once("://") {
        Some((scheme, rest)) => format!("{}://:{}@{}", scheme, password, rest),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> JobRecord {
        JobRecord {
            wallet_address: "0xAbC123".into(),
            space_name: "demo-space".into(),
            expire_time: 1_700_003_600,
            space_uuid: "9b2459b1".into(),
            job_uuid: "a7e2cc2e".into(),
            task_type: "GPU".into(),
            deploy_name: "deploy-9b2459b1".into(),
            hardware: "Nvidia 3080·CPU 8 vCPU·Memory 32 GiB".into(),
            url: "https://abc.cp.example.dev".into(),
        }
    }

    #[test]
    fn fields_round_trip() {
        let record = sample_record();
        let fields: HashMap<String, String> = record.to_fields().into_iter().collect();
        assert_eq!(fields.len(), 9);
        assert_eq!(JobRecord::from_fields(&fields), Some(record));
    }

    #[test]
    fn empty_hash_is_no_record() {
        assert_eq!(JobRecord::from_fields(&HashMap::new()), None);
    }

    #[test]
    fn unparseable_expiry_is_no_record() {
        let mut fields: HashMap<String, String> =
            sample_record().to_fields().into_iter().collect();
        fields.insert("expire_time".into(), "soon".into());
        assert_eq!(JobRecord::from_fields(&fields), None);
    }

    #[test]
    fn record_key_uses_the_fixed_prefix() {
        assert_eq!(record_key("abc"), "stratos:deploy:abc");
    }

    #[test]
    fn password_is_injected_only_when_absent() {
        assert_eq!(
            with_password("redis://127.0.0.1:6379", "s3cret"),
            "redis://:s3cret@127.0.0.1:6379"
        );
        assert_eq!(
            with_password("redis://:other@127.0.0.1:6379", "s3cret"),
            "redis://:other@127.0.0.1:6379"
        );
        assert_eq!(
            with_password("redis://127.0.0.1:6379", ""),
            "redis://127.0.0.1:6379"
        );
    }
}
