//! Device trust scoring.
//!
//! Maintains a trust record per (user, device) pair and rescores it from
//! login, IP, user-agent, and geolocation signals. Scores live in [0, 100];
//! manual admin overrides always win over computed signals. The risk engine
//! only reads these records; mutation happens solely through signals and
//! admin override handles.

use crate::store::DevicePersistence;
use crate::RiskError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Trust bucket derived from the numeric score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    Neutral,
    Risky,
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustLevel::Trusted => write!(f, "trusted"),
            TrustLevel::Neutral => write!(f, "neutral"),
            TrustLevel::Risky => write!(f, "risky"),
        }
    }
}

/// Trust scoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTrustConfig {
    /// Score assigned to a brand-new device.
    pub initial_score: i32,
    /// Score at or above which a device is trusted.
    pub trusted_threshold: i32,
    /// Score at or below which a device is risky.
    pub risky_threshold: i32,
    /// Floor applied while `manually_trusted` is set.
    pub manual_trust_floor: i32,
    /// Ceiling applied while `manually_risky` is set.
    pub manual_risk_ceiling: i32,
    pub failed_login_penalty: i32,
    pub success_bonus: i32,
    pub new_ip_penalty: i32,
    pub new_user_agent_penalty: i32,
    /// Geo drift beyond this distance takes the large penalty.
    pub far_drift_km: f64,
    /// Geo drift beyond this distance (up to `far_drift_km`) takes the
    /// small penalty.
    pub near_drift_km: f64,
    pub far_drift_penalty: i32,
    pub near_drift_penalty: i32,
}

impl Default for DeviceTrustConfig {
    fn default() -> Self {
        Self {
            initial_score: 50,
            trusted_threshold: 70,
            risky_threshold: 30,
            manual_trust_floor: 80,
            manual_risk_ceiling: 30,
            failed_login_penalty: 10,
            success_bonus: 2,
            new_ip_penalty: 5,
            new_user_agent_penalty: 3,
            far_drift_km: 500.0,
            near_drift_km: 50.0,
            far_drift_penalty: 15,
            near_drift_penalty: 5,
        }
    }
}

impl DeviceTrustConfig {
    pub fn level_for(&self, score: i32) -> TrustLevel {
        if score >= self.trusted_threshold {
            TrustLevel::Trusted
        } else if score <= self.risky_threshold {
            TrustLevel::Risky
        } else {
            TrustLevel::Neutral
        }
    }
}

/// Geolocation attached to a login signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoPoint {
    pub country: Option<String>,
    pub city: Option<String>,
    pub lat: f64,
    pub lng: f64,
}

/// Trust-relevant signal for a (user, device) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSignal {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub geo: Option<GeoPoint>,
    pub login_success: bool,
}

impl DeviceSignal {
    pub fn successful_login(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            user_agent: None,
            geo: None,
            login_success: true,
        }
    }

    pub fn failed_login(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            user_agent: None,
            geo: None,
            login_success: false,
        }
    }
}

/// Trust record for one (user, device) pair. Unique per pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTrustRecord {
    pub user_id: String,
    pub device_key: String,
    pub trust_score: i32,
    pub trust_level: TrustLevel,
    pub manually_trusted: bool,
    pub manually_risky: bool,
    pub failed_login_count: u32,
    pub last_ip: Option<String>,
    pub last_user_agent: Option<String>,
    pub last_country: Option<String>,
    pub last_lat: Option<f64>,
    pub last_lng: Option<f64>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceTrustRecord {
    fn new(user_id: &str, device_key: &str, config: &DeviceTrustConfig) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            device_key: device_key.to_string(),
            trust_score: config.initial_score,
            trust_level: config.level_for(config.initial_score),
            manually_trusted: false,
            manually_risky: false,
            failed_login_count: 0,
            last_ip: None,
            last_user_agent: None,
            last_country: None,
            last_lat: None,
            last_lng: None,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Point-in-time device snapshot stored on a risk record for
/// explainability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceContext {
    pub device_key: String,
    pub known: bool,
    pub trust_score: Option<i32>,
    pub trust_level: Option<TrustLevel>,
}

impl DeviceContext {
    pub fn from_record(device_key: &str, record: Option<&DeviceTrustRecord>) -> Self {
        Self {
            device_key: device_key.to_string(),
            known: record.is_some(),
            trust_score: record.map(|r| r.trust_score),
            trust_level: record.map(|r| r.trust_level),
        }
    }
}

/// Great-circle distance between two coordinates, in kilometers.
fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Owner of device trust records.
pub struct DeviceTrustStore {
    devices: Arc<dyn DevicePersistence>,
    config: DeviceTrustConfig,
    // Serializes read-modify-write per (user, device); signals for
    // different keys stay independent.
    key_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl DeviceTrustStore {
    pub fn new(devices: Arc<dyn DevicePersistence>) -> Self {
        Self::with_config(devices, DeviceTrustConfig::default())
    }

    pub fn with_config(devices: Arc<dyn DevicePersistence>, config: DeviceTrustConfig) -> Self {
        Self {
            devices,
            config,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DeviceTrustConfig {
        &self.config
    }

    fn key_lock(&self, user_id: &str, device_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock();
        locks
            .entry((user_id.to_string(), device_key.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Read-only lookup; what the risk engine uses.
    pub fn find(
        &self,
        user_id: &str,
        device_key: &str,
    ) -> Result<Option<DeviceTrustRecord>, RiskError> {
        self.devices.find_by_user_and_key(user_id, device_key)
    }

    /// Fetch the pair's record, creating a neutral one if absent.
    pub fn get_or_create(
        &self,
        user_id: &str,
        device_key: &str,
    ) -> Result<DeviceTrustRecord, RiskError> {
        let lock = self.key_lock(user_id, device_key);
        let _guard = lock.lock();

        if let Some(record) = self.devices.find_by_user_and_key(user_id, device_key)? {
            return Ok(record);
        }
        let record = DeviceTrustRecord::new(user_id, device_key, &self.config);
        self.devices.save(&record)?;
        debug!(user_id, device_key, "created device trust record");
        Ok(record)
    }

    /// Apply a trust-relevant signal and rescore the pair.
    pub fn record_signal(
        &self,
        user_id: &str,
        device_key: &str,
        signal: &DeviceSignal,
    ) -> Result<DeviceTrustRecord, RiskError> {
        let lock = self.key_lock(user_id, device_key);
        let _guard = lock.lock();

        let mut record = match self.devices.find_by_user_and_key(user_id, device_key)? {
            Some(record) => record,
            None => DeviceTrustRecord::new(user_id, device_key, &self.config),
        };

        let mut score = self.apply_manual_overrides(record.trust_score, &record);

        if signal.login_success {
            score += self.config.success_bonus;
            record.failed_login_count = 0;
        } else {
            score -= self.config.failed_login_penalty;
            record.failed_login_count += 1;
        }

        if let (Some(last_ip), Some(ip)) = (record.last_ip.as_deref(), signal.ip.as_deref()) {
            if last_ip != ip {
                score -= self.config.new_ip_penalty;
            }
        }
        if let (Some(last_ua), Some(ua)) = (
            record.last_user_agent.as_deref(),
            signal.user_agent.as_deref(),
        ) {
            if last_ua != ua {
                score -= self.config.new_user_agent_penalty;
            }
        }

        if let (Some(last_lat), Some(last_lng), Some(geo)) =
            (record.last_lat, record.last_lng, signal.geo.as_ref())
        {
            let distance = haversine_km(last_lat, last_lng, geo.lat, geo.lng);
            if distance > self.config.far_drift_km {
                score -= self.config.far_drift_penalty;
            } else if distance > self.config.near_drift_km {
                score -= self.config.near_drift_penalty;
            }
            debug!(user_id, device_key, distance_km = distance, "geo drift");
        }

        score = score.clamp(0, 100);
        score = self.apply_manual_overrides(score, &record).clamp(0, 100);

        record.trust_score = score;
        record.trust_level = self.config.level_for(score);

        // The baseline only advances on successful logins so that repeated
        // failures from a new location never normalize it.
        if signal.login_success {
            if signal.ip.is_some() {
                record.last_ip = signal.ip.clone();
            }
            if signal.user_agent.is_some() {
                record.last_user_agent = signal.user_agent.clone();
            }
            if let Some(geo) = &signal.geo {
                record.last_country = geo.country.clone();
                record.last_lat = Some(geo.lat);
                record.last_lng = Some(geo.lng);
            }
            record.last_login_at = Some(Utc::now());
        }
        record.updated_at = Utc::now();

        self.devices.save(&record)?;
        debug!(
            user_id,
            device_key,
            score = record.trust_score,
            level = %record.trust_level,
            "device trust rescored"
        );
        Ok(record)
    }

    /// Admin handle: force the pair trusted (or clear the override).
    pub fn set_manually_trusted(
        &self,
        user_id: &str,
        device_key: &str,
        trusted: bool,
    ) -> Result<DeviceTrustRecord, RiskError> {
        self.set_manual(user_id, device_key, Some(trusted), None)
    }

    /// Admin handle: force the pair risky (or clear the override).
    pub fn set_manually_risky(
        &self,
        user_id: &str,
        device_key: &str,
        risky: bool,
    ) -> Result<DeviceTrustRecord, RiskError> {
        self.set_manual(user_id, device_key, None, Some(risky))
    }

    fn set_manual(
        &self,
        user_id: &str,
        device_key: &str,
        trusted: Option<bool>,
        risky: Option<bool>,
    ) -> Result<DeviceTrustRecord, RiskError> {
        let lock = self.key_lock(user_id, device_key);
        let _guard = lock.lock();

        let mut record = self
            .devices
            .find_by_user_and_key(user_id, device_key)?
            .ok_or_else(|| {
                RiskError::NotFound(format!(
                    "no device trust record for user {} device {}",
                    user_id, device_key
                ))
            })?;

        if let Some(trusted) = trusted {
            record.manually_trusted = trusted;
        }
        if let Some(risky) = risky {
            record.manually_risky = risky;
        }

        let score = self
            .apply_manual_overrides(record.trust_score, &record)
            .clamp(0, 100);
        record.trust_score = score;
        record.trust_level = self.config.level_for(score);
        record.updated_at = Utc::now();

        self.devices.save(&record)?;
        info!(
            user_id,
            device_key,
            manually_trusted = record.manually_trusted,
            manually_risky = record.manually_risky,
            "manual trust override updated"
        );
        Ok(record)
    }

    // Manual overrides are applied before and re-applied after every
    // computed adjustment, so they always win. Risky takes precedence when
    // both are set.
    fn apply_manual_overrides(&self, score: i32, record: &DeviceTrustRecord) -> i32 {
        let mut score = score;
        if record.manually_trusted {
            score = score.max(self.config.manual_trust_floor);
        }
        if record.manually_risky {
            score = score.min(self.config.manual_risk_ceiling);
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDeviceStore;

    fn store() -> DeviceTrustStore {
        DeviceTrustStore::new(Arc::new(InMemoryDeviceStore::new()))
    }

    fn geo(lat: f64, lng: f64) -> GeoPoint {
        GeoPoint {
            country: Some("US".to_string()),
            city: None,
            lat,
            lng,
        }
    }

    #[test]
    fn test_new_device_starts_neutral() {
        let store = store();
        let record = store.get_or_create("USER-1", "DEV-1").unwrap();

        assert_eq!(record.trust_score, 50);
        assert_eq!(record.trust_level, TrustLevel::Neutral);
        assert_eq!(record.failed_login_count, 0);
    }

    #[test]
    fn test_three_failed_logins() {
        let store = store();
        let signal = DeviceSignal::failed_login("10.0.0.1");

        store.record_signal("USER-1", "DEV-1", &signal).unwrap();
        store.record_signal("USER-1", "DEV-1", &signal).unwrap();
        let record = store.record_signal("USER-1", "DEV-1", &signal).unwrap();

        assert_eq!(record.failed_login_count, 3);
        assert_eq!(record.trust_score, 20); // 50 - 3 * 10
        // Baseline untouched: failures never set last_ip.
        assert!(record.last_ip.is_none());
    }

    #[test]
    fn test_score_clamped_at_zero() {
        let store = store();
        let signal = DeviceSignal::failed_login("10.0.0.1");

        let mut record = store.record_signal("USER-1", "DEV-1", &signal).unwrap();
        for _ in 0..10 {
            record = store.record_signal("USER-1", "DEV-1", &signal).unwrap();
        }

        assert_eq!(record.trust_score, 0);
        assert_eq!(record.trust_level, TrustLevel::Risky);
    }

    #[test]
    fn test_successful_login_advances_baseline() {
        let store = store();
        let mut signal = DeviceSignal::successful_login("10.0.0.1");
        signal.user_agent = Some("agent/1.0".to_string());
        signal.geo = Some(geo(40.7128, -74.0060));

        let record = store.record_signal("USER-1", "DEV-1", &signal).unwrap();

        assert_eq!(record.trust_score, 52);
        assert_eq!(record.last_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(record.last_user_agent.as_deref(), Some("agent/1.0"));
        assert!(record.last_login_at.is_some());
        assert_eq!(record.last_lat, Some(40.7128));
    }

    #[test]
    fn test_ip_and_user_agent_change_penalties() {
        let store = store();
        let mut first = DeviceSignal::successful_login("10.0.0.1");
        first.user_agent = Some("agent/1.0".to_string());
        store.record_signal("USER-1", "DEV-1", &first).unwrap();

        let mut second = DeviceSignal::successful_login("192.168.0.9");
        second.user_agent = Some("agent/2.0".to_string());
        let record = store.record_signal("USER-1", "DEV-1", &second).unwrap();

        // 52 + 2 (success) - 5 (new ip) - 3 (new user agent)
        assert_eq!(record.trust_score, 46);
    }

    #[test]
    fn test_far_geo_drift_penalty() {
        let store = store();
        let mut first = DeviceSignal::successful_login("10.0.0.1");
        first.geo = Some(geo(40.7128, -74.0060)); // New York
        store.record_signal("USER-1", "DEV-1", &first).unwrap();

        let mut second = DeviceSignal::successful_login("10.0.0.1");
        second.geo = Some(geo(34.0522, -118.2437)); // Los Angeles, ~3900 km
        let record = store.record_signal("USER-1", "DEV-1", &second).unwrap();

        // 52 + 2 (success) - 15 (far drift)
        assert_eq!(record.trust_score, 39);
    }

    #[test]
    fn test_small_geo_drift_no_penalty() {
        let store = store();
        let mut first = DeviceSignal::successful_login("10.0.0.1");
        first.geo = Some(geo(40.7128, -74.0060)); // New York
        store.record_signal("USER-1", "DEV-1", &first).unwrap();

        let mut second = DeviceSignal::successful_login("10.0.0.1");
        second.geo = Some(geo(40.6892, -74.0445)); // Liberty Island, < 10 km
        let record = store.record_signal("USER-1", "DEV-1", &second).unwrap();

        assert_eq!(record.trust_score, 54); // 52 + 2, no drift penalty
    }

    #[test]
    fn test_manually_risky_beats_successful_logins() {
        let store = store();
        let signal = DeviceSignal::failed_login("10.0.0.1");
        store.record_signal("USER-1", "DEV-1", &signal).unwrap();

        store.set_manually_risky("USER-1", "DEV-1", true).unwrap();

        let success = DeviceSignal::successful_login("10.0.0.1");
        let mut record = store.record_signal("USER-1", "DEV-1", &success).unwrap();
        for _ in 0..30 {
            record = store.record_signal("USER-1", "DEV-1", &success).unwrap();
        }

        assert!(record.trust_score <= 30);
        assert_eq!(record.trust_level, TrustLevel::Risky);
    }

    #[test]
    fn test_manually_trusted_floor() {
        let store = store();
        store.get_or_create("USER-1", "DEV-1").unwrap();

        let record = store.set_manually_trusted("USER-1", "DEV-1", true).unwrap();
        assert!(record.trust_score >= 80);
        assert_eq!(record.trust_level, TrustLevel::Trusted);

        // Failures erode the score but the floor re-applies.
        let signal = DeviceSignal::failed_login("10.0.0.1");
        let record = store.record_signal("USER-1", "DEV-1", &signal).unwrap();
        assert!(record.trust_score >= 80);
    }

    #[test]
    fn test_clearing_manual_override() {
        let store = store();
        store.get_or_create("USER-1", "DEV-1").unwrap();
        store.set_manually_risky("USER-1", "DEV-1", true).unwrap();

        let record = store.set_manually_risky("USER-1", "DEV-1", false).unwrap();
        assert!(!record.manually_risky);

        // Scores recover normally once the override is cleared.
        let success = DeviceSignal::successful_login("10.0.0.1");
        let record = store.record_signal("USER-1", "DEV-1", &success).unwrap();
        assert_eq!(record.trust_score, 32); // 30 + 2
    }

    #[test]
    fn test_manual_override_on_unknown_device() {
        let store = store();
        let err = store
            .set_manually_trusted("USER-1", "DEV-GHOST", true)
            .unwrap_err();
        assert!(matches!(err, RiskError::NotFound(_)));
    }

    #[test]
    fn test_keys_are_independent() {
        let store = store();
        let signal = DeviceSignal::failed_login("10.0.0.1");
        store.record_signal("USER-1", "DEV-1", &signal).unwrap();

        let other = store.get_or_create("USER-1", "DEV-2").unwrap();
        assert_eq!(other.trust_score, 50);
    }

    #[test]
    fn test_haversine_distance() {
        // New York to Los Angeles is roughly 3,940 km.
        let d = haversine_km(40.7128, -74.0060, 34.0522, -118.2437);
        assert!(d > 3_800.0 && d < 4_100.0);

        let zero = haversine_km(40.0, -74.0, 40.0, -74.0);
        assert!(zero < 1e-9);
    }

    #[test]
    fn test_trust_level_thresholds() {
        let config = DeviceTrustConfig::default();
        assert_eq!(config.level_for(70), TrustLevel::Trusted);
        assert_eq!(config.level_for(69), TrustLevel::Neutral);
        assert_eq!(config.level_for(31), TrustLevel::Neutral);
        assert_eq!(config.level_for(30), TrustLevel::Risky);
    }
}
