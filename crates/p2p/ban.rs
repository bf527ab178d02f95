//! IP ban table with reasoned, graduated bans.
//!
//! Every offense bumps a per-IP counter that survives `unban`, so the
//! effective duration doubles with each repeat offense up to a 30-day cap.
//! Whitelisted IPs (trust nodes) are never banned. Expired records are
//! removed lazily on lookup.

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    net::IpAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};
use tracing::{debug, info};

pub const MAX_BAN_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BanReason {
    ProtocolViolation,
    MaliciousBehavior,
    BadHandshake,
    TooManyConnections,
    ManualBan,
}

impl BanReason {
    pub const ALL: [BanReason; 5] = [
        BanReason::ProtocolViolation,
        BanReason::MaliciousBehavior,
        BanReason::BadHandshake,
        BanReason::TooManyConnections,
        BanReason::ManualBan,
    ];

    pub fn default_duration(&self) -> Duration {
        match self {
            BanReason::ProtocolViolation => Duration::from_secs(5 * 60),
            BanReason::MaliciousBehavior => Duration::from_secs(60 * 60),
            BanReason::BadHandshake => Duration::from_secs(10 * 60),
            BanReason::TooManyConnections => Duration::from_secs(2 * 60),
            BanReason::ManualBan => Duration::from_secs(24 * 60 * 60),
        }
    }

    fn index(&self) -> usize {
        match self {
            BanReason::ProtocolViolation => 0,
            BanReason::MaliciousBehavior => 1,
            BanReason::BadHandshake => 2,
            BanReason::TooManyConnections => 3,
            BanReason::ManualBan => 4,
        }
    }
}

impl Display for BanReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BanReason::ProtocolViolation => write!(f, "protocol violation"),
            BanReason::MaliciousBehavior => write!(f, "malicious behavior"),
            BanReason::BadHandshake => write!(f, "bad handshake"),
            BanReason::TooManyConnections => write!(f, "too many connections"),
            BanReason::ManualBan => write!(f, "manual ban"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BanRecord {
    pub ip: IpAddr,
    pub reason: BanReason,
    pub banned_at: SystemTime,
    pub duration: Duration,
    pub offense_count: u32,
    expires_at: Instant,
}

impl BanRecord {
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanStatsSnapshot {
    pub total_bans: u64,
    pub total_unbans: u64,
    pub active_bans: usize,
    pub per_reason: Vec<(BanReason, u64)>,
}

#[derive(Debug, Default)]
struct BanStats {
    total_bans: AtomicU64,
    total_unbans: AtomicU64,
    per_reason: [AtomicU64; 5],
}

#[derive(Debug, Default)]
struct BanTables {
    records: HashMap<IpAddr, BanRecord>,
    /// Offense counters outlive their records so a re-banned peer keeps
    /// climbing the escalation curve.
    offenses: HashMap<IpAddr, u32>,
}

#[derive(Debug, Clone)]
pub struct BanList {
    inner: Arc<BanListInner>,
}

#[derive(Debug)]
struct BanListInner {
    tables: Mutex<BanTables>,
    whitelist: HashSet<IpAddr>,
    stats: BanStats,
}

impl BanList {
    pub fn new(whitelist: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            inner: Arc::new(BanListInner {
                tables: Mutex::new(BanTables::default()),
                whitelist: whitelist.into_iter().collect(),
                stats: BanStats::default(),
            }),
        }
    }

    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.inner.whitelist.contains(ip)
    }

    /// Bans `ip` for `duration` (the reason's default when `None`), scaled
    /// by the graduated-escalation rule. Returns the recorded ban, or `None`
    /// for whitelisted IPs.
    pub fn ban(
        &self,
        ip: IpAddr,
        reason: BanReason,
        duration: Option<Duration>,
    ) -> Option<BanRecord> {
        if self.is_whitelisted(&ip) {
            debug!(%ip, %reason, "Not banning whitelisted ip");
            return None;
        }

        let mut tables = self.lock_tables();
        let offenses = tables.offenses.entry(ip).or_insert(0);
        *offenses += 1;
        let offense_count = *offenses;

        let base = duration.unwrap_or_else(|| reason.default_duration());
        let effective = escalate(base, offense_count);

        let record = BanRecord {
            ip,
            reason,
            banned_at: SystemTime::now(),
            duration: effective,
            offense_count,
            expires_at: Instant::now() + effective,
        };
        tables.records.insert(ip, record.clone());

        self.inner.stats.total_bans.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.per_reason[reason.index()].fetch_add(1, Ordering::Relaxed);

        info!(
            %ip, %reason, offense = offense_count,
            duration_secs = effective.as_secs(),
            "Banned peer"
        );
        Some(record)
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        if self.is_whitelisted(ip) {
            return false;
        }
        let mut tables = self.lock_tables();
        match tables.records.get(ip) {
            Some(record) if record.is_expired() => {
                tables.records.remove(ip);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Removes the active ban but keeps the offense counter.
    pub fn unban(&self, ip: &IpAddr) -> bool {
        let removed = self.lock_tables().records.remove(ip).is_some();
        if removed {
            self.inner.stats.total_unbans.fetch_add(1, Ordering::Relaxed);
            info!(%ip, "Unbanned peer");
        }
        removed
    }

    pub fn get_ban(&self, ip: &IpAddr) -> Option<BanRecord> {
        let mut tables = self.lock_tables();
        match tables.records.get(ip) {
            Some(record) if record.is_expired() => {
                tables.records.remove(ip);
                None
            }
            Some(record) => Some(record.clone()),
            None => None,
        }
    }

    /// All currently active bans, sweeping out expired records.
    pub fn get_all_banned_nodes(&self) -> Vec<BanRecord> {
        let mut tables = self.lock_tables();
        tables.records.retain(|_, record| !record.is_expired());
        tables.records.values().cloned().collect()
    }

    pub fn stats(&self) -> BanStatsSnapshot {
        let active_bans = self.get_all_banned_nodes().len();
        BanStatsSnapshot {
            total_bans: self.inner.stats.total_bans.load(Ordering::Relaxed),
            total_unbans: self.inner.stats.total_unbans.load(Ordering::Relaxed),
            active_bans,
            per_reason: BanReason::ALL
                .iter()
                .map(|reason| {
                    (
                        *reason,
                        self.inner.stats.per_reason[reason.index()].load(Ordering::Relaxed),
                    )
                })
                .collect(),
        }
    }

    fn lock_tables(&self) -> std::sync::MutexGuard<'_, BanTables> {
        // Lock poisoning only happens if a holder panicked; the tables are
        // still structurally sound, so keep serving.
        match self.inner.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// `min(base * 2^(offenses-1), 30 days)`.
fn escalate(base: Duration, offenses: u32) -> Duration {
    let shift = offenses.saturating_sub(1).min(63);
    let secs = base.as_secs().saturating_mul(1u64.checked_shl(shift).unwrap_or(u64::MAX));
    Duration::from_secs(secs).min(MAX_BAN_DURATION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn ban_and_expiry_bookkeeping() {
        let bans = BanList::new([]);
        assert!(!bans.is_banned(&ip(1)));

        let record = bans.ban(ip(1), BanReason::ProtocolViolation, None).unwrap();
        assert_eq!(record.offense_count, 1);
        assert_eq!(record.duration, Duration::from_secs(5 * 60));
        assert!(bans.is_banned(&ip(1)));

        // A zero-length ban expires immediately and is swept on lookup.
        bans.ban(ip(2), BanReason::ManualBan, Some(Duration::ZERO));
        assert!(!bans.is_banned(&ip(2)));
        assert!(bans.get_all_banned_nodes().iter().all(|r| r.ip != ip(2)));
    }

    #[test]
    fn graduated_escalation_caps_at_thirty_days() {
        let bans = BanList::new([]);

        // Three strikes with unbans in between: 5 min, 10 min, 20 min.
        for expected_secs in [300, 600, 1200] {
            let record = bans.ban(ip(3), BanReason::ProtocolViolation, None).unwrap();
            assert_eq!(record.duration, Duration::from_secs(expected_secs));
            bans.unban(&ip(3));
        }

        // Offense counter keeps climbing far past the cap.
        for _ in 0..40 {
            bans.ban(ip(3), BanReason::ProtocolViolation, None);
            bans.unban(&ip(3));
        }
        let record = bans.ban(ip(3), BanReason::ProtocolViolation, None).unwrap();
        assert_eq!(record.duration, MAX_BAN_DURATION);
    }

    #[test]
    fn one_active_record_per_ip() {
        let bans = BanList::new([]);
        bans.ban(ip(4), BanReason::BadHandshake, None);
        bans.ban(ip(4), BanReason::MaliciousBehavior, None);

        let records = bans.get_all_banned_nodes();
        assert_eq!(records.iter().filter(|r| r.ip == ip(4)).count(), 1);
        assert_eq!(records[0].reason, BanReason::MaliciousBehavior);
        assert_eq!(records[0].offense_count, 2);
    }

    #[test]
    fn whitelist_overrides_everything() {
        let bans = BanList::new([ip(5)]);
        assert!(bans.ban(ip(5), BanReason::ManualBan, None).is_none());
        assert!(!bans.is_banned(&ip(5)));
        assert_eq!(bans.stats().total_bans, 0);
    }

    #[test]
    fn unban_keeps_offense_counter() {
        let bans = BanList::new([]);
        bans.ban(ip(6), BanReason::BadHandshake, None);
        assert!(bans.unban(&ip(6)));
        assert!(!bans.is_banned(&ip(6)));
        assert!(!bans.unban(&ip(6)));

        let record = bans.ban(ip(6), BanReason::BadHandshake, None).unwrap();
        assert_eq!(record.offense_count, 2);
    }

    #[test]
    fn stats_track_reasons() {
        let bans = BanList::new([]);
        bans.ban(ip(7), BanReason::BadHandshake, None);
        bans.ban(ip(8), BanReason::BadHandshake, None);
        bans.ban(ip(9), BanReason::ManualBan, None);
        bans.unban(&ip(9));

        let stats = bans.stats();
        assert_eq!(stats.total_bans, 3);
        assert_eq!(stats.total_unbans, 1);
        assert_eq!(stats.active_bans, 2);
        let bad_handshakes = stats
            .per_reason
            .iter()
            .find(|(reason, _)| *reason == BanReason::BadHandshake)
            .map(|(_, count)| *count);
        assert_eq!(bad_handshakes, Some(2));
    }
}
