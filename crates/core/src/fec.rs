//! Forward error correction configuration and encoder lifecycle.
//!
//! FEC is configured by a short text grammar:
//!
//! ```text
//! percents <mtu> <payload> <loss_pct>   # derive parameters from a loss target
//! cfg <profile>                         # explicit profile, passed through
//! ```
//!
//! [`FecManager`] owns at most one live encoder. Each reconfiguration
//! destroys the previous encoder before building the next one. A failed build
//! is fatal: until a later build succeeds, [`FecManager::with_encoder`]
//! refuses to run, so no frame goes out unprotected.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ConfigErrorKind, Result, RxtxError};

const PERCENTS_PREFIX: &str = "percents ";
const CFG_PREFIX: &str = "cfg ";

/// Parsed FEC configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum FecConfig {
    /// Derive redundancy from packet size, frame payload size and the
    /// expected loss percentage.
    ByLossTarget {
        mtu: usize,
        payload: usize,
        loss_pct: f64,
    },
    /// Opaque encoder profile.
    ByProfile(String),
}

impl FromStr for FecConfig {
    type Err = RxtxError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(params) = s.strip_prefix(PERCENTS_PREFIX) {
            let tokens: Vec<&str> = params.split_whitespace().collect();
            if tokens.len() != 3 {
                return Err(RxtxError::config(ConfigErrorKind::FecArity {
                    found: tokens.len(),
                }));
            }
            let bad = |t: &str| RxtxError::config(ConfigErrorKind::FecParameter(t.to_string()));
            Ok(Self::ByLossTarget {
                mtu: tokens[0].parse().map_err(|_| bad(tokens[0]))?,
                payload: tokens[1].parse().map_err(|_| bad(tokens[1]))?,
                loss_pct: tokens[2].parse().map_err(|_| bad(tokens[2]))?,
            })
        } else if let Some(profile) = s.strip_prefix(CFG_PREFIX) {
            Ok(Self::ByProfile(profile.to_string()))
        } else {
            Err(RxtxError::config(ConfigErrorKind::UnknownFecGrammar(
                s.to_string(),
            )))
        }
    }
}

impl fmt::Display for FecConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByLossTarget {
                mtu,
                payload,
                loss_pct,
            } => write!(f, "{PERCENTS_PREFIX}{mtu} {payload} {loss_pct}"),
            Self::ByProfile(profile) => write!(f, "{CFG_PREFIX}{profile}"),
        }
    }
}

/// A constructed FEC encoder. Dropping it destroys it.
pub trait FecEncoder: Send {
    /// Data packets per protection group.
    fn k(&self) -> usize;

    /// Parity packets per protection group.
    fn m(&self) -> usize;

    /// Compute the parity payloads protecting `data`.
    ///
    /// `data` is split into groups of `k` payloads; each group yields `m`
    /// parity payloads, returned in group order.
    fn encode(&mut self, data: &[Vec<u8>]) -> Vec<Vec<u8>>;
}

/// Constructs encoders. Returns `None` when the parameters are unusable.
pub trait FecBackend: Send + Sync {
    fn by_loss_target(&self, mtu: usize, payload: usize, loss_pct: f64) -> Option<Box<dyn FecEncoder>>;

    fn by_profile(&self, profile: &str) -> Option<Box<dyn FecEncoder>>;
}

/// The currently configured encoder together with its configuration.
pub struct ActiveFec {
    pub config: FecConfig,
    pub encoder: Box<dyn FecEncoder>,
}

#[derive(Default)]
struct FecState {
    active: Option<ActiveFec>,
    /// Configuration of the last build that failed.
    failed: Option<String>,
}

/// Owns the session's single FEC encoder.
pub struct FecManager {
    backend: Arc<dyn FecBackend>,
    state: Mutex<FecState>,
}

impl FecManager {
    pub fn new(backend: Arc<dyn FecBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(FecState::default()),
        }
    }

    /// Replace the encoder according to `grammar`.
    ///
    /// A malformed grammar is a configuration error and leaves the current
    /// encoder in place. Once the grammar parses, the current encoder is
    /// destroyed; if the new one cannot be built the manager is left failed
    /// and [`RxtxError::FecInit`] is returned.
    pub fn reconfigure(&self, grammar: &str) -> Result<()> {
        self.apply(grammar.parse()?)
    }

    /// Replace the encoder with one built from an already parsed `config`.
    pub fn apply(&self, config: FecConfig) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(old) = state.active.take() {
            tracing::debug!(config = %old.config, "destroying FEC encoder");
            drop(old);
        }

        let encoder = match &config {
            FecConfig::ByLossTarget {
                mtu,
                payload,
                loss_pct,
            } => self.backend.by_loss_target(*mtu, *payload, *loss_pct),
            FecConfig::ByProfile(profile) => self.backend.by_profile(profile),
        };

        match encoder {
            Some(encoder) => {
                tracing::info!(%config, k = encoder.k(), m = encoder.m(), "FEC encoder configured");
                state.active = Some(ActiveFec { config, encoder });
                state.failed = None;
                Ok(())
            }
            None => {
                tracing::error!(%config, "unable to initialize FEC encoder");
                state.failed = Some(config.to_string());
                Err(RxtxError::FecInit {
                    config: config.to_string(),
                })
            }
        }
    }

    /// Run `f` with the live encoder, if one is configured.
    ///
    /// Fails while the last reconfiguration left no usable encoder.
    pub fn with_encoder<R>(&self, f: impl FnOnce(&mut dyn FecEncoder) -> R) -> Result<Option<R>> {
        let mut state = self.state.lock();
        if let Some(config) = &state.failed {
            return Err(RxtxError::FecInit {
                config: config.clone(),
            });
        }
        Ok(state.active.as_mut().map(|a| f(a.encoder.as_mut())))
    }

    /// Configuration of the live encoder.
    pub fn current(&self) -> Option<FecConfig> {
        self.state.lock().active.as_ref().map(|a| a.config.clone())
    }

    pub fn is_configured(&self) -> bool {
        self.state.lock().active.is_some()
    }

    /// Whether the last reconfiguration failed to build an encoder.
    pub fn is_failed(&self) -> bool {
        self.state.lock().failed.is_some()
    }

    /// Destroy the live encoder, if any.
    pub fn teardown(&self) {
        if let Some(old) = self.state.lock().active.take() {
            tracing::debug!(config = %old.config, "FEC encoder torn down");
        }
    }
}

/// Largest protection group the parity backend accepts.
pub const MAX_GROUP: usize = 1024;

/// Interleaved XOR parity.
///
/// Parity payload `i` of a group is the XOR of every data payload whose
/// position in the group is congruent to `i` modulo `m`. Shorter payloads are
/// zero-padded to the longest one in their stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParityEncoder {
    k: usize,
    m: usize,
}

impl ParityEncoder {
    pub fn new(k: usize, m: usize) -> Option<Self> {
        if k == 0 || m == 0 || m > k || k > MAX_GROUP {
            return None;
        }
        Some(Self { k, m })
    }
}

impl FecEncoder for ParityEncoder {
    fn k(&self) -> usize {
        self.k
    }

    fn m(&self) -> usize {
        self.m
    }

    fn encode(&mut self, data: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut parity = Vec::new();
        for group in data.chunks(self.k) {
            let m = self.m.min(group.len());
            for stripe in 0..m {
                let members = group.iter().skip(stripe).step_by(m);
                let len = members.clone().map(Vec::len).max().unwrap_or(0);
                let mut out = vec![0u8; len];
                for payload in members {
                    for (o, b) in out.iter_mut().zip(payload) {
                        *o ^= b;
                    }
                }
                parity.push(out);
            }
        }
        parity
    }
}

/// Builds [`ParityEncoder`]s.
///
/// - Loss target: `k = ceil(payload / mtu)` data packets per frame, and
///   enough parity to cover twice the expected loss, at least one packet.
/// - Profile: `k:m` or `k:m:c` (the trailing column weight is accepted and
///   ignored).
#[derive(Debug, Default, Clone, Copy)]
pub struct ParityBackend;

impl FecBackend for ParityBackend {
    fn by_loss_target(&self, mtu: usize, payload: usize, loss_pct: f64) -> Option<Box<dyn FecEncoder>> {
        if mtu == 0 || payload == 0 || !(loss_pct > 0.0 && loss_pct < 100.0) {
            return None;
        }
        let k = payload.div_ceil(mtu);
        let m = ((k as f64 * loss_pct * 2.0 / 100.0).ceil() as usize).clamp(1, k);
        ParityEncoder::new(k, m).map(|e| Box::new(e) as Box<dyn FecEncoder>)
    }

    fn by_profile(&self, profile: &str) -> Option<Box<dyn FecEncoder>> {
        let fields: Vec<&str> = profile.trim().split(':').collect();
        if !(2..=3).contains(&fields.len()) {
            return None;
        }
        let mut nums = fields.iter().map(|f| f.parse::<usize>().ok());
        let k = nums.next()??;
        let m = nums.next()??;
        if let Some(c) = nums.next() {
            c?;
        }
        ParityEncoder::new(k, m).map(|e| Box::new(e) as Box<dyn FecEncoder>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend recording construction and destruction order.
    #[derive(Default, Clone)]
    struct RecordingBackend {
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    struct RecordingEncoder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FecEncoder for RecordingEncoder {
        fn k(&self) -> usize {
            1
        }
        fn m(&self) -> usize {
            1
        }
        fn encode(&mut self, _data: &[Vec<u8>]) -> Vec<Vec<u8>> {
            Vec::new()
        }
    }

    impl Drop for RecordingEncoder {
        fn drop(&mut self) {
            self.log.lock().push(format!("destroy {}", self.name));
        }
    }

    impl RecordingBackend {
        fn make(&self, name: String) -> Option<Box<dyn FecEncoder>> {
            if self.fail {
                return None;
            }
            self.log.lock().push(format!("construct {name}"));
            Some(Box::new(RecordingEncoder {
                name,
                log: self.log.clone(),
            }))
        }
    }

    impl FecBackend for RecordingBackend {
        fn by_loss_target(&self, mtu: usize, payload: usize, loss_pct: f64) -> Option<Box<dyn FecEncoder>> {
            self.make(format!("loss {mtu} {payload} {loss_pct}"))
        }
        fn by_profile(&self, profile: &str) -> Option<Box<dyn FecEncoder>> {
            self.make(format!("profile {profile}"))
        }
    }

    #[test]
    fn parse_percents() {
        let cfg: FecConfig = "percents 1500 1450 5.0".parse().unwrap();
        assert_eq!(
            cfg,
            FecConfig::ByLossTarget {
                mtu: 1500,
                payload: 1450,
                loss_pct: 5.0
            }
        );
    }

    #[test]
    fn parse_cfg_passes_profile_through() {
        let cfg: FecConfig = "cfg 256:192:5 extra".parse().unwrap();
        assert_eq!(cfg, FecConfig::ByProfile("256:192:5 extra".into()));
    }

    #[test]
    fn parse_percents_wrong_arity() {
        for bad in ["percents 1500 1450", "percents 1500 1450 5 7", "percents "] {
            assert!(matches!(
                bad.parse::<FecConfig>(),
                Err(RxtxError::Config {
                    kind: ConfigErrorKind::FecArity { .. }
                })
            ));
        }
    }

    #[test]
    fn parse_percents_bad_number() {
        assert!(matches!(
            "percents abc 1450 5".parse::<FecConfig>(),
            Err(RxtxError::Config {
                kind: ConfigErrorKind::FecParameter(_)
            })
        ));
    }

    #[test]
    fn parse_unknown_prefix() {
        for bad in ["ldgm 1 2 3", "Percents 1 2 3", "cfg", ""] {
            assert!(bad.parse::<FecConfig>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn display_is_parseable() {
        for grammar in ["percents 1500 1450 5", "cfg myprofile"] {
            let cfg: FecConfig = grammar.parse().unwrap();
            assert_eq!(cfg.to_string().parse::<FecConfig>().unwrap(), cfg);
        }
    }

    #[test]
    fn reconfigure_twice_keeps_one_encoder() {
        let backend = RecordingBackend::default();
        let mgr = FecManager::new(Arc::new(backend.clone()));
        assert!(!mgr.is_configured());

        mgr.reconfigure("percents 1500 1450 5.0").unwrap();
        mgr.reconfigure("cfg myprofile").unwrap();
        assert!(mgr.is_configured());
        assert_eq!(mgr.current(), Some(FecConfig::ByProfile("myprofile".into())));

        assert_eq!(
            *backend.log.lock(),
            vec![
                "construct loss 1500 1450 5".to_string(),
                "destroy loss 1500 1450 5".to_string(),
                "construct profile myprofile".to_string(),
            ]
        );
    }

    #[test]
    fn construction_failure_is_fatal_and_unconfigures() {
        let backend = RecordingBackend {
            fail: true,
            ..Default::default()
        };
        let mgr = FecManager::new(Arc::new(backend));
        let err = mgr.reconfigure("cfg broken").unwrap_err();
        assert!(err.is_fatal());
        assert!(!mgr.is_configured());
        assert!(mgr.is_failed());
        assert!(mgr.with_encoder(|e| e.k()).is_err());
    }

    #[test]
    fn successful_build_clears_failure() {
        let mgr = FecManager::new(Arc::new(ParityBackend));
        assert_eq!(mgr.with_encoder(|e| e.k()).unwrap(), None);

        assert!(mgr.reconfigure("cfg 8:9").is_err());
        assert!(mgr.is_failed());

        mgr.reconfigure("cfg 8:2").unwrap();
        assert!(!mgr.is_failed());
        assert_eq!(mgr.with_encoder(|e| e.k()).unwrap(), Some(8));
    }

    #[test]
    fn malformed_grammar_keeps_current_encoder() {
        let backend = RecordingBackend::default();
        let mgr = FecManager::new(Arc::new(backend.clone()));
        mgr.reconfigure("cfg first").unwrap();

        let err = mgr.reconfigure("percents 1 2").unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(mgr.current(), Some(FecConfig::ByProfile("first".into())));
        assert_eq!(backend.log.lock().len(), 1);
    }

    #[test]
    fn teardown_is_idempotent() {
        let backend = RecordingBackend::default();
        let mgr = FecManager::new(Arc::new(backend.clone()));
        mgr.reconfigure("cfg p").unwrap();
        mgr.teardown();
        mgr.teardown();
        assert!(!mgr.is_configured());
        assert_eq!(backend.log.lock().last().unwrap(), "destroy profile p");
    }

    #[test]
    fn parity_backend_loss_target() {
        let enc = ParityBackend.by_loss_target(1500, 15000, 5.0).unwrap();
        assert_eq!(enc.k(), 10);
        assert_eq!(enc.m(), 1);

        let enc = ParityBackend.by_loss_target(1000, 20000, 25.0).unwrap();
        assert_eq!(enc.k(), 20);
        assert_eq!(enc.m(), 10);

        assert!(ParityBackend.by_loss_target(0, 100, 5.0).is_none());
        assert!(ParityBackend.by_loss_target(1500, 1450, 0.0).is_none());
        assert!(ParityBackend.by_loss_target(1500, 1450, 100.0).is_none());
    }

    #[test]
    fn parity_backend_profile() {
        let enc = ParityBackend.by_profile("256:192:5").unwrap();
        assert_eq!((enc.k(), enc.m()), (256, 192));
        assert!(ParityBackend.by_profile("8:4").is_some());
        assert!(ParityBackend.by_profile("myprofile").is_none());
        assert!(ParityBackend.by_profile("4:8").is_none());
        assert!(ParityBackend.by_profile("8:4:x").is_none());
    }

    #[test]
    fn parity_recovers_single_loss_per_stripe() {
        let mut enc = ParityEncoder::new(4, 2).unwrap();
        let data = vec![vec![1, 2, 3], vec![4, 5], vec![7, 8, 9], vec![10]];
        let parity = enc.encode(&data);
        assert_eq!(parity.len(), 2);

        // Stripe 0 covers packets 0 and 2; rebuild packet 2 from packet 0.
        let rebuilt: Vec<u8> = parity[0].iter().zip(&data[0]).map(|(p, d)| p ^ d).collect();
        assert_eq!(rebuilt, data[2]);
    }

    #[test]
    fn parity_short_trailing_group() {
        let mut enc = ParityEncoder::new(4, 2).unwrap();
        let data = vec![vec![1u8; 4]; 5];
        // One full group (2 parity) plus a single-packet group (1 parity).
        assert_eq!(enc.encode(&data).len(), 3);
    }
}
