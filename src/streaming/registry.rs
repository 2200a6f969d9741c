//! Signal/table state machine (component C).
//!
//! Owns the signal and table slabs, enforces the subscribe/unsubscribe
//! cascade rules, and serializes every mutation plus its resulting meta
//! emission under one lock, per spec §4.C / §5.
//!
//! Host callbacks (`SampleSource::on_subscribe`/`on_unsubscribe`) are
//! invoked while the registry lock is held, exactly as the original design
//! does. The §9 Design Note flags this as a latent reentrancy hazard and
//! asks whether releasing the lock around callbacks would be safer; this
//! implementation keeps the lock held, because releasing it would let a
//! second subscribe/unsubscribe interleave mid-cascade and break the
//! per-signal wire-ordering guarantee in §5(a). The contract instead is:
//! `SampleSource` implementations must be non-reentrant and non-blocking.

use std::ops::Range;

use parking_lot::Mutex;
use thiserror::Error;

use super::meta;
use super::packet::{DataType, Rule};
use super::stream::StreamHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    Value,
    Time,
    Status,
}

impl SignalType {
    pub const fn wire_name(self) -> &'static str {
        match self {
            SignalType::Value => "value",
            SignalType::Time => "time",
            SignalType::Status => "status",
        }
    }
}

/// Exponents of the first `num_of_exponents` small primes (2,3,5,7,11,13,17,19)
/// whose product forms the resolution denominator, per spec §3.
#[derive(Debug, Clone, Default)]
pub struct TimeSpec {
    pub absolute_reference: Option<String>,
    pub prime_exponents: Vec<u32>,
}

const PRIMES: [u64; 8] = [2, 3, 5, 7, 11, 13, 17, 19];

impl TimeSpec {
    /// denom = product over participating primes of primes[i]^exponents[i].
    /// An empty exponent list yields 1, matching the original's behavior
    /// when no exponents are configured.
    pub fn resolution_denom(&self) -> u64 {
        self.prime_exponents
            .iter()
            .zip(PRIMES.iter())
            .map(|(exp, prime)| prime.pow(*exp))
            .product::<u64>()
            .max(1)
    }
}

#[derive(Debug, Clone)]
pub struct SignalDefinition {
    pub name: String,
    pub rule: Rule,
    pub datatype: DataType,
    pub signal_type: SignalType,
    pub hidden: bool,
    pub delta: u64,
    pub time: Option<TimeSpec>,
}

impl SignalDefinition {
    pub fn new(name: impl Into<String>, rule: Rule, datatype: DataType, signal_type: SignalType) -> Self {
        Self {
            name: name.into(),
            rule,
            datatype,
            signal_type,
            hidden: false,
            delta: 0,
            time: None,
        }
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn delta(mut self, delta: u64) -> Self {
        self.delta = delta;
        self
    }

    pub fn time(mut self, time: TimeSpec) -> Self {
        self.time = Some(time);
        self
    }
}

struct Signal {
    definition: SignalDefinition,
    table: Option<usize>,
    available: bool,
    subscribed: bool,
    stream: Option<u64>,
}

struct SignalTable {
    table_id: String,
    range: Range<usize>,
    subscribed_value_signal_count: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry is at capacity (MAX_SIGNALS/MAX_TABLES)")]
    Full,
    #[error("no signal named {0:?}")]
    NotFound(String),
    #[error("signal {0:?} is already subscribed")]
    AlreadySubscribed(String),
    #[error("signal {0:?} is not subscribed")]
    NotSubscribed(String),
}

/// Host-implemented callbacks producing sample data, standing in for the
/// device-specific code the streaming core calls into (spec §1's "out of
/// scope" collaborators).
///
/// Implementations MUST be non-reentrant (never call back into the
/// `SignalRegistry` that invoked them) and non-blocking, since they run
/// with the registry lock held.
pub trait SampleSource: Send + Sync {
    /// Called once per signal as it is subscribed (including cascaded
    /// siblings). Returns the `valueIndex` to anchor an implicit signal's
    /// first transmitted sample.
    fn on_subscribe(&self, signal_name: &str) -> u64 {
        let _ = signal_name;
        0
    }

    fn on_unsubscribe(&self, signal_name: &str) {
        let _ = signal_name;
    }

    fn on_connect(&self) {}
}

struct Inner {
    signals: Vec<Signal>,
    tables: Vec<SignalTable>,
    max_signals: usize,
    max_tables: usize,
    signal_name_length: usize,
}

pub struct SignalRegistry {
    inner: Mutex<Inner>,
}

pub struct TableHandle(pub usize);

impl SignalRegistry {
    /// `signal_name_length` is the `SIGNAL_NAME_LENGTH` cap (spec §5):
    /// `add_table`/`add_signal` reject any definition whose name exceeds it,
    /// the same way `max_signals`/`max_tables` are enforced here rather than
    /// by a caller that could bypass the public API.
    pub fn new(max_signals: usize, max_tables: usize, signal_name_length: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                signals: Vec::new(),
                tables: Vec::new(),
                max_signals,
                max_tables,
                signal_name_length,
            }),
        }
    }

    /// `add_table(defs, tableId) -> Option<TableHandle>`. Fails (returns
    /// `None`) if `defs` is empty, any name exceeds `SIGNAL_NAME_LENGTH`, or
    /// capacity would be exceeded; appends atomically otherwise. The first
    /// definition is the table's head.
    pub fn add_table(&self, defs: Vec<SignalDefinition>, table_id: impl Into<String>) -> Option<TableHandle> {
        if defs.is_empty() {
            return None;
        }
        let mut inner = self.inner.lock();
        if defs.iter().any(|d| d.name.len() > inner.signal_name_length) {
            return None;
        }
        if inner.tables.len() >= inner.max_tables {
            return None;
        }
        if inner.signals.len() + defs.len() > inner.max_signals {
            return None;
        }
        if inner.signals.len() + defs.len() > super::packet::MAX_SIGNAL_NUMBER as usize {
            return None;
        }

        let start = inner.signals.len();
        let table_index = inner.tables.len();
        for def in defs {
            let available = !def.hidden;
            inner.signals.push(Signal {
                definition: def,
                table: Some(table_index),
                available,
                subscribed: false,
                stream: None,
            });
        }
        let end = inner.signals.len();
        inner.tables.push(SignalTable {
            table_id: table_id.into(),
            range: start..end,
            subscribed_value_signal_count: 0,
        });

        Some(TableHandle(table_index))
    }

    /// Register a single signal with no table. Fails if the name exceeds
    /// `SIGNAL_NAME_LENGTH` or capacity would be exceeded.
    pub fn add_signal(&self, def: SignalDefinition) -> Option<()> {
        let mut inner = self.inner.lock();
        if def.name.len() > inner.signal_name_length {
            return None;
        }
        if inner.signals.len() >= inner.max_signals {
            return None;
        }
        if inner.signals.len() + 1 > super::packet::MAX_SIGNAL_NUMBER as usize {
            return None;
        }
        let available = !def.hidden;
        inner.signals.push(Signal {
            definition: def,
            table: None,
            available,
            subscribed: false,
            stream: None,
        });
        Some(())
    }

    fn find_index(inner: &Inner, name: &str) -> Option<usize> {
        inner.signals.iter().position(|s| s.definition.name == name)
    }

    /// 1-based index into the registry array, stable for the signal's
    /// lifetime (spec invariant 3).
    pub fn signal_no(&self, name: &str) -> Option<u32> {
        let inner = self.inner.lock();
        Self::find_index(&inner, name).map(|i| (i + 1) as u32)
    }

    /// subscribe(stream, signalId) per spec §4.C.
    pub fn subscribe(
        &self,
        stream: &StreamHandle,
        signal_id: &str,
        source: &dyn SampleSource,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();

        let idx = Self::find_index(&inner, signal_id)
            .ok_or_else(|| RegistryError::NotFound(signal_id.to_string()))?;
        if inner.signals[idx].subscribed {
            return Err(RegistryError::AlreadySubscribed(signal_id.to_string()));
        }

        // Cascade: pull in non-value siblings that aren't yet subscribed.
        if let Some(table_idx) = inner.signals[idx].table {
            let range = inner.tables[table_idx].range.clone();
            let sibling_indices: Vec<usize> = range
                .filter(|&i| i != idx)
                .filter(|&i| inner.signals[i].definition.signal_type != SignalType::Value)
                .filter(|&i| !inner.signals[i].subscribed)
                .collect();

            for sib_idx in sibling_indices {
                let sib_name = inner.signals[sib_idx].definition.name.clone();
                source.on_subscribe(&sib_name);
                inner.signals[sib_idx].subscribed = true;
                inner.signals[sib_idx].stream = Some(stream.id());

                emit_subscribe_ack_and_definition(&inner, sib_idx, stream, 0);
            }
        }

        if inner.signals[idx].definition.signal_type == SignalType::Value {
            if let Some(table_idx) = inner.signals[idx].table {
                inner.tables[table_idx].subscribed_value_signal_count += 1;
            }
        }

        let value_index = source.on_subscribe(signal_id);
        inner.signals[idx].subscribed = true;
        inner.signals[idx].stream = Some(stream.id());

        emit_subscribe_ack_and_definition(&inner, idx, stream, value_index);

        Ok(())
    }

    /// unsubscribe(stream, signalId) per spec §4.C.
    pub fn unsubscribe(
        &self,
        stream: &StreamHandle,
        signal_id: &str,
        source: &dyn SampleSource,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();

        let idx = Self::find_index(&inner, signal_id)
            .ok_or_else(|| RegistryError::NotFound(signal_id.to_string()))?;
        if !inner.signals[idx].subscribed {
            return Err(RegistryError::NotSubscribed(signal_id.to_string()));
        }

        let is_value = inner.signals[idx].definition.signal_type == SignalType::Value;
        let table_idx = inner.signals[idx].table;

        if is_value {
            if let Some(table_idx) = table_idx {
                let count = &mut inner.tables[table_idx].subscribed_value_signal_count;
                *count = count.saturating_sub(1);
                if inner.tables[table_idx].subscribed_value_signal_count == 0 {
                    let range = inner.tables[table_idx].range.clone();
                    let sibling_indices: Vec<usize> = range
                        .filter(|&i| i != idx)
                        .filter(|&i| inner.signals[i].definition.signal_type != SignalType::Value)
                        .filter(|&i| inner.signals[i].subscribed)
                        .collect();

                    for sib_idx in sibling_indices {
                        let sib_name = inner.signals[sib_idx].definition.name.clone();
                        inner.signals[sib_idx].subscribed = false;
                        inner.signals[sib_idx].stream = None;
                        emit_unsubscribe_ack(&inner, sib_idx, stream);
                        source.on_unsubscribe(&sib_name);
                    }
                }
            }
        }

        inner.signals[idx].subscribed = false;
        inner.signals[idx].stream = None;
        emit_unsubscribe_ack(&inner, idx, stream);
        source.on_unsubscribe(signal_id);

        Ok(())
    }

    /// Build and emit one `available` meta listing every available,
    /// not-yet-subscribed signal.
    pub fn send_all_avail(&self, stream: &StreamHandle) {
        let inner = self.inner.lock();
        let ids: Vec<&str> = inner
            .signals
            .iter()
            .filter(|s| s.available && !s.subscribed)
            .map(|s| s.definition.name.as_str())
            .collect();
        let payload = meta::build_available_list("available", &ids);
        let _ = stream.send_meta(0, payload);
    }

    /// On disconnect: clear every signal pointing at `stream_id` and zero
    /// any table's subscribed_value_signal_count it touches. Invokes no
    /// host callbacks (spec §4.C) — the socket is already gone and callers
    /// targeting richer environments are advised to hold the lock anyway,
    /// which this implementation does.
    pub fn purge_stream(&self, stream_id: u64) {
        let mut inner = self.inner.lock();
        let mut touched_tables = std::collections::HashSet::new();
        for (i, signal) in inner.signals.iter_mut().enumerate() {
            if signal.stream == Some(stream_id) {
                signal.subscribed = false;
                signal.stream = None;
                if let Some(t) = signal.table {
                    touched_tables.insert(t);
                }
            }
            let _ = i;
        }
        for t in touched_tables {
            inner.tables[t].subscribed_value_signal_count = 0;
        }
    }

    #[cfg(test)]
    fn subscribed_value_count(&self, table_id: &str) -> u32 {
        let inner = self.inner.lock();
        inner
            .tables
            .iter()
            .find(|t| t.table_id == table_id)
            .map(|t| t.subscribed_value_signal_count)
            .unwrap_or(0)
    }

    /// Whether `name` is currently subscribed by any stream. Used by the
    /// demo producer to decide whether a signal's samples are worth
    /// serializing this tick.
    pub fn is_subscribed(&self, name: &str) -> bool {
        let inner = self.inner.lock();
        Self::find_index(&inner, name)
            .map(|i| inner.signals[i].subscribed)
            .unwrap_or(false)
    }
}

fn emit_subscribe_ack_and_definition(inner: &Inner, idx: usize, stream: &StreamHandle, value_index: u64) {
    let signal_no = (idx + 1) as u32;
    let name = &inner.signals[idx].definition.name;

    let ack = meta::build_subscribe_ack(name);
    let _ = stream.send_meta(signal_no, ack);

    let def = &inner.signals[idx].definition;
    let table = inner.signals[idx].table.map(|t| &inner.tables[t]);
    let related: Vec<(SignalType, String)> = match table {
        Some(t) if def.signal_type == SignalType::Value => t
            .range
            .clone()
            .filter(|&i| i != idx)
            .filter(|&i| inner.signals[i].definition.signal_type != SignalType::Value)
            .map(|i| {
                (
                    inner.signals[i].definition.signal_type,
                    inner.signals[i].definition.name.clone(),
                )
            })
            .collect(),
        _ => Vec::new(),
    };

    let definition_payload = meta::build_signal_definition(
        table.map(|t| t.table_id.as_str()),
        if value_index != 0 { Some(value_index) } else { None },
        &related,
        def,
    );
    let _ = stream.send_meta(signal_no, definition_payload);
}

fn emit_unsubscribe_ack(inner: &Inner, idx: usize, stream: &StreamHandle) {
    let signal_no = (idx + 1) as u32;
    let _ = inner;
    let ack = meta::build_unsubscribe_ack();
    let _ = stream.send_meta(signal_no, ack);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::stream::test_support::noop_stream_handle;

    struct NoopSource;
    impl SampleSource for NoopSource {}

    #[test]
    fn s4_value_subscribe_pulls_time_sibling_first() {
        let reg = SignalRegistry::new(12, 4, 32);
        let v = SignalDefinition::new("v", Rule::Explicit, DataType::Int32, SignalType::Value);
        let ts = SignalDefinition::new("ts", Rule::Explicit, DataType::UInt64, SignalType::Time);
        reg.add_table(vec![v, ts], "t").unwrap();

        let stream = noop_stream_handle(1);
        reg.subscribe(&stream, "v", &NoopSource).unwrap();

        assert!(reg.is_subscribed("v"));
        assert!(reg.is_subscribed("ts"));
        assert_eq!(reg.subscribed_value_count("t"), 1);
    }

    #[test]
    fn s5_unsubscribe_value_cascades_to_siblings() {
        let reg = SignalRegistry::new(12, 4, 32);
        let v = SignalDefinition::new("v", Rule::Explicit, DataType::Int32, SignalType::Value);
        let ts = SignalDefinition::new("ts", Rule::Explicit, DataType::UInt64, SignalType::Time);
        reg.add_table(vec![v, ts], "t").unwrap();

        let stream = noop_stream_handle(1);
        reg.subscribe(&stream, "v", &NoopSource).unwrap();
        reg.unsubscribe(&stream, "v", &NoopSource).unwrap();

        assert!(!reg.is_subscribed("v"));
        assert!(!reg.is_subscribed("ts"));
        assert_eq!(reg.subscribed_value_count("t"), 0);
    }

    #[test]
    fn subscribing_unknown_signal_fails_not_found() {
        let reg = SignalRegistry::new(12, 4, 32);
        let stream = noop_stream_handle(1);
        let err = reg.subscribe(&stream, "nope", &NoopSource).unwrap_err();
        assert_eq!(err, RegistryError::NotFound("nope".into()));
    }

    #[test]
    fn double_subscribe_fails() {
        let reg = SignalRegistry::new(12, 4, 32);
        reg.add_signal(SignalDefinition::new(
            "v1",
            Rule::Explicit,
            DataType::Int32,
            SignalType::Value,
        ))
        .unwrap();
        let stream = noop_stream_handle(1);
        reg.subscribe(&stream, "v1", &NoopSource).unwrap();
        let err = reg.subscribe(&stream, "v1", &NoopSource).unwrap_err();
        assert_eq!(err, RegistryError::AlreadySubscribed("v1".into()));
    }

    #[test]
    fn add_table_with_empty_defs_returns_none() {
        let reg = SignalRegistry::new(12, 4, 32);
        assert!(reg.add_table(vec![], "empty").is_none());
    }

    #[test]
    fn add_signal_rejects_name_over_signal_name_length() {
        let reg = SignalRegistry::new(12, 4, 4);
        let over_limit = SignalDefinition::new(
            "toolong",
            Rule::Explicit,
            DataType::Int8,
            SignalType::Value,
        );
        assert!(reg.add_signal(over_limit).is_none());

        let within_limit =
            SignalDefinition::new("ok", Rule::Explicit, DataType::Int8, SignalType::Value);
        assert!(reg.add_signal(within_limit).is_some());
    }

    #[test]
    fn add_table_rejects_any_oversized_sibling_name() {
        let reg = SignalRegistry::new(12, 4, 4);
        let v = SignalDefinition::new("v", Rule::Explicit, DataType::Int32, SignalType::Value);
        let ts = SignalDefinition::new(
            "toolongname",
            Rule::Explicit,
            DataType::UInt64,
            SignalType::Time,
        );
        assert!(reg.add_table(vec![v, ts], "t").is_none());
    }

    #[test]
    fn purge_stream_clears_subscriptions_and_zeroes_counts() {
        let reg = SignalRegistry::new(12, 4, 32);
        let v = SignalDefinition::new("v", Rule::Explicit, DataType::Int32, SignalType::Value);
        let ts = SignalDefinition::new("ts", Rule::Explicit, DataType::UInt64, SignalType::Time);
        reg.add_table(vec![v, ts], "t").unwrap();

        let stream = noop_stream_handle(1);
        reg.subscribe(&stream, "v", &NoopSource).unwrap();
        reg.purge_stream(stream.id());

        assert!(!reg.is_subscribed("v"));
        assert!(!reg.is_subscribed("ts"));
        assert_eq!(reg.subscribed_value_count("t"), 0);
    }

    #[test]
    fn signal_no_is_one_based_and_stable() {
        let reg = SignalRegistry::new(12, 4, 32);
        reg.add_signal(SignalDefinition::new(
            "a",
            Rule::Explicit,
            DataType::Int8,
            SignalType::Value,
        ))
        .unwrap();
        reg.add_signal(SignalDefinition::new(
            "b",
            Rule::Explicit,
            DataType::Int8,
            SignalType::Value,
        ))
        .unwrap();
        assert_eq!(reg.signal_no("a"), Some(1));
        assert_eq!(reg.signal_no("b"), Some(2));
    }

    #[test]
    fn resolution_denom_matches_prime_exponent_formula() {
        let spec = TimeSpec {
            absolute_reference: None,
            prime_exponents: vec![1, 0, 1], // 2^1 * 3^0 * 5^1 = 10
        };
        assert_eq!(spec.resolution_denom(), 10);

        let empty = TimeSpec::default();
        assert_eq!(empty.resolution_denom(), 1);
    }
}
