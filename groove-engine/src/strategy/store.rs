//! Strategy storage trait and CozoDB implementation

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use cozo::DataValue;

use crate::error::{GrooveError, Result};
use crate::store::{
    GrooveDb, RelationDef, ScriptBatch, dv_float, dv_int, dv_opt_str, dv_str, dv_time, get_float,
    get_int, get_json, get_opt_str, get_str, get_time, get_uuid, params1,
};
use crate::types::{ContextType, EventId, LearningCategory, LearningId, SessionId};

use super::types::{
    InjectionStrategy, LearningStrategyOverride, OutcomeSource, StrategyDistribution,
    StrategyEvent, StrategyOutcome,
};

pub const STRATEGY_DISTRIBUTION: RelationDef = RelationDef {
    name: "strategy_distribution",
    keys: &[("category", "String"), ("context_type", "String")],
    values: &[
        ("weights_json", "String"),
        ("params_json", "String"),
        ("session_count", "Int"),
        ("updated_at", "Int"),
    ],
};

pub const LEARNING_STRATEGY_OVERRIDE: RelationDef = RelationDef {
    name: "learning_strategy_override",
    keys: &[("learning_id", "String")],
    values: &[
        ("base_category", "String"),
        ("specialized_weights_json", "String?"),
        ("specialized_params_json", "String?"),
        ("session_count", "Int"),
        ("updated_at", "Int"),
    ],
};

/// Audit log of applied outcomes; its key is the idempotency check
pub const STRATEGY_EVENT: RelationDef = RelationDef {
    name: "strategy_event",
    keys: &[("learning_id", "String"), ("session_id", "String")],
    values: &[
        ("event_id", "String"),
        ("source_event_id", "String"),
        ("context_type", "String"),
        ("strategy_json", "String"),
        ("value", "Float"),
        ("confidence", "Float"),
        ("source", "String"),
        ("recorded_at", "Int"),
    ],
};

pub const STRATEGY_SELECTION: RelationDef = RelationDef {
    name: "strategy_selection",
    keys: &[("session_id", "String"), ("learning_id", "String")],
    values: &[("strategy_json", "String"), ("selected_at", "Int")],
};

/// Every relation owned by the strategy subsystem
pub const RELATIONS: [&RelationDef; 4] = [
    &STRATEGY_DISTRIBUTION,
    &LEARNING_STRATEGY_OVERRIDE,
    &STRATEGY_EVENT,
    &STRATEGY_SELECTION,
];

/// Everything one strategy batch writes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyWrite {
    pub distributions: Vec<StrategyDistribution>,
    pub overrides: Vec<LearningStrategyOverride>,
    pub events: Vec<StrategyEvent>,
    /// Recorded selections consumed by this batch, removed with it
    pub consumed_selections: Vec<(SessionId, LearningId)>,
}

impl StrategyWrite {
    pub fn is_empty(&self) -> bool {
        self.distributions.is_empty()
            && self.overrides.is_empty()
            && self.events.is_empty()
            && self.consumed_selections.is_empty()
    }
}

/// Storage interface for strategy data
#[async_trait]
pub trait StrategyStore: Send + Sync {
    // Distributions
    async fn load_distributions(&self) -> Result<Vec<StrategyDistribution>>;
    async fn get_distribution(
        &self,
        category: LearningCategory,
        context_type: ContextType,
    ) -> Result<Option<StrategyDistribution>>;
    async fn distributions_for_category(
        &self,
        category: LearningCategory,
    ) -> Result<Vec<StrategyDistribution>>;
    async fn put_distribution(&self, dist: &StrategyDistribution) -> Result<()>;

    // Learning overrides
    async fn load_overrides(&self) -> Result<Vec<LearningStrategyOverride>>;
    async fn get_override(&self, id: LearningId) -> Result<Option<LearningStrategyOverride>>;
    async fn put_override(&self, o: &LearningStrategyOverride) -> Result<()>;

    // Strategy events
    /// Whether an outcome for the pair has already been applied
    async fn has_event(&self, learning_id: LearningId, session_id: &SessionId) -> Result<bool>;
    /// Newest first
    async fn strategy_history(
        &self,
        learning_id: LearningId,
        limit: usize,
    ) -> Result<Vec<StrategyEvent>>;
    async fn session_events(&self, session_id: &SessionId) -> Result<Vec<StrategyEvent>>;

    // Selections
    async fn record_selection(
        &self,
        session_id: &SessionId,
        learning_id: LearningId,
        strategy: &InjectionStrategy,
    ) -> Result<()>;
    async fn get_selection(
        &self,
        session_id: &SessionId,
        learning_id: LearningId,
    ) -> Result<Option<InjectionStrategy>>;
    /// Drop a session's recorded selections; returns how many
    async fn clear_selections(&self, session_id: &SessionId) -> Result<usize>;

    /// Persist a batch atomically. An event for an already recorded
    /// (learning, session) pair is an invariant violation and lands nothing.
    async fn commit(&self, write: &StrategyWrite) -> Result<()>;
}

/// CozoDB-backed strategy store
pub struct CozoStrategyStore {
    db: GrooveDb,
}

impl CozoStrategyStore {
    /// Wrap a database, creating the strategy relations if needed
    pub fn new(db: GrooveDb) -> Result<Self> {
        db.ensure_relations(&RELATIONS)?;
        Ok(Self { db })
    }

    fn query_distributions(
        &self,
        query: &str,
        params: BTreeMap<String, DataValue>,
    ) -> Result<Vec<StrategyDistribution>> {
        self.db
            .run_query(query, params)?
            .rows
            .iter()
            .map(|row| parse_distribution_row(row))
            .collect()
    }

    fn query_events(
        &self,
        query: &str,
        params: BTreeMap<String, DataValue>,
    ) -> Result<Vec<StrategyEvent>> {
        self.db
            .run_query(query, params)?
            .rows
            .iter()
            .map(|row| parse_event_row(row))
            .collect()
    }
}

#[async_trait]
impl StrategyStore for CozoStrategyStore {
    async fn load_distributions(&self) -> Result<Vec<StrategyDistribution>> {
        self.query_distributions(&STRATEGY_DISTRIBUTION.select(""), BTreeMap::new())
    }

    async fn get_distribution(
        &self,
        category: LearningCategory,
        context_type: ContextType,
    ) -> Result<Option<StrategyDistribution>> {
        let params = BTreeMap::from([
            ("cat".to_string(), dv_str(category.as_str())),
            ("ctx".to_string(), dv_str(context_type.as_str())),
        ]);
        let dists = self.query_distributions(
            &STRATEGY_DISTRIBUTION.select("category = $cat, context_type = $ctx"),
            params,
        )?;
        Ok(dists.into_iter().next())
    }

    async fn distributions_for_category(
        &self,
        category: LearningCategory,
    ) -> Result<Vec<StrategyDistribution>> {
        self.query_distributions(
            &STRATEGY_DISTRIBUTION.select("category = $cat"),
            params1("cat", dv_str(category.as_str())),
        )
    }

    async fn put_distribution(&self, dist: &StrategyDistribution) -> Result<()> {
        let mut batch = ScriptBatch::new();
        batch.put(&STRATEGY_DISTRIBUTION, vec![distribution_row(dist)?]);
        self.db.commit(batch)
    }

    async fn load_overrides(&self) -> Result<Vec<LearningStrategyOverride>> {
        self.db
            .run_query(&LEARNING_STRATEGY_OVERRIDE.select(""), BTreeMap::new())?
            .rows
            .iter()
            .map(|row| parse_override_row(row))
            .collect()
    }

    async fn get_override(&self, id: LearningId) -> Result<Option<LearningStrategyOverride>> {
        let rows = self.db.run_query(
            &LEARNING_STRATEGY_OVERRIDE.select("learning_id = $lid"),
            params1("lid", dv_str(id.to_string())),
        )?;
        rows.rows.first().map(|row| parse_override_row(row)).transpose()
    }

    async fn put_override(&self, o: &LearningStrategyOverride) -> Result<()> {
        let mut batch = ScriptBatch::new();
        batch.put(&LEARNING_STRATEGY_OVERRIDE, vec![override_row(o)?]);
        self.db.commit(batch)
    }

    async fn has_event(&self, learning_id: LearningId, session_id: &SessionId) -> Result<bool> {
        let params = BTreeMap::from([
            ("lid".to_string(), dv_str(learning_id.to_string())),
            ("sid".to_string(), dv_str(session_id.as_str())),
        ]);
        let rows = self.db.run_query(
            &STRATEGY_EVENT.select("learning_id = $lid, session_id = $sid"),
            params,
        )?;
        Ok(!rows.rows.is_empty())
    }

    async fn strategy_history(
        &self,
        learning_id: LearningId,
        limit: usize,
    ) -> Result<Vec<StrategyEvent>> {
        let query = format!(
            "{}\n:order -recorded_at\n:limit {limit}",
            STRATEGY_EVENT.select("learning_id = $lid")
        );
        self.query_events(&query, params1("lid", dv_str(learning_id.to_string())))
    }

    async fn session_events(&self, session_id: &SessionId) -> Result<Vec<StrategyEvent>> {
        let mut events = self.query_events(
            &STRATEGY_EVENT.select("session_id = $sid"),
            params1("sid", dv_str(session_id.as_str())),
        )?;
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn record_selection(
        &self,
        session_id: &SessionId,
        learning_id: LearningId,
        strategy: &InjectionStrategy,
    ) -> Result<()> {
        let mut batch = ScriptBatch::new();
        batch.put(
            &STRATEGY_SELECTION,
            vec![vec![
                dv_str(session_id.as_str()),
                dv_str(learning_id.to_string()),
                dv_str(serde_json::to_string(strategy)?),
                dv_time(Utc::now()),
            ]],
        );
        self.db.commit(batch)
    }

    async fn get_selection(
        &self,
        session_id: &SessionId,
        learning_id: LearningId,
    ) -> Result<Option<InjectionStrategy>> {
        let params = BTreeMap::from([
            ("sid".to_string(), dv_str(session_id.as_str())),
            ("lid".to_string(), dv_str(learning_id.to_string())),
        ]);
        let rows = self.db.run_query(
            &STRATEGY_SELECTION.select("session_id = $sid, learning_id = $lid"),
            params,
        )?;
        rows.rows
            .first()
            .map(|row| get_json(row, 2, "strategy_json"))
            .transpose()
    }

    async fn clear_selections(&self, session_id: &SessionId) -> Result<usize> {
        let rows = self.db.run_query(
            &STRATEGY_SELECTION.select("session_id = $sid"),
            params1("sid", dv_str(session_id.as_str())),
        )?;
        let keys: Vec<Vec<DataValue>> = rows
            .rows
            .iter()
            .map(|row| row.iter().take(2).cloned().collect())
            .collect();
        let count = keys.len();

        let mut batch = ScriptBatch::new();
        batch.remove(&STRATEGY_SELECTION, keys);
        self.db.commit(batch)?;
        Ok(count)
    }

    async fn commit(&self, write: &StrategyWrite) -> Result<()> {
        if write.is_empty() {
            return Ok(());
        }

        for event in &write.events {
            if self.has_event(event.learning_id, &event.session_id).await? {
                return Err(GrooveError::InvariantViolation(format!(
                    "strategy outcome for learning {} in session {} already applied",
                    event.learning_id, event.session_id
                )));
            }
        }

        let mut batch = ScriptBatch::new();
        batch.put(
            &STRATEGY_DISTRIBUTION,
            write
                .distributions
                .iter()
                .map(distribution_row)
                .collect::<Result<Vec<_>>>()?,
        );
        batch.put(
            &LEARNING_STRATEGY_OVERRIDE,
            write
                .overrides
                .iter()
                .map(override_row)
                .collect::<Result<Vec<_>>>()?,
        );
        batch.insert(
            &STRATEGY_EVENT,
            write
                .events
                .iter()
                .map(event_row)
                .collect::<Result<Vec<_>>>()?,
        );
        batch.remove(
            &STRATEGY_SELECTION,
            write
                .consumed_selections
                .iter()
                .map(|(sid, lid)| vec![dv_str(sid.as_str()), dv_str(lid.to_string())])
                .collect(),
        );
        self.db.commit(batch)
    }
}

/// Resolves which strategy a learning was delivered with in a session
#[async_trait]
pub trait UsedStrategyProvider: Send + Sync {
    async fn used_strategy(
        &self,
        session_id: &SessionId,
        learning_id: LearningId,
    ) -> Result<Option<InjectionStrategy>>;
}

/// Looks the strategy up in the recorded selections
pub struct RecordedSelections(pub Arc<dyn StrategyStore>);

#[async_trait]
impl UsedStrategyProvider for RecordedSelections {
    async fn used_strategy(
        &self,
        session_id: &SessionId,
        learning_id: LearningId,
    ) -> Result<Option<InjectionStrategy>> {
        self.0.get_selection(session_id, learning_id).await
    }
}

fn count(row: &[DataValue], idx: usize, col: &str) -> Result<u32> {
    u32::try_from(get_int(row, idx, col)?)
        .map_err(|_| GrooveError::Database(format!("Invalid {col}")))
}

fn parse_category(row: &[DataValue], idx: usize, col: &str) -> Result<LearningCategory> {
    get_str(row, idx, col)?
        .parse()
        .map_err(|e| GrooveError::Database(format!("Invalid {col}: {e}")))
}

fn parse_context_type(row: &[DataValue], idx: usize, col: &str) -> Result<ContextType> {
    let s = get_str(row, idx, col)?;
    ContextType::parse(&s).ok_or_else(|| GrooveError::Database(format!("Invalid {col}: {s}")))
}

fn distribution_row(d: &StrategyDistribution) -> Result<Vec<DataValue>> {
    Ok(vec![
        dv_str(d.category.as_str()),
        dv_str(d.context_type.as_str()),
        dv_str(serde_json::to_string(&d.strategy_weights)?),
        dv_str(serde_json::to_string(&d.strategy_params)?),
        dv_int(i64::from(d.session_count)),
        dv_time(d.updated_at),
    ])
}

fn parse_distribution_row(row: &[DataValue]) -> Result<StrategyDistribution> {
    Ok(StrategyDistribution {
        category: parse_category(row, 0, "category")?,
        context_type: parse_context_type(row, 1, "context_type")?,
        strategy_weights: get_json(row, 2, "weights_json")?,
        strategy_params: get_json(row, 3, "params_json")?,
        session_count: count(row, 4, "session_count")?,
        updated_at: get_time(row, 5, "updated_at")?,
    })
}

fn override_row(o: &LearningStrategyOverride) -> Result<Vec<DataValue>> {
    let weights = o
        .specialized_weights
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let params = o
        .specialized_params
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    Ok(vec![
        dv_str(o.learning_id.to_string()),
        dv_str(o.base_category.as_str()),
        dv_opt_str(weights.as_deref()),
        dv_opt_str(params.as_deref()),
        dv_int(i64::from(o.session_count)),
        dv_time(o.updated_at),
    ])
}

fn parse_override_row(row: &[DataValue]) -> Result<LearningStrategyOverride> {
    Ok(LearningStrategyOverride {
        learning_id: get_uuid(row, 0, "learning_id")?,
        base_category: parse_category(row, 1, "base_category")?,
        specialized_weights: get_opt_str(row, 2, "specialized_weights_json")?
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        specialized_params: get_opt_str(row, 3, "specialized_params_json")?
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        session_count: count(row, 4, "session_count")?,
        updated_at: get_time(row, 5, "updated_at")?,
    })
}

fn event_row(e: &StrategyEvent) -> Result<Vec<DataValue>> {
    Ok(vec![
        dv_str(e.learning_id.to_string()),
        dv_str(e.session_id.as_str()),
        dv_str(e.event_id.to_string()),
        dv_str(e.source_event_id.to_string()),
        dv_str(e.context_type.as_str()),
        dv_str(serde_json::to_string(&e.strategy)?),
        dv_float(e.outcome.value),
        dv_float(e.outcome.confidence),
        dv_str(e.outcome.source.as_str()),
        dv_time(e.timestamp),
    ])
}

fn parse_event_row(row: &[DataValue]) -> Result<StrategyEvent> {
    let event_id = |idx, col| -> Result<EventId> {
        get_str(row, idx, col)?
            .parse()
            .map_err(|e| GrooveError::Database(format!("Invalid {col}: {e}")))
    };
    let source: OutcomeSource = get_str(row, 8, "source")?
        .parse()
        .map_err(GrooveError::Database)?;
    Ok(StrategyEvent {
        learning_id: get_uuid(row, 0, "learning_id")?,
        session_id: SessionId::from(get_str(row, 1, "session_id")?),
        event_id: event_id(2, "event_id")?,
        source_event_id: event_id(3, "source_event_id")?,
        context_type: parse_context_type(row, 4, "context_type")?,
        strategy: get_json(row, 5, "strategy_json")?,
        outcome: StrategyOutcome {
            value: get_float(row, 6, "value")?,
            confidence: get_float(row, 7, "confidence")?,
            source,
        },
        timestamp: get_time(row, 9, "recorded_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::types::{
        ContextPosition, DeferralTrigger, InjectionFormat, StrategyVariant, SubagentType,
    };
    use uuid::Uuid;

    fn store() -> CozoStrategyStore {
        CozoStrategyStore::new(GrooveDb::open_mem().unwrap()).unwrap()
    }

    fn main_context() -> InjectionStrategy {
        InjectionStrategy::MainContext {
            position: ContextPosition::Contextual,
            format: InjectionFormat::Tagged,
        }
    }

    fn event(learning_id: LearningId, session: &str) -> StrategyEvent {
        StrategyEvent::new(
            EventId::new(),
            learning_id,
            SessionId::from(session),
            ContextType::Interactive,
            main_context(),
            StrategyOutcome::new(0.6, 0.8, OutcomeSource::Both),
        )
    }

    #[tokio::test]
    async fn distribution_roundtrip_and_category_scan() {
        let store = store();
        let mut dist = StrategyDistribution::new(LearningCategory::Correction, ContextType::Batch);
        dist.observe(
            &main_context(),
            &StrategyOutcome::new(0.9, 0.9, OutcomeSource::Attribution),
        );
        store.put_distribution(&dist).await.unwrap();
        store
            .put_distribution(&StrategyDistribution::new(
                LearningCategory::Correction,
                ContextType::Planning,
            ))
            .await
            .unwrap();
        store
            .put_distribution(&StrategyDistribution::new(
                LearningCategory::Pattern,
                ContextType::Batch,
            ))
            .await
            .unwrap();

        let loaded = store
            .get_distribution(LearningCategory::Correction, ContextType::Batch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.strategy_weights, dist.strategy_weights);
        assert_eq!(loaded.strategy_params, dist.strategy_params);
        assert_eq!(loaded.session_count, 1);

        let correction = store
            .distributions_for_category(LearningCategory::Correction)
            .await
            .unwrap();
        assert_eq!(correction.len(), 2);
        assert_eq!(store.load_distributions().await.unwrap().len(), 3);
        assert!(
            store
                .get_distribution(LearningCategory::Preference, ContextType::Batch)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn override_roundtrip_both_states() {
        let store = store();
        let inheriting = LearningStrategyOverride::new(Uuid::now_v7(), LearningCategory::Pattern);
        let mut specialized =
            LearningStrategyOverride::new(Uuid::now_v7(), LearningCategory::Pattern);
        specialized.session_count = 20;
        specialized.specialize_from(&StrategyDistribution::new(
            LearningCategory::Pattern,
            ContextType::Interactive,
        ));

        store.put_override(&inheriting).await.unwrap();
        store.put_override(&specialized).await.unwrap();

        let a = store.get_override(inheriting.learning_id).await.unwrap().unwrap();
        assert!(!a.is_specialized());
        let b = store.get_override(specialized.learning_id).await.unwrap().unwrap();
        assert!(b.is_specialized());
        assert_eq!(b.session_count, 20);
        assert_eq!(b.specialized_weights, specialized.specialized_weights);
        assert_eq!(store.load_overrides().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn commit_is_atomic_and_events_are_immutable() {
        let store = store();
        let id = Uuid::now_v7();
        let first = StrategyWrite {
            distributions: vec![StrategyDistribution::new(
                LearningCategory::Preference,
                ContextType::Interactive,
            )],
            overrides: vec![LearningStrategyOverride::new(id, LearningCategory::Preference)],
            events: vec![event(id, "s1")],
            consumed_selections: vec![],
        };
        store.commit(&first).await.unwrap();
        assert!(store.has_event(id, &SessionId::from("s1")).await.unwrap());

        // replaying the same pair lands nothing, not even the distribution
        let mut dist = StrategyDistribution::new(LearningCategory::Preference, ContextType::Batch);
        dist.session_count = 9;
        let replay = StrategyWrite {
            distributions: vec![dist],
            overrides: vec![],
            events: vec![event(id, "s2"), event(id, "s1")],
            consumed_selections: vec![],
        };
        let err = store.commit(&replay).await.unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(!store.has_event(id, &SessionId::from("s2")).await.unwrap());
        assert!(
            store
                .get_distribution(LearningCategory::Preference, ContextType::Batch)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let store = store();
        let id = Uuid::now_v7();
        for (i, session) in ["s1", "s2", "s3"].iter().enumerate() {
            let mut e = event(id, session);
            e.timestamp = Utc::now() + chrono::Duration::seconds(i as i64);
            store
                .commit(&StrategyWrite {
                    events: vec![e],
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let history = store.strategy_history(id, 2).await.unwrap();
        let sessions: Vec<_> = history.iter().map(|e| e.session_id.as_str()).collect();
        assert_eq!(sessions, vec!["s3", "s2"]);
        assert_eq!(history[0].strategy.variant(), StrategyVariant::MainContext);
        assert_eq!(history[0].outcome.source, OutcomeSource::Both);

        let session = store.session_events(&SessionId::from("s1")).await.unwrap();
        assert_eq!(session.len(), 1);
    }

    #[tokio::test]
    async fn selections_record_and_clear() {
        let store = Arc::new(store());
        let sid = SessionId::from("s1");
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let deferred = InjectionStrategy::Deferred {
            trigger: DeferralTrigger::MessageCount(5),
            max_wait_ms: Some(60_000),
        };
        let subagent = InjectionStrategy::Subagent {
            agent_type: SubagentType::Explorer,
            blocking: true,
        };
        store.record_selection(&sid, a, &deferred).await.unwrap();
        store.record_selection(&sid, b, &subagent).await.unwrap();

        let provider = RecordedSelections(store.clone());
        assert_eq!(provider.used_strategy(&sid, a).await.unwrap(), Some(deferred));
        assert_eq!(provider.used_strategy(&sid, b).await.unwrap(), Some(subagent));

        assert_eq!(store.clear_selections(&sid).await.unwrap(), 2);
        assert_eq!(store.get_selection(&sid, a).await.unwrap(), None);
        assert_eq!(store.clear_selections(&sid).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn commit_removes_consumed_selections() {
        let store = store();
        let sid = SessionId::from("s1");
        let used = Uuid::now_v7();
        let pending = Uuid::now_v7();
        let strategy = InjectionStrategy::MainContext {
            position: ContextPosition::Prefix,
            format: InjectionFormat::Plain,
        };
        store.record_selection(&sid, used, &strategy).await.unwrap();
        store.record_selection(&sid, pending, &strategy).await.unwrap();

        store
            .commit(&StrategyWrite {
                events: vec![event(used, "s1")],
                consumed_selections: vec![(sid.clone(), used)],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(store.get_selection(&sid, used).await.unwrap(), None);
        assert_eq!(store.get_selection(&sid, pending).await.unwrap(), Some(strategy));
    }
}
