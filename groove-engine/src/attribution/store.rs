//! Attribution storage trait and CozoDB implementation

use std::collections::BTreeMap;

use async_trait::async_trait;
use cozo::DataValue;
use tokio::sync::Mutex;

use crate::error::{GrooveError, Result};
use crate::store::{
    GrooveDb, RelationDef, ScriptBatch, dv_bool, dv_float, dv_int, dv_opt_float, dv_opt_str,
    dv_str, dv_time, get_bool, get_float, get_int, get_json, get_opt_float, get_opt_str, get_str,
    get_time, get_uuid, params1,
};
use crate::types::{EventId, LearningId, LearningStatus, SessionId};

use super::types::{
    AblationExperiment, AblationResult, ArmAssignment, AttributionRecord, LearningValue,
};

pub const ATTRIBUTION: RelationDef = RelationDef {
    name: "attribution",
    keys: &[("learning_id", "String"), ("session_id", "String")],
    values: &[
        ("event_id", "String"),
        ("recorded_at", "Int"),
        ("was_activated", "Bool"),
        ("activation_confidence", "Float"),
        ("activation_signals_json", "String"),
        ("activation_degraded", "Bool"),
        ("temporal_positive", "Float"),
        ("temporal_negative", "Float"),
        ("net_temporal", "Float"),
        ("was_withheld", "Bool"),
        ("session_outcome", "Float"),
        ("attributed_value", "Float"),
    ],
};

pub const LEARNING_VALUE: RelationDef = RelationDef {
    name: "learning_value",
    keys: &[("learning_id", "String")],
    values: &[
        ("estimated_value", "Float"),
        ("confidence", "Float"),
        ("session_count", "Int"),
        ("activation_count", "Int"),
        ("activation_rate", "Float"),
        ("temporal_value", "Float"),
        ("temporal_confidence", "Float"),
        ("ablation_value", "Float?"),
        ("ablation_confidence", "Float?"),
        ("status", "String"),
        ("status_reason", "String?"),
        ("updated_at", "Int"),
    ],
};

pub const ABLATION_EXPERIMENT: RelationDef = RelationDef {
    name: "ablation_experiment",
    keys: &[("learning_id", "String")],
    values: &[
        ("started_at", "Int"),
        ("sessions_with_json", "String"),
        ("sessions_without_json", "String"),
        ("marginal_value", "Float?"),
        ("result_confidence", "Float?"),
        ("p_value", "Float?"),
        ("is_significant", "Bool?"),
    ],
};

pub const ABLATION_ASSIGNMENT: RelationDef = RelationDef {
    name: "ablation_assignment",
    keys: &[("learning_id", "String"), ("session_id", "String")],
    values: &[
        ("withheld", "Bool"),
        ("sequence", "Int"),
        ("assigned_at", "Int"),
    ],
};

/// Every relation owned by the attribution engine
pub const RELATIONS: [&RelationDef; 4] = [
    &ATTRIBUTION,
    &LEARNING_VALUE,
    &ABLATION_EXPERIMENT,
    &ABLATION_ASSIGNMENT,
];

/// Everything one processed session-close event writes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributionWrite {
    pub records: Vec<AttributionRecord>,
    pub values: Vec<LearningValue>,
    pub experiments: Vec<AblationExperiment>,
}

impl AttributionWrite {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.values.is_empty() && self.experiments.is_empty()
    }
}

/// Storage interface for attribution data
#[async_trait]
pub trait AttributionStore: Send + Sync {
    async fn get_attribution(
        &self,
        learning_id: LearningId,
        session_id: &SessionId,
    ) -> Result<Option<AttributionRecord>>;
    /// Oldest first
    async fn attributions_for_learning(&self, id: LearningId) -> Result<Vec<AttributionRecord>>;
    async fn attributions_for_session(&self, id: &SessionId) -> Result<Vec<AttributionRecord>>;

    async fn get_learning_value(&self, id: LearningId) -> Result<Option<LearningValue>>;
    async fn list_learning_values(&self, limit: usize) -> Result<Vec<LearningValue>>;
    /// Values whose status matches `LearningStatus::as_str`
    async fn learning_values_with_status(&self, status: &str) -> Result<Vec<LearningValue>>;
    async fn put_learning_value(&self, value: &LearningValue) -> Result<()>;

    async fn get_experiment(&self, id: LearningId) -> Result<Option<AblationExperiment>>;

    async fn get_assignment(
        &self,
        learning_id: LearningId,
        session_id: &SessionId,
    ) -> Result<Option<ArmAssignment>>;
    /// Number of arm assignments made for a learning
    async fn assignment_count(&self, learning_id: LearningId) -> Result<u64>;
    /// Record `assignment` if the learning still has `expected` assignments.
    ///
    /// `Ok(false)` on a sequence conflict; an existing assignment for the
    /// same session is an invariant violation.
    async fn compare_and_set_assignment(
        &self,
        expected: u64,
        assignment: &ArmAssignment,
    ) -> Result<bool>;

    /// Persist a write set atomically. Existing attribution records are
    /// never overwritten.
    async fn commit(&self, write: &AttributionWrite) -> Result<()>;
}

/// CozoDB-backed attribution store
pub struct CozoAttributionStore {
    db: GrooveDb,
    assignment_lock: Mutex<()>,
}

impl CozoAttributionStore {
    /// Wrap a database, creating the attribution relations if needed
    pub fn new(db: GrooveDb) -> Result<Self> {
        db.ensure_relations(&RELATIONS)?;
        Ok(Self {
            db,
            assignment_lock: Mutex::new(()),
        })
    }

    fn query_records(&self, conditions: &str, param: (&str, DataValue)) -> Result<Vec<AttributionRecord>> {
        let rows = self
            .db
            .run_query(&ATTRIBUTION.select(conditions), params1(param.0, param.1))?;
        let mut records = rows
            .rows
            .iter()
            .map(|row| parse_attribution_row(row))
            .collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|r| r.recorded_at);
        Ok(records)
    }

    fn query_values(
        &self,
        query: &str,
        params: BTreeMap<String, DataValue>,
    ) -> Result<Vec<LearningValue>> {
        self.db
            .run_query(query, params)?
            .rows
            .iter()
            .map(|row| parse_learning_value_row(row))
            .collect()
    }
}

#[async_trait]
impl AttributionStore for CozoAttributionStore {
    async fn get_attribution(
        &self,
        learning_id: LearningId,
        session_id: &SessionId,
    ) -> Result<Option<AttributionRecord>> {
        let params = BTreeMap::from([
            ("lid".to_string(), dv_str(learning_id.to_string())),
            ("sid".to_string(), dv_str(session_id.as_str())),
        ]);
        let rows = self.db.run_query(
            &ATTRIBUTION.select("learning_id = $lid, session_id = $sid"),
            params,
        )?;
        rows.rows.first().map(|row| parse_attribution_row(row)).transpose()
    }

    async fn attributions_for_learning(&self, id: LearningId) -> Result<Vec<AttributionRecord>> {
        self.query_records("learning_id = $lid", ("lid", dv_str(id.to_string())))
    }

    async fn attributions_for_session(&self, id: &SessionId) -> Result<Vec<AttributionRecord>> {
        self.query_records("session_id = $sid", ("sid", dv_str(id.as_str())))
    }

    async fn get_learning_value(&self, id: LearningId) -> Result<Option<LearningValue>> {
        let values = self.query_values(
            &LEARNING_VALUE.select("learning_id = $lid"),
            params1("lid", dv_str(id.to_string())),
        )?;
        Ok(values.into_iter().next())
    }

    async fn list_learning_values(&self, limit: usize) -> Result<Vec<LearningValue>> {
        let query = format!(
            "{}\n:sort estimated_value\n:limit {limit}",
            LEARNING_VALUE.select("")
        );
        self.query_values(&query, BTreeMap::new())
    }

    async fn learning_values_with_status(&self, status: &str) -> Result<Vec<LearningValue>> {
        self.query_values(
            &LEARNING_VALUE.select("status = $status"),
            params1("status", dv_str(status)),
        )
    }

    async fn put_learning_value(&self, value: &LearningValue) -> Result<()> {
        let mut batch = ScriptBatch::new();
        batch.put(&LEARNING_VALUE, vec![learning_value_row(value)]);
        self.db.commit(batch)
    }

    async fn get_experiment(&self, id: LearningId) -> Result<Option<AblationExperiment>> {
        let rows = self.db.run_query(
            &ABLATION_EXPERIMENT.select("learning_id = $lid"),
            params1("lid", dv_str(id.to_string())),
        )?;
        rows.rows.first().map(|row| parse_experiment_row(row)).transpose()
    }

    async fn get_assignment(
        &self,
        learning_id: LearningId,
        session_id: &SessionId,
    ) -> Result<Option<ArmAssignment>> {
        let params = BTreeMap::from([
            ("lid".to_string(), dv_str(learning_id.to_string())),
            ("sid".to_string(), dv_str(session_id.as_str())),
        ]);
        let rows = self.db.run_query(
            &ABLATION_ASSIGNMENT.select("learning_id = $lid, session_id = $sid"),
            params,
        )?;
        rows.rows.first().map(|row| parse_assignment_row(row)).transpose()
    }

    async fn assignment_count(&self, learning_id: LearningId) -> Result<u64> {
        let rows = self.db.run_query(
            &ABLATION_ASSIGNMENT.select("learning_id = $lid"),
            params1("lid", dv_str(learning_id.to_string())),
        )?;
        Ok(rows.rows.len() as u64)
    }

    async fn compare_and_set_assignment(
        &self,
        expected: u64,
        assignment: &ArmAssignment,
    ) -> Result<bool> {
        let _guard = self.assignment_lock.lock().await;

        if self
            .get_assignment(assignment.learning_id, &assignment.session_id)
            .await?
            .is_some()
        {
            return Err(GrooveError::InvariantViolation(format!(
                "ablation arm for learning {} in session {} already assigned",
                assignment.learning_id, assignment.session_id
            )));
        }
        if self.assignment_count(assignment.learning_id).await? != expected {
            return Ok(false);
        }

        let mut batch = ScriptBatch::new();
        batch.insert(
            &ABLATION_ASSIGNMENT,
            vec![vec![
                dv_str(assignment.learning_id.to_string()),
                dv_str(assignment.session_id.as_str()),
                dv_bool(assignment.withheld),
                dv_int(assignment.sequence as i64),
                dv_time(assignment.assigned_at),
            ]],
        );
        self.db.commit(batch)?;
        Ok(true)
    }

    async fn commit(&self, write: &AttributionWrite) -> Result<()> {
        if write.is_empty() {
            return Ok(());
        }

        for record in &write.records {
            if self
                .get_attribution(record.learning_id, &record.session_id)
                .await?
                .is_some()
            {
                return Err(GrooveError::InvariantViolation(format!(
                    "attribution for learning {} in session {} is immutable",
                    record.learning_id, record.session_id
                )));
            }
        }

        let mut batch = ScriptBatch::new();
        batch.insert(
            &ATTRIBUTION,
            write
                .records
                .iter()
                .map(attribution_row)
                .collect::<Result<Vec<_>>>()?,
        );
        batch.put(
            &LEARNING_VALUE,
            write.values.iter().map(learning_value_row).collect(),
        );
        batch.put(
            &ABLATION_EXPERIMENT,
            write
                .experiments
                .iter()
                .map(experiment_row)
                .collect::<Result<Vec<_>>>()?,
        );
        self.db.commit(batch)
    }
}

fn attribution_row(r: &AttributionRecord) -> Result<Vec<DataValue>> {
    Ok(vec![
        dv_str(r.learning_id.to_string()),
        dv_str(r.session_id.as_str()),
        dv_str(r.event_id.to_string()),
        dv_time(r.recorded_at),
        dv_bool(r.was_activated),
        dv_float(r.activation_confidence),
        dv_str(serde_json::to_string(&r.activation_signals)?),
        dv_bool(r.activation_degraded),
        dv_float(r.temporal_positive),
        dv_float(r.temporal_negative),
        dv_float(r.net_temporal),
        dv_bool(r.was_withheld),
        dv_float(r.session_outcome),
        dv_float(r.attributed_value),
    ])
}

fn parse_attribution_row(row: &[DataValue]) -> Result<AttributionRecord> {
    let event_id: EventId = get_str(row, 2, "event_id")?
        .parse()
        .map_err(|e| GrooveError::Database(format!("Invalid event_id: {e}")))?;
    Ok(AttributionRecord {
        learning_id: get_uuid(row, 0, "learning_id")?,
        session_id: SessionId::from(get_str(row, 1, "session_id")?),
        event_id,
        recorded_at: get_time(row, 3, "recorded_at")?,
        was_activated: get_bool(row, 4, "was_activated")?,
        activation_confidence: get_float(row, 5, "activation_confidence")?,
        activation_signals: get_json(row, 6, "activation_signals_json")?,
        activation_degraded: get_bool(row, 7, "activation_degraded")?,
        temporal_positive: get_float(row, 8, "temporal_positive")?,
        temporal_negative: get_float(row, 9, "temporal_negative")?,
        net_temporal: get_float(row, 10, "net_temporal")?,
        was_withheld: get_bool(row, 11, "was_withheld")?,
        session_outcome: get_float(row, 12, "session_outcome")?,
        attributed_value: get_float(row, 13, "attributed_value")?,
    })
}

fn learning_value_row(v: &LearningValue) -> Vec<DataValue> {
    let reason = match &v.status {
        LearningStatus::Deprecated { reason } => Some(reason.as_str()),
        _ => None,
    };
    vec![
        dv_str(v.learning_id.to_string()),
        dv_float(v.estimated_value),
        dv_float(v.confidence),
        dv_int(i64::from(v.session_count)),
        dv_int(i64::from(v.activation_count)),
        dv_float(v.activation_rate),
        dv_float(v.temporal_value),
        dv_float(v.temporal_confidence),
        dv_opt_float(v.ablation_value),
        dv_opt_float(v.ablation_confidence),
        dv_str(v.status.as_str()),
        dv_opt_str(reason),
        dv_time(v.updated_at),
    ]
}

fn parse_status(status: &str, reason: Option<String>) -> Result<LearningStatus> {
    match status {
        "active" => Ok(LearningStatus::Active),
        "disabled" => Ok(LearningStatus::Disabled),
        "deprecated" => Ok(LearningStatus::Deprecated {
            reason: reason.unwrap_or_default(),
        }),
        "under_review" => Ok(LearningStatus::UnderReview),
        other => Err(GrooveError::Database(format!("Unknown status: {other}"))),
    }
}

fn parse_learning_value_row(row: &[DataValue]) -> Result<LearningValue> {
    let count = |idx, col| -> Result<u32> {
        u32::try_from(get_int(row, idx, col)?)
            .map_err(|_| GrooveError::Database(format!("Invalid {col}")))
    };
    Ok(LearningValue {
        learning_id: get_uuid(row, 0, "learning_id")?,
        estimated_value: get_float(row, 1, "estimated_value")?,
        confidence: get_float(row, 2, "confidence")?,
        session_count: count(3, "session_count")?,
        activation_count: count(4, "activation_count")?,
        activation_rate: get_float(row, 5, "activation_rate")?,
        temporal_value: get_float(row, 6, "temporal_value")?,
        temporal_confidence: get_float(row, 7, "temporal_confidence")?,
        ablation_value: get_opt_float(row, 8, "ablation_value")?,
        ablation_confidence: get_opt_float(row, 9, "ablation_confidence")?,
        status: parse_status(
            &get_str(row, 10, "status")?,
            get_opt_str(row, 11, "status_reason")?,
        )?,
        updated_at: get_time(row, 12, "updated_at")?,
    })
}

fn experiment_row(e: &AblationExperiment) -> Result<Vec<DataValue>> {
    let result = e.result.as_ref();
    Ok(vec![
        dv_str(e.learning_id.to_string()),
        dv_time(e.started_at),
        dv_str(serde_json::to_string(&e.sessions_with)?),
        dv_str(serde_json::to_string(&e.sessions_without)?),
        dv_opt_float(result.map(|r| r.marginal_value)),
        dv_opt_float(result.map(|r| r.confidence)),
        dv_opt_float(result.map(|r| r.p_value)),
        result.map_or(DataValue::Null, |r| dv_bool(r.is_significant)),
    ])
}

fn parse_experiment_row(row: &[DataValue]) -> Result<AblationExperiment> {
    let result = match (
        get_opt_float(row, 4, "marginal_value")?,
        get_opt_float(row, 5, "result_confidence")?,
        get_opt_float(row, 6, "p_value")?,
    ) {
        (Some(marginal_value), Some(confidence), Some(p_value)) => Some(AblationResult {
            marginal_value,
            confidence,
            p_value,
            is_significant: get_bool(row, 7, "is_significant")?,
        }),
        _ => None,
    };
    Ok(AblationExperiment {
        learning_id: get_uuid(row, 0, "learning_id")?,
        started_at: get_time(row, 1, "started_at")?,
        sessions_with: get_json(row, 2, "sessions_with_json")?,
        sessions_without: get_json(row, 3, "sessions_without_json")?,
        result,
    })
}

fn parse_assignment_row(row: &[DataValue]) -> Result<ArmAssignment> {
    Ok(ArmAssignment {
        learning_id: get_uuid(row, 0, "learning_id")?,
        session_id: SessionId::from(get_str(row, 1, "session_id")?),
        withheld: get_bool(row, 2, "withheld")?,
        sequence: u64::try_from(get_int(row, 3, "sequence")?)
            .map_err(|_| GrooveError::Database("Invalid sequence".into()))?,
        assigned_at: get_time(row, 4, "assigned_at")?,
    })
}
